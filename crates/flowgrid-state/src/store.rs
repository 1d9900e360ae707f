//! StateStore — redb-backed orchestrator storage.
//!
//! Holds steps and worker pods the way a cluster API server would: status
//! writes are merge patches applied atomically inside a write transaction,
//! every write bumps a resource version that conditional patches can check,
//! pod creation rejects duplicate names, and deleting a step garbage-collects
//! its pods. Used by standalone mode and as the cluster in tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cluster::ClusterApi;
use crate::error::{ClusterError, ClusterResult};
use crate::patch::apply_merge_patch;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `ClusterError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| ClusterError::$variant(e.to_string())
    };
}

const EVENT_CAPACITY: usize = 1024;

/// Thread-safe orchestrator store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StepKey>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> ClusterResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> ClusterResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> ClusterResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> ClusterResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STEPS).map_err(map_err!(Table))?;
        txn.open_table(PODS).map_err(map_err!(Table))?;
        txn.open_table(EXECS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn notify(&self, key: StepKey) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(key);
    }

    // ── Steps ──────────────────────────────────────────────────────

    /// Create or replace a step. Assigns a uid on first write and bumps the
    /// resource version. Returns the stored object.
    pub fn put_step(&self, step: &Step) -> ClusterResult<Step> {
        let key = step.key();
        let table_key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let version = next_counter(&txn, "resource-version")?;
            let mut table = txn.open_table(STEPS).map_err(map_err!(Table))?;
            let existing_uid = match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let existing: Step =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Some(existing.metadata.uid)
                }
                None => None,
            };
            let mut stored = step.clone();
            stored.metadata.uid = match existing_uid {
                Some(uid) => uid,
                None if stored.metadata.uid.is_empty() => format!("step-{version}"),
                None => stored.metadata.uid,
            };
            stored.metadata.resource_version = version.to_string();
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(table_key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(step = %key, "step stored");
        self.notify(key);
        Ok(stored)
    }

    /// Get a step by key.
    pub fn load_step(&self, key: &StepKey) -> ClusterResult<Option<Step>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STEPS).map_err(map_err!(Table))?;
        match table.get(key.table_key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let step: Step =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(step))
            }
            None => Ok(None),
        }
    }

    /// List all steps.
    pub fn load_steps(&self) -> ClusterResult<Vec<Step>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STEPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let step: Step =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(step);
        }
        Ok(results)
    }

    /// Flag a step for deletion without removing it yet.
    pub fn mark_step_deleting(&self, key: &StepKey) -> ClusterResult<()> {
        let mut step = self
            .load_step(key)?
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        step.metadata.deletion_timestamp = Some(Utc::now());
        self.put_step(&step)?;
        Ok(())
    }

    /// Delete a step and garbage-collect its pods. Returns true if it existed.
    pub fn delete_step(&self, key: &StepKey) -> ClusterResult<bool> {
        let pod_prefix = format!("{}/", key.namespace);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (existed, pods_removed) = {
            let mut steps = txn.open_table(STEPS).map_err(map_err!(Table))?;
            let existed = steps
                .remove(key.table_key().as_str())
                .map_err(map_err!(Write))?
                .is_some();

            let mut pods = txn.open_table(PODS).map_err(map_err!(Table))?;
            let mut owned = Vec::new();
            for entry in pods.iter().map_err(map_err!(Read))? {
                let (pod_key, value) = entry.map_err(map_err!(Read))?;
                if !pod_key.value().starts_with(&pod_prefix) {
                    continue;
                }
                let pod: PodInfo =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if pod.step_name() == Some(key.name.as_str()) {
                    owned.push(pod.table_key());
                }
            }
            for pod_key in &owned {
                pods.remove(pod_key.as_str()).map_err(map_err!(Write))?;
            }
            (existed, owned.len())
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(step = %key, existed, pods_removed, "step deleted");
        self.notify(key.clone());
        Ok(existed)
    }

    fn patch_status(
        &self,
        key: &StepKey,
        patch: &Value,
        resource_version: Option<&str>,
    ) -> ClusterResult<Step> {
        let table_key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let step = {
            let version = next_counter(&txn, "resource-version")?;
            let mut table = txn.open_table(STEPS).map_err(map_err!(Table))?;
            let mut step: Step = match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(ClusterError::NotFound(key.to_string())),
            };
            if let Some(expected) = resource_version
                && step.metadata.resource_version != expected
            {
                return Err(ClusterError::Conflict(format!(
                    "{key}: resource version {expected} is stale (now {})",
                    step.metadata.resource_version
                )));
            }
            if let Some(status_patch) = patch.get("status") {
                let mut status =
                    serde_json::to_value(&step.status).map_err(map_err!(Serialize))?;
                apply_merge_patch(&mut status, status_patch);
                step.status = serde_json::from_value(status).map_err(map_err!(Deserialize))?;
            }
            step.metadata.resource_version = version.to_string();
            let value = serde_json::to_vec(&step).map_err(map_err!(Serialize))?;
            table
                .insert(table_key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            step
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(step = %key, version = %step.metadata.resource_version, "step status patched");
        self.notify(key.clone());
        Ok(step)
    }

    // ── Pods ───────────────────────────────────────────────────────

    /// Get a pod by namespace and name.
    pub fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Option<PodInfo>> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let pod: PodInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(pod))
            }
            None => Ok(None),
        }
    }

    fn load_pods(&self, namespace: &str, step_name: &str) -> ClusterResult<Vec<PodInfo>> {
        let prefix = format!("{namespace}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let pod: PodInfo =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if pod.step_name() == Some(step_name) {
                    results.push(pod);
                }
            }
        }
        Ok(results)
    }

    fn insert_pod(&self, pod: &WorkerPod) -> ClusterResult<()> {
        let key = format!("{}/{}", pod.namespace, pod.name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let uid = next_counter(&txn, "pod-uid")?;
            let mut table = txn.open_table(PODS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(ClusterError::AlreadyExists(key));
            }
            let info = pod.to_pod_info(format!("pod-{uid}"));
            let value = serde_json::to_vec(&info).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pod = %key, "pod created");
        if let Some(step) = pod.labels.get(KEY_STEP_NAME) {
            self.notify(StepKey::new(&pod.namespace, step));
        }
        Ok(())
    }

    fn remove_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: PodInfo = {
            let mut table = txn.open_table(PODS).map_err(map_err!(Table))?;
            let guard = table
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pod = %key, "pod deleted");
        if let Some(step) = removed.step_name() {
            self.notify(StepKey::new(namespace, step));
        }
        Ok(())
    }

    /// Record what the node agent observed for a pod.
    pub fn set_pod_status(
        &self,
        namespace: &str,
        name: &str,
        phase: PodPhase,
        message: &str,
        container_statuses: Vec<ContainerStatus>,
    ) -> ClusterResult<()> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let pod = {
            let mut table = txn.open_table(PODS).map_err(map_err!(Table))?;
            let mut pod: PodInfo = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(ClusterError::NotFound(key)),
            };
            pod.phase = phase;
            pod.message = message.to_string();
            pod.container_statuses = container_statuses;
            let value = serde_json::to_vec(&pod).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            pod
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(step) = pod.step_name() {
            self.notify(StepKey::new(namespace, step));
        }
        Ok(())
    }

    // ── Exec ───────────────────────────────────────────────────────

    fn record_exec(&self, request: &ExecRequest) -> ClusterResult<()> {
        let pod = self
            .get_pod(&request.namespace, &request.pod)?
            .ok_or_else(|| {
                ClusterError::NotFound(format!("{}/{}", request.namespace, request.pod))
            })?;
        let running = pod
            .container(&request.container)
            .is_some_and(|c| c.state == ContainerState::Running);
        if !running {
            return Err(ClusterError::ContainerNotFound(format!(
                "{}/{}: {}",
                request.namespace, request.pod, request.container
            )));
        }

        let value = serde_json::to_vec(request).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let seq = next_counter(&txn, "exec-seq")?;
            let key = format!("{seq:020}");
            let mut table = txn.open_table(EXECS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pod = %request.pod, container = %request.container, "exec recorded");
        Ok(())
    }

    /// Every exec request accepted so far, oldest first.
    pub fn exec_requests(&self) -> ClusterResult<Vec<ExecRequest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let request: ExecRequest =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(request);
        }
        Ok(results)
    }
}

/// Increment and return a named counter inside a write transaction.
fn next_counter(txn: &WriteTransaction, name: &str) -> ClusterResult<u64> {
    let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[async_trait]
impl ClusterApi for StateStore {
    async fn get_step(&self, key: &StepKey) -> ClusterResult<Option<Step>> {
        self.load_step(key)
    }

    async fn list_steps(&self) -> ClusterResult<Vec<Step>> {
        self.load_steps()
    }

    async fn patch_step_status(
        &self,
        key: &StepKey,
        patch: &Value,
        resource_version: Option<&str>,
    ) -> ClusterResult<Step> {
        self.patch_status(key, patch, resource_version)
    }

    async fn list_pods(&self, namespace: &str, step_name: &str) -> ClusterResult<Vec<PodInfo>> {
        self.load_pods(namespace, step_name)
    }

    async fn create_pod(&self, pod: &WorkerPod) -> ClusterResult<()> {
        self.insert_pod(pod)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.remove_pod(namespace, name)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ClusterResult<()> {
        self.record_exec(&ExecRequest {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            command: command.to_vec(),
        })
    }

    async fn watch(&self) -> ClusterResult<broadcast::Receiver<StepKey>> {
        Ok(self.events.subscribe())
    }
}
