//! StepReconciler — one pass of the control loop for one step.
//!
//! ```text
//! get step ──► autoscale ──► converge pods ──► aggregate phase
//!                                                   │
//!         conditional status patch ◄── stop finished sidecars
//! ```
//!
//! The status patch only carries what this pass changed and is guarded by
//! the resource version that was read at the start. If anything else wrote
//! the step in between, the patch is dropped and the change event that write
//! produced brings the step back for another pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use flowgrid_autoscale::{Autoscaler, ScaleDecision};
use flowgrid_state::{ClusterApi, PodInfo, StepKey, StepPhase, status_patch};

use crate::config::ControllerConfig;
use crate::error::ControllerResult;
use crate::phase::{CompletionPolicy, PhaseAggregator};
use crate::pods::{Convergence, PodLifecycleManager};
use crate::terminator::{RemoteTerminator, Termination};

/// What a reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub decision: ScaleDecision,
    pub replicas: u32,
    pub phase: StepPhase,
    pub pods: Convergence,
    /// Sidecars asked to stop.
    pub terminated: usize,
    /// Whether a status patch was written.
    pub patched: bool,
}

pub struct StepReconciler {
    cluster: Arc<dyn ClusterApi>,
    autoscaler: Autoscaler,
    pods: PodLifecycleManager,
    terminator: RemoteTerminator,
}

impl StepReconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ControllerConfig) -> Self {
        Self::with_autoscaler(cluster, config, Autoscaler::new())
    }

    pub fn with_autoscaler(
        cluster: Arc<dyn ClusterApi>,
        config: ControllerConfig,
        autoscaler: Autoscaler,
    ) -> Self {
        Self {
            pods: PodLifecycleManager::new(cluster.clone(), config),
            terminator: RemoteTerminator::new(cluster.clone()),
            cluster,
            autoscaler,
        }
    }

    pub async fn reconcile(&self, key: &StepKey) -> ControllerResult<Option<ReconcileReport>> {
        self.reconcile_at(key, Utc::now()).await
    }

    /// Reconcile a step as of `now`. Returns `None` when the step is gone or
    /// being deleted.
    pub async fn reconcile_at(
        &self,
        key: &StepKey,
        now: DateTime<Utc>,
    ) -> ControllerResult<Option<ReconcileReport>> {
        let Some(step) = self.cluster.get_step(key).await? else {
            debug!(step = %key, "step no longer exists");
            self.terminator.prune(key, &[]);
            return Ok(None);
        };
        if step.is_deleting() {
            debug!(step = %key, "step is being deleted");
            return Ok(None);
        }

        let observed = &step.status;
        let current = observed.replicas;
        let decision = self.autoscaler.evaluate(&step.spec.replicas, observed, now);
        let replicas = decision.replicas(current);
        debug!(
            step = %key,
            pipeline = step.pipeline_name(),
            current,
            replicas,
            ?decision,
            "reconciling"
        );

        let pods = self.pods.converge(&step, replicas).await?;

        let listed = self.cluster.list_pods(&key.namespace, &key.name).await?;
        self.terminator.prune(key, &listed);
        let mut live: Vec<PodInfo> = listed
            .into_iter()
            .filter(|p| p.replica().is_some_and(|r| r < replicas))
            .collect();
        live.sort_by_key(|p| p.replica());

        let summary =
            PhaseAggregator::new(CompletionPolicy::for_step(&step.spec)).aggregate(&live);

        let mut terminated = 0;
        for pod in &live {
            if self.terminator.terminate(pod).await? == Termination::Requested {
                terminated += 1;
            }
        }

        let mut desired = observed.clone();
        desired.phase = summary.phase;
        desired.message = summary.message;
        desired.replicas = replicas;
        if replicas != current {
            desired.last_scale_time = Some(now);
        }

        let patched = match status_patch(observed, &desired)? {
            None => false,
            Some(patch) => {
                info!(
                    step = %key,
                    phase = %desired.phase,
                    replicas,
                    "updating step status"
                );
                match self
                    .cluster
                    .patch_step_status(key, &patch, Some(&step.metadata.resource_version))
                    .await
                {
                    Ok(_) => true,
                    Err(e) if e.is_conflict() => {
                        debug!(step = %key, "step changed during reconcile, dropping patch");
                        false
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(step = %key, "step deleted during reconcile");
                        false
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        Ok(Some(ReconcileReport {
            decision,
            replicas,
            phase: desired.phase,
            pods,
            terminated,
            patched,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use flowgrid_state::{
        CTR_MAIN, CTR_SIDECAR, ClusterResult, ContainerState, ContainerStatus, KEY_PIPELINE_NAME,
        Metrics, PodPhase, ScalingPolicy, SourceStatus, StateStore, Step, StepMeta, StepSpec,
        WorkerPod,
    };
    use tokio::sync::broadcast;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn step(policy: ScalingPolicy) -> Step {
        Step {
            metadata: StepMeta {
                name: "demo-main".to_string(),
                namespace: "default".to_string(),
                labels: BTreeMap::from([(KEY_PIPELINE_NAME.to_string(), "demo".to_string())]),
                ..StepMeta::default()
            },
            spec: StepSpec {
                name: "main".to_string(),
                replicas: policy,
                ..StepSpec::default()
            },
            ..Step::default()
        }
    }

    fn fixed(min: u32) -> ScalingPolicy {
        ScalingPolicy {
            min,
            ..ScalingPolicy::default()
        }
    }

    fn setup(s: &Step) -> (StateStore, StepReconciler, StepKey) {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.put_step(s).unwrap();
        let reconciler = StepReconciler::new(Arc::new(store.clone()), ControllerConfig::default());
        (store, reconciler, stored.key())
    }

    fn set_all_pods(store: &StateStore, names: &[&str], phase: PodPhase, main: ContainerState) {
        let sidecar = if phase == PodPhase::Running {
            ContainerState::Running
        } else {
            ContainerState::Terminated {
                exit_code: 0,
                reason: "Completed".to_string(),
            }
        };
        for name in names {
            store
                .set_pod_status(
                    "default",
                    name,
                    phase,
                    "",
                    vec![
                        ContainerStatus {
                            name: CTR_MAIN.to_string(),
                            state: main.clone(),
                        },
                        ContainerStatus {
                            name: CTR_SIDECAR.to_string(),
                            state: sidecar.clone(),
                        },
                    ],
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn missing_step_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        let reconciler = StepReconciler::new(Arc::new(store), ControllerConfig::default());
        let report = reconciler
            .reconcile(&StepKey::new("default", "nope"))
            .await
            .unwrap();
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn deleting_step_is_left_alone() {
        let (store, reconciler, key) = setup(&step(fixed(2)));
        store.mark_step_deleting(&key).unwrap();
        assert!(reconciler.reconcile(&key).await.unwrap().is_none());
        assert!(store.list_pods("default", "demo-main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_pass_creates_pods_and_records_replicas() {
        let (store, reconciler, key) = setup(&step(fixed(2)));
        let now = Utc::now();
        let report = reconciler.reconcile_at(&key, now).await.unwrap().unwrap();

        assert_eq!(report.decision, ScaleDecision::ScaleTo(2));
        assert_eq!(report.pods.created.len(), 2);
        assert!(report.patched);
        // Freshly created pods report Pending.
        assert_eq!(report.phase, StepPhase::Pending);

        let stored = store.load_step(&key).unwrap().unwrap();
        assert_eq!(stored.status.replicas, 2);
        assert_eq!(stored.status.last_scale_time, Some(now));
        assert_eq!(stored.status.phase, StepPhase::Pending);
    }

    #[tokio::test]
    async fn steady_state_writes_nothing() {
        let (store, reconciler, key) = setup(&step(fixed(1)));
        reconciler.reconcile(&key).await.unwrap();
        let before = store.load_step(&key).unwrap().unwrap();

        let report = reconciler.reconcile(&key).await.unwrap().unwrap();
        assert!(!report.patched);
        let after = store.load_step(&key).unwrap().unwrap();
        assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
    }

    #[tokio::test]
    async fn scales_on_backlog_and_holds_inside_window() {
        let policy = ScalingPolicy {
            min: 1,
            max: Some(5),
            ratio: Some(1000.0),
            peek_delay: None,
        };
        let (store, reconciler, key) = setup(&step(policy));
        let start = Utc::now();
        reconciler.reconcile_at(&key, start).await.unwrap();

        let mut metrics = SourceStatus::default();
        metrics.metrics.insert(
            "0".to_string(),
            Metrics {
                replica: 0,
                total: 10,
                pending: 2500,
            },
        );
        let patch = json!({"status": {"sourceStatuses": {"in": metrics}}});
        store.patch_step_status(&key, &patch, None).await.unwrap();

        let held = reconciler
            .reconcile_at(&key, start + TimeDelta::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.decision, ScaleDecision::Hold { desired: 3 });
        assert_eq!(held.replicas, 1);

        let scaled = reconciler
            .reconcile_at(&key, start + TimeDelta::seconds(61))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scaled.decision, ScaleDecision::ScaleTo(3));
        assert_eq!(store.list_pods("default", "demo-main").await.unwrap().len(), 3);

        // Controller patches never touch the sidecars' metrics.
        let stored = store.load_step(&key).unwrap().unwrap();
        assert_eq!(stored.status.source_statuses["in"].metrics["0"].pending, 2500);
    }

    /// Hands out steps with a resource version that is already stale.
    struct StaleReads(StateStore);

    #[async_trait::async_trait]
    impl ClusterApi for StaleReads {
        async fn get_step(&self, key: &StepKey) -> ClusterResult<Option<Step>> {
            let step = self.0.get_step(key).await?;
            Ok(step.map(|mut s| {
                s.metadata.resource_version = "0".to_string();
                s
            }))
        }
        async fn list_steps(&self) -> ClusterResult<Vec<Step>> {
            self.0.list_steps().await
        }
        async fn patch_step_status(
            &self,
            key: &StepKey,
            patch: &serde_json::Value,
            resource_version: Option<&str>,
        ) -> ClusterResult<Step> {
            self.0.patch_step_status(key, patch, resource_version).await
        }
        async fn list_pods(&self, namespace: &str, step_name: &str) -> ClusterResult<Vec<PodInfo>> {
            self.0.list_pods(namespace, step_name).await
        }
        async fn create_pod(&self, pod: &WorkerPod) -> ClusterResult<()> {
            self.0.create_pod(pod).await
        }
        async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
            self.0.delete_pod(namespace, name).await
        }
        async fn exec(
            &self,
            namespace: &str,
            pod: &str,
            container: &str,
            command: &[String],
        ) -> ClusterResult<()> {
            self.0.exec(namespace, pod, container, command).await
        }
        async fn watch(&self) -> ClusterResult<broadcast::Receiver<StepKey>> {
            self.0.watch().await
        }
    }

    #[tokio::test]
    async fn conflicting_patch_is_dropped() {
        let store = StateStore::open_in_memory().unwrap();
        let key = store.put_step(&step(fixed(1))).unwrap().key();
        let reconciler = StepReconciler::new(
            Arc::new(StaleReads(store.clone())),
            ControllerConfig::default(),
        );

        let report = reconciler.reconcile(&key).await.unwrap().unwrap();
        assert!(!report.patched);
        assert_eq!(report.pods.created.len(), 1);
        let stored = store.load_step(&key).unwrap().unwrap();
        assert_eq!(stored.status.replicas, 0);
    }

    #[tokio::test]
    async fn finished_pods_get_their_sidecars_stopped() {
        let (store, reconciler, key) = setup(&step(fixed(2)));
        reconciler.reconcile(&key).await.unwrap();

        let exited = ContainerState::Terminated {
            exit_code: 0,
            reason: "Completed".to_string(),
        };
        set_all_pods(&store, &["demo-main-0", "demo-main-1"], PodPhase::Running, exited);

        let report = reconciler.reconcile(&key).await.unwrap().unwrap();
        assert_eq!(report.terminated, 2);
        assert_eq!(store.exec_requests().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn kill_records_go_with_their_step() {
        let (store, reconciler, key) = setup(&step(fixed(2)));
        reconciler.reconcile(&key).await.unwrap();
        let exited = ContainerState::Terminated {
            exit_code: 0,
            reason: "Completed".to_string(),
        };
        set_all_pods(&store, &["demo-main-0", "demo-main-1"], PodPhase::Running, exited);
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(reconciler.terminator.outstanding(), 2);

        store.delete_step(&key).unwrap();
        assert!(reconciler.reconcile(&key).await.unwrap().is_none());
        assert_eq!(reconciler.terminator.outstanding(), 0);
    }

    #[tokio::test]
    async fn all_pods_succeeded_completes_step() {
        let (store, reconciler, key) = setup(&step(fixed(2)));
        reconciler.reconcile(&key).await.unwrap();

        let exited = ContainerState::Terminated {
            exit_code: 0,
            reason: "Completed".to_string(),
        };
        set_all_pods(&store, &["demo-main-0", "demo-main-1"], PodPhase::Succeeded, exited);

        let report = reconciler.reconcile(&key).await.unwrap().unwrap();
        assert_eq!(report.phase, StepPhase::Succeeded);
        assert_eq!(report.terminated, 0);
        let stored = store.load_step(&key).unwrap().unwrap();
        assert_eq!(stored.status.phase, StepPhase::Succeeded);
    }

    #[tokio::test]
    async fn running_pods_make_step_running() {
        let (store, reconciler, key) = setup(&step(fixed(1)));
        reconciler.reconcile(&key).await.unwrap();
        set_all_pods(&store, &["demo-main-0"], PodPhase::Running, ContainerState::Running);

        let report = reconciler.reconcile(&key).await.unwrap().unwrap();
        assert_eq!(report.phase, StepPhase::Running);
    }
}
