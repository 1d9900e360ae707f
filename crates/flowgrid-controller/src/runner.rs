//! Controller — drives [`StepReconciler`] from change events and resyncs.
//!
//! Change notifications and a periodic full relist feed a [`WorkQueue`].
//! Up to `workers` reconciles run at once, never two for the same step.
//! The periodic relist also re-evaluates steps nothing has written to, so a
//! held scaling decision is applied once its window closes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use flowgrid_state::{ClusterApi, StepKey};

use crate::config::ControllerConfig;
use crate::error::ControllerResult;
use crate::queue::WorkQueue;
use crate::reconciler::StepReconciler;

pub struct Controller {
    cluster: Arc<dyn ClusterApi>,
    reconciler: Arc<StepReconciler>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ControllerConfig) -> Self {
        let reconciler = Arc::new(StepReconciler::new(cluster.clone(), config.clone()));
        Self {
            cluster,
            reconciler,
            config,
        }
    }

    pub fn with_reconciler(
        cluster: Arc<dyn ClusterApi>,
        reconciler: StepReconciler,
        config: ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            reconciler: Arc::new(reconciler),
            config,
        }
    }

    /// Run until `shutdown` flips. In-flight reconciles finish before this
    /// returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        let mut events = self.cluster.watch().await?;
        let mut queue = WorkQueue::new();
        let mut tasks: JoinSet<(StepKey, bool)> = JoinSet::new();
        let workers = self.config.workers.max(1);

        let mut resync = tokio::time::interval(self.config.resync_interval);
        info!(
            workers,
            resync_secs = self.config.resync_interval.as_secs(),
            "controller started"
        );

        loop {
            while tasks.len() < workers {
                let Some(key) = queue.pop() else { break };
                let reconciler = self.reconciler.clone();
                tasks.spawn(async move {
                    // A panic counts as a failure so the key leaves `active`.
                    let outcome = AssertUnwindSafe(reconciler.reconcile(&key))
                        .catch_unwind()
                        .await;
                    let ok = match outcome {
                        Ok(Ok(_)) => true,
                        Ok(Err(e)) => {
                            error!(step = %key, error = %e, "reconcile failed");
                            false
                        }
                        Err(_) => {
                            error!(step = %key, "reconcile panicked");
                            false
                        }
                    };
                    (key, ok)
                });
            }

            let retry_at = queue.next_retry();

            tokio::select! {
                event = events.recv() => match event {
                    Ok(key) => queue.add(key),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change events dropped, relisting");
                        self.resync(&mut queue).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("change feed closed, resubscribing");
                        events = self.cluster.watch().await?;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((key, ok)) => {
                        if let Some(delay) = queue.done(&key, ok, Instant::now()) {
                            debug!(step = %key, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                        }
                    }
                    Err(e) => error!(error = %e, "reconcile task aborted"),
                },
                _ = resync.tick() => self.resync(&mut queue).await,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    queue.promote_due(Instant::now());
                }
                _ = shutdown.changed() => {
                    info!("controller shutting down");
                    break;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "reconcile task aborted");
            }
        }
        Ok(())
    }

    async fn resync(&self, queue: &mut WorkQueue) {
        match self.cluster.list_steps().await {
            Ok(steps) => {
                debug!(count = steps.len(), "resync");
                for step in steps {
                    queue.add(step.key());
                }
            }
            Err(e) => warn!(error = %e, "failed to list steps"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowgrid_state::{
        ClusterResult, PodInfo, ScalingPolicy, StateStore, Step, StepMeta, StepPhase, StepSpec,
        WorkerPod,
    };
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Panics the first time a step is read, then behaves like the store.
    struct PanicOnce {
        store: StateStore,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl ClusterApi for PanicOnce {
        async fn get_step(&self, key: &StepKey) -> ClusterResult<Option<Step>> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("injected failure reading {key}");
            }
            self.store.get_step(key).await
        }
        async fn list_steps(&self) -> ClusterResult<Vec<Step>> {
            self.store.list_steps().await
        }
        async fn patch_step_status(
            &self,
            key: &StepKey,
            patch: &Value,
            resource_version: Option<&str>,
        ) -> ClusterResult<Step> {
            self.store.patch_step_status(key, patch, resource_version).await
        }
        async fn list_pods(&self, namespace: &str, step_name: &str) -> ClusterResult<Vec<PodInfo>> {
            self.store.list_pods(namespace, step_name).await
        }
        async fn create_pod(&self, pod: &WorkerPod) -> ClusterResult<()> {
            self.store.create_pod(pod).await
        }
        async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
            self.store.delete_pod(namespace, name).await
        }
        async fn exec(
            &self,
            namespace: &str,
            pod: &str,
            container: &str,
            command: &[String],
        ) -> ClusterResult<()> {
            self.store.exec(namespace, pod, container, command).await
        }
        async fn watch(&self) -> ClusterResult<broadcast::Receiver<StepKey>> {
            self.store.watch().await
        }
    }

    fn step(name: &str, min: u32) -> Step {
        Step {
            metadata: StepMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..StepMeta::default()
            },
            spec: StepSpec {
                name: name.to_string(),
                replicas: ScalingPolicy {
                    min,
                    ..ScalingPolicy::default()
                },
                ..StepSpec::default()
            },
            ..Step::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn reconciles_existing_and_new_steps() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_step(&step("a", 2)).unwrap();

        let controller = Controller::new(Arc::new(store.clone()), ControllerConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { controller.run(rx).await });

        let s = store.clone();
        wait_for(move || {
            s.load_step(&StepKey::new("default", "a"))
                .unwrap()
                .is_some_and(|st| st.status.replicas == 2)
        })
        .await;

        store.put_step(&step("b", 1)).unwrap();
        let s = store.clone();
        wait_for(move || {
            s.load_step(&StepKey::new("default", "b"))
                .unwrap()
                .is_some_and(|st| st.status.replicas == 1 && st.status.phase == StepPhase::Pending)
        })
        .await;

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicked_reconcile_is_retried() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_step(&step("a", 1)).unwrap();
        let cluster = Arc::new(PanicOnce {
            store: store.clone(),
            tripped: AtomicBool::new(false),
        });
        let controller = Controller::new(cluster.clone(), ControllerConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { controller.run(rx).await });

        // The first reconcile panics; the 1s backoff brings the step back.
        let key = StepKey::new("default", "a");
        let mut replicas = 0;
        for _ in 0..400 {
            replicas = store
                .load_step(&key)
                .unwrap()
                .map(|st| st.status.replicas)
                .unwrap_or_default();
            if replicas == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cluster.tripped.load(Ordering::SeqCst));
        assert_eq!(replicas, 1);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stops_on_shutdown_signal() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = Controller::new(Arc::new(store), ControllerConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { controller.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
