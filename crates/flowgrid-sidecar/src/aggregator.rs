//! SidecarStatusAggregator — merges one replica's metrics into step status.
//!
//! Each replica owns the metrics entries keyed by its own index, so replicas
//! can patch the shared status concurrently as long as each only ever sends
//! the leaves it changed. One merge cycle:
//!
//! ```text
//! pre-patch hooks → diff(last observed, in-memory) → merge patch
//!        → last observed = server status
//!        → in-memory     = server status + this replica's own entries
//! ```
//!
//! The server object is never adopted as-is: metrics recorded while the
//! patch was in flight would be lost. Re-applying only this replica's keys
//! is always safe because no other replica writes them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use flowgrid_state::{
    ClusterApi, ClusterResult, Metrics, SourceStatuses, Step, StepKey, StepStatus, status_patch,
};

use crate::config::SidecarConfig;
use crate::hooks::{HookPhase, LifecycleHookRegistry};

/// Spread of the merge loop period: each wait is `interval * (1 + r * JITTER)`
/// for a random `r` in `[0, 1)`.
pub const JITTER: f64 = 1.2;

/// Result of one merge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Nothing changed since the last observed status.
    Unchanged,
    Patched,
    /// The step was deleted before its pods.
    StepGone,
}

struct Shared {
    step: Step,
    last: StepStatus,
    ready: bool,
    /// Shutdown began; readiness stays off.
    draining: bool,
}

pub struct SidecarStatusAggregator {
    cluster: Arc<dyn ClusterApi>,
    key: StepKey,
    replica: u32,
    hooks: Arc<LifecycleHookRegistry>,
    /// Held for a whole merge cycle.
    cycle: Mutex<()>,
    /// Held only for short reads and writes, never across a patch call.
    state: Mutex<Shared>,
}

impl SidecarStatusAggregator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: &SidecarConfig,
        hooks: Arc<LifecycleHookRegistry>,
    ) -> Self {
        let step = config.step.clone();
        Self {
            cluster,
            key: config.step_key(),
            replica: config.replica,
            hooks,
            cycle: Mutex::new(()),
            state: Mutex::new(Shared {
                last: step.status.clone(),
                step,
                ready: false,
                draining: false,
            }),
        }
    }

    pub fn replica(&self) -> u32 {
        self.replica
    }

    /// Replica 0 reports step-wide gauges.
    pub fn is_lead(&self) -> bool {
        self.replica == 0
    }

    /// The in-memory step, including metrics not yet patched.
    pub async fn snapshot(&self) -> Step {
        self.state.lock().await.step.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.ready
    }

    /// Set readiness. Returns the resulting value: once draining, the
    /// replica never becomes ready again.
    pub async fn set_ready(&self, ready: bool) -> bool {
        let mut state = self.state.lock().await;
        let ready = ready && !state.draining;
        if state.ready != ready {
            info!(replica = self.replica, ready, "readiness changed");
        }
        state.ready = ready;
        ready
    }

    /// Drop readiness for good.
    pub async fn drain(&self) {
        let mut state = self.state.lock().await;
        if state.ready {
            info!(replica = self.replica, "draining, no longer ready");
        }
        state.ready = false;
        state.draining = true;
    }

    /// Record this replica's latest source and sink metrics.
    pub async fn apply_metrics(
        &self,
        sources: &BTreeMap<String, Metrics>,
        sinks: &BTreeMap<String, Metrics>,
    ) {
        let key = self.replica.to_string();
        let mut state = self.state.lock().await;
        let status = &mut state.step.status;
        for (name, metrics) in sources {
            status
                .source_statuses
                .entry(name.clone())
                .or_default()
                .metrics
                .insert(key.clone(), *metrics);
        }
        for (name, metrics) in sinks {
            status
                .sink_statuses
                .entry(name.clone())
                .or_default()
                .metrics
                .insert(key.clone(), *metrics);
        }
    }

    /// Run one merge cycle.
    pub async fn patch_status(&self) -> ClusterResult<PatchOutcome> {
        let _cycle = self.cycle.lock().await;

        self.hooks.run_all(HookPhase::PrePatch).await;

        let patch = {
            let state = self.state.lock().await;
            status_patch(&state.last, &state.step.status)?
        };
        let Some(patch) = patch else {
            debug!(replica = self.replica, "status unchanged, skipping patch");
            return Ok(PatchOutcome::Unchanged);
        };

        debug!(replica = self.replica, %patch, "patching step status");
        let server = match self.cluster.patch_step_status(&self.key, &patch, None).await {
            Ok(step) => step,
            Err(e) if e.is_not_found() => {
                info!(step = %self.key, "step not found, skipping status patch");
                return Ok(PatchOutcome::StepGone);
            }
            Err(e) => return Err(e),
        };

        let own = self.replica.to_string();
        let mut state = self.state.lock().await;
        let mut merged = server;
        // The server's status is the new baseline; anything re-applied on
        // top of it goes out with the next cycle.
        let last = merged.status.clone();
        reapply(
            &state.step.status.source_statuses,
            &mut merged.status.source_statuses,
            &own,
        );
        reapply(
            &state.step.status.sink_statuses,
            &mut merged.status.sink_statuses,
            &own,
        );
        state.last = last;
        state.step = merged;
        Ok(PatchOutcome::Patched)
    }

    /// Merge periodically until `shutdown` flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            replica = self.replica,
            interval_ms = interval.as_millis() as u64,
            "status merge loop started"
        );
        loop {
            if let Err(e) = self.patch_status().await {
                warn!(step = %self.key, error = %e, "failed to patch step status");
            }
            tokio::select! {
                _ = tokio::time::sleep(jittered(interval)) => {}
                _ = shutdown.changed() => {
                    debug!("status merge loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Copy this replica's metrics entries from `own` into `target`.
fn reapply(own: &SourceStatuses, target: &mut SourceStatuses, key: &str) {
    for (name, status) in own {
        if let Some(metrics) = status.metrics.get(key) {
            target
                .entry(name.clone())
                .or_default()
                .metrics
                .insert(key.to_string(), *metrics);
        }
    }
}

/// One merge-loop wait.
pub fn jittered(interval: Duration) -> Duration {
    interval + interval.mul_f64(rand::random::<f64>() * JITTER)
}
