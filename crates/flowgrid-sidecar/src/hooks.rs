//! LifecycleHookRegistry — ordered, best-effort hooks.
//!
//! Pre-patch hooks run at the start of every status merge cycle. Pre-stop
//! hooks run once per process, whether shutdown starts from a signal or from
//! the main container's pre-stop request; a second caller waits for the
//! first run to finish instead of running them again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

/// A hook. Failures are logged by the registry and never propagate.
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PrePatch,
    PreStop,
}

#[derive(Default)]
pub struct LifecycleHookRegistry {
    pre_patch: RwLock<Vec<(String, Hook)>>,
    pre_stop: RwLock<Vec<(String, Hook)>>,
    /// Set as soon as the first pre-stop request arrives.
    stopping: AtomicBool,
    /// Filled once the pre-stop hooks have finished.
    stopped: OnceCell<String>,
}

impl LifecycleHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook to a phase. Hooks run in registration order.
    pub async fn register(&self, phase: HookPhase, name: impl Into<String>, hook: Hook) {
        let name = name.into();
        debug!(?phase, hook = %name, "registering hook");
        self.list(phase).write().await.push((name, hook));
    }

    /// Run every hook of a phase in order. Returns how many failed.
    pub async fn run_all(&self, phase: HookPhase) -> usize {
        // Clone the list so hooks may register further hooks.
        let hooks: Vec<(String, Hook)> = self.list(phase).read().await.clone();
        let mut failed = 0;
        for (name, hook) in hooks {
            debug!(?phase, hook = %name, "running hook");
            if let Err(e) = hook().await {
                warn!(?phase, hook = %name, error = %e, "hook failed");
                failed += 1;
            }
        }
        failed
    }

    /// Run the pre-stop hooks unless they already ran. `source` names who
    /// asked, for the logs.
    pub async fn pre_stop(&self, source: &str) {
        self.stopping.store(true, Ordering::SeqCst);
        let first = self
            .stopped
            .get_or_init(|| async {
                info!(source, "running pre-stop hooks");
                self.run_all(HookPhase::PreStop).await;
                source.to_string()
            })
            .await;
        if first != source {
            debug!(source, first = %first, "pre-stop hooks already ran");
        }
    }

    /// Whether shutdown has begun, even if the hooks are still running.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Whether the pre-stop hooks have finished.
    pub fn is_stopped(&self) -> bool {
        self.stopped.initialized()
    }

    fn list(&self, phase: HookPhase) -> &RwLock<Vec<(String, Hook)>> {
        match phase {
            HookPhase::PrePatch => &self.pre_patch,
            HookPhase::PreStop => &self.pre_stop,
        }
    }
}
