//! Controller settings.

use std::time::Duration;

/// Settings shared by every reconcile.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Image providing the `init`, `sidecar` and `kill` subcommands.
    pub runner_image: String,
    pub image_pull_policy: String,
    /// How often sidecars merge their metrics into step status.
    pub update_interval: Duration,
    /// Full relist period; also re-evaluates held scaling decisions.
    pub resync_interval: Duration,
    /// Maximum reconciles in flight.
    pub workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            runner_image: "flowgrid/runner:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            update_interval: Duration::from_secs(15),
            resync_interval: Duration::from_secs(30),
            workers: 4,
        }
    }
}
