//! The orchestrator seam.
//!
//! Both the controller and the sidecars reach the cluster only through
//! [`ClusterApi`]. Implementations convert whatever the backend returns into
//! the typed values in [`crate::types`] before handing them back.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ClusterResult;
use crate::types::{PodInfo, Step, StepKey, WorkerPod};

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a step. `Ok(None)` if it does not exist.
    async fn get_step(&self, key: &StepKey) -> ClusterResult<Option<Step>>;

    /// List every step the caller can see.
    async fn list_steps(&self) -> ClusterResult<Vec<Step>>;

    /// Apply a JSON merge patch to a step's status sub-resource and return
    /// the resulting object.
    ///
    /// Only the `status` member of `patch` is applied. With a
    /// `resource_version` precondition the write fails with
    /// [`crate::ClusterError::Conflict`] if the step changed since that
    /// version was read.
    async fn patch_step_status(
        &self,
        key: &StepKey,
        patch: &Value,
        resource_version: Option<&str>,
    ) -> ClusterResult<Step>;

    /// List the pods labelled as belonging to a step.
    async fn list_pods(&self, namespace: &str, step_name: &str) -> ClusterResult<Vec<PodInfo>>;

    /// Create a pod. Fails with `AlreadyExists` if the name is taken.
    async fn create_pod(&self, pod: &WorkerPod) -> ClusterResult<()>;

    /// Delete a pod. Fails with `NotFound` if it is already gone.
    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    /// Run a command inside a container and wait for it to finish.
    ///
    /// Fails with `ContainerNotFound` if the container is not running.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ClusterResult<()>;

    /// Subscribe to change notifications. Each message names a step whose
    /// resource, or one of whose pods, changed.
    async fn watch(&self) -> ClusterResult<broadcast::Receiver<StepKey>>;
}
