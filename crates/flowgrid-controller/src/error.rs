//! Controller error types.

use thiserror::Error;

use flowgrid_state::ClusterError;

/// Errors that fail a reconcile. The controller retries them with backoff.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("failed to stop sidecar of pod {pod}: {source}")]
    Exec {
        pod: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to encode step for pod environment: {0}")]
    Encode(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
