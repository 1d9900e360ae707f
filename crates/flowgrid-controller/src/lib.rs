//! flowgrid-controller — the step control loop.
//!
//! Each reconcile of a step reads its last observed status, decides how
//! many replicas it should run, converges the worker pods to that count,
//! folds the pods' phases into one step phase, stops the sidecars of
//! workers whose main container has exited, and writes the result back as
//! a conditional status merge patch.
//!
//! # Architecture
//!
//! ```text
//! Controller (watch + resync → WorkQueue → parallel reconciles)
//!   └── StepReconciler
//!       ├── Autoscaler          (flowgrid-autoscale)
//!       ├── PodLifecycleManager (create/delete worker pods)
//!       ├── PhaseAggregator     (pods → step phase/message)
//!       └── RemoteTerminator    (exec kill into finished workers' sidecars)
//! ```
//!
//! Steps are independent: reconciles of different steps run in parallel and
//! share nothing mutable. Two reconciles of the same step never overlap; a
//! step that changes while being reconciled is queued again.

pub mod config;
pub mod error;
pub mod phase;
pub mod pods;
pub mod queue;
pub mod reconciler;
pub mod runner;
pub mod terminator;

pub use config::ControllerConfig;
pub use error::{ControllerError, ControllerResult};
pub use phase::{CompletionPolicy, PhaseAggregator, PhaseSummary};
pub use pods::{Convergence, PodLifecycleManager};
pub use reconciler::{ReconcileReport, StepReconciler};
pub use runner::Controller;
pub use terminator::{RemoteTerminator, Termination};
