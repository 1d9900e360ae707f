//! flowgrid-state — typed domain model and cluster storage for Flowgrid.
//!
//! Everything the controller and the sidecars agree on lives here: the
//! `Step` resource and its status, the worker-pod contract, the JSON merge
//! patch helpers used to write status, and the [`ClusterApi`] seam through
//! which both actors talk to the orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ClusterApi (trait)
//!   ├── StateStore   — embedded redb store (standalone mode, tests)
//!   └── KubeCluster  — Kubernetes adapter (flowgrid-kube)
//! ```
//!
//! Dynamic API objects are converted to the typed values in [`types`] at
//! the adapter edge; nothing past the adapter handles raw JSON except the
//! merge patches themselves.

pub mod cluster;
pub mod duration;
pub mod error;
pub mod patch;
pub mod store;
pub mod tables;
pub mod types;

pub use cluster::ClusterApi;
pub use duration::parse_duration;
pub use error::{ClusterError, ClusterResult};
pub use patch::{apply_merge_patch, merge_diff, status_patch};
pub use store::StateStore;
pub use types::*;
