//! flowgrid-kube — [`ClusterApi`] on a real Kubernetes cluster.
//!
//! Steps are read through the dynamic API and converted to typed
//! [`flowgrid_state::Step`] values as soon as they arrive; nothing past this
//! crate sees an untyped object. Worker pods go the other way, from
//! [`flowgrid_state::WorkerPod`] to `k8s_openapi` pods.
//!
//! [`ClusterApi`]: flowgrid_state::ClusterApi

pub mod client;
pub mod convert;

pub use client::KubeCluster;
