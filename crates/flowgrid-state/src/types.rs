//! Domain types for Flowgrid.
//!
//! These types mirror the `Step` custom resource and the parts of a worker
//! pod the control loops care about. All types are serializable to/from the
//! JSON the orchestrator stores; field names follow the resource's
//! camelCase wire format.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

/// Label carrying the owning step's resource name.
pub const KEY_STEP_NAME: &str = "flowgrid.io/step-name";
/// Label carrying the pipeline name.
pub const KEY_PIPELINE_NAME: &str = "flowgrid.io/pipeline-name";
/// Annotation carrying a pod's zero-based replica index.
pub const KEY_REPLICA: &str = "flowgrid.io/replica";

pub const CTR_INIT: &str = "init";
pub const CTR_SIDECAR: &str = "sidecar";
pub const CTR_MAIN: &str = "main";

/// API group/version of the Step resource.
pub const STEP_API_VERSION: &str = "flowgrid.io/v1alpha1";
pub const STEP_KIND: &str = "Step";

/// Port the sidecar serves readiness, pre-stop and metrics on.
pub const SIDECAR_PORT: u16 = 3569;
/// Scratch volume shared by every container of a worker pod.
pub const SCRATCH_VOLUME: &str = "var-run-flowgrid";
pub const SCRATCH_PATH: &str = "/var/run/flowgrid";
/// Path of the runner binary inside the runner image.
pub const RUNNER_BINARY: &str = "/flowd";

pub const ENV_NAMESPACE: &str = "FLOWGRID_NAMESPACE";
pub const ENV_PIPELINE_NAME: &str = "FLOWGRID_PIPELINE_NAME";
pub const ENV_STEP: &str = "FLOWGRID_STEP";
pub const ENV_REPLICA: &str = "FLOWGRID_REPLICA";
pub const ENV_UPDATE_INTERVAL: &str = "FLOWGRID_UPDATE_INTERVAL";

/// Default delay between peeks at a step scaled to zero.
pub const DEFAULT_PEEK_DELAY: Duration = Duration::from_secs(4 * 60);

// ── Step ──────────────────────────────────────────────────────────

/// Namespaced name of a step resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub namespace: String,
    pub name: String,
}

impl StepKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the composite key for the steps table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata the control loops rely on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Opaque version used for conditional writes.
    #[serde(default)]
    pub resource_version: String,
    /// Set once deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// One stage of a pipeline: desired behaviour plus observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub metadata: StepMeta,
    pub spec: StepSpec,
    #[serde(default)]
    pub status: StepStatus,
}

impl Step {
    pub fn key(&self) -> StepKey {
        StepKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Pipeline this step belongs to, from its labels.
    pub fn pipeline_name(&self) -> &str {
        self.metadata
            .labels
            .get(KEY_PIPELINE_NAME)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Desired behaviour of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step name within its pipeline.
    pub name: String,
    #[serde(default)]
    pub replicas: ScalingPolicy,
    /// The user's main container.
    #[serde(default)]
    pub container: ContainerSpec,
    #[serde(default)]
    pub sources: Vec<Connector>,
    #[serde(default)]
    pub sinks: Vec<Connector>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// One replica's success completes the whole step.
    #[serde(default)]
    pub terminator: bool,
}

/// Replica bounds and the backlog-per-replica target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicy {
    #[serde(default)]
    pub min: u32,
    /// `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    /// Pending messages per replica. `None` disables scaling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    /// How long a step scaled to zero waits before peeking, e.g. "4m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peek_delay: Option<String>,
}

impl ScalingPolicy {
    /// The scaling ratio, if scaling is enabled.
    pub fn ratio(&self) -> Option<f64> {
        self.ratio.filter(|r| *r > 0.0)
    }

    pub fn peek_delay(&self) -> Duration {
        self.peek_delay
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_PEEK_DELAY)
    }
}

/// The user-supplied main container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A named source or sink. Transport-specific settings are carried through
/// untouched for the connectors to interpret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub name: String,
    #[serde(flatten)]
    pub config: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::OnFailure => "OnFailure",
            Self::Never => "Never",
        }
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Aggregate phase of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepPhase {
    #[default]
    #[serde(rename = "")]
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepPhase {
    /// Position in the health order; `Unknown` has none.
    ///
    /// `Failed < Pending < Running < Succeeded`.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Failed => Some(0),
            Self::Pending => Some(1),
            Self::Running => Some(2),
            Self::Succeeded => Some(3),
            Self::Unknown => None,
        }
    }

    /// The less healthy of two phases. `Unknown` yields to any known phase.
    pub fn min(self, other: Self) -> Self {
        match (self.rank(), other.rank()) {
            (None, _) => other,
            (_, None) => self,
            (Some(a), Some(b)) if b < a => other,
            _ => self,
        }
    }

    pub fn completed(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Per-source (or per-sink) metrics keyed by replica index.
pub type SourceStatuses = BTreeMap<String, SourceStatus>;

/// Observed state of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    #[serde(default)]
    pub phase: StepPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub last_scale_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_statuses: SourceStatuses,
    #[serde(default)]
    pub sink_statuses: SourceStatuses,
}

impl StepStatus {
    /// Total backlog reported by the replicas that currently exist.
    ///
    /// Entries left behind by replicas that were scaled away are ignored.
    pub fn pending(&self) -> u64 {
        self.source_statuses
            .values()
            .flat_map(|s| s.metrics.iter())
            .filter(|(replica, _)| {
                replica
                    .parse::<u32>()
                    .is_ok_and(|r| r < self.replicas)
            })
            .map(|(_, m)| m.pending)
            .sum()
    }
}

/// Metrics for one source or sink, one entry per replica.
///
/// Each replica only ever writes the entry under its own index, which is
/// what lets replicas merge their status concurrently without locking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    #[serde(default)]
    pub metrics: BTreeMap<String, Metrics>,
}

/// Monotonic counters reported by one replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub replica: u32,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pending: u64,
}

// ── Pods ──────────────────────────────────────────────────────────

/// Phase of an individual pod, as reported by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

/// State of one container inside a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ContainerState {
    Waiting {
        #[serde(default)]
        reason: String,
    },
    Running,
    #[serde(rename_all = "camelCase")]
    Terminated {
        exit_code: i32,
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(flatten)]
    pub state: ContainerState,
}

/// A pod as observed: only what reconcile needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodInfo {
    /// The replica index from the pod's annotation, if present and numeric.
    pub fn replica(&self) -> Option<u32> {
        self.annotations.get(KEY_REPLICA)?.parse().ok()
    }

    pub fn step_name(&self) -> Option<&str> {
        self.labels.get(KEY_STEP_NAME).map(String::as_str)
    }

    pub fn container(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|c| c.name == name)
    }

    /// Build the composite key for the pods table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Controller reference from a pod to its step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// An HTTP GET action, used for probes and lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpGet {
    pub path: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<HttpGet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<HttpGet>,
}

/// Desired worker pod, as built by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPod {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: OwnerRef,
    pub restart_policy: RestartPolicy,
    /// Scratch `emptyDir` volumes shared by all containers.
    pub volumes: Vec<String>,
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
}

impl WorkerPod {
    /// The freshly-created pod as the orchestrator would first report it.
    pub fn to_pod_info(&self, uid: String) -> PodInfo {
        PodInfo {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            uid,
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            phase: PodPhase::Pending,
            message: String::new(),
            container_statuses: Vec::new(),
        }
    }
}

/// An exec request issued into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}
