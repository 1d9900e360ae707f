//! Conversions between Kubernetes objects and flowgrid types.

use k8s_openapi::api::core::v1::{
    Container as KubeContainer, ContainerStatus as KubeContainerStatus, EmptyDirVolumeSource,
    EnvVar as KubeEnvVar, HTTPGetAction, Lifecycle, LifecycleHandler, Pod, PodSpec, Probe,
    Volume, VolumeMount as KubeVolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::DynamicObject;

use flowgrid_state::{
    ClusterError, ClusterResult, Container, ContainerState, ContainerStatus, HttpGet, PodInfo,
    PodPhase, Step, StepMeta, StepSpec, StepStatus, WorkerPod,
};

/// Convert a dynamic Step object into a typed step.
pub fn step_from_dynamic(obj: &DynamicObject) -> ClusterResult<Step> {
    let meta = &obj.metadata;
    let spec: StepSpec = match obj.data.get("spec") {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())
            .map_err(|e| ClusterError::Deserialize(format!("step spec: {e}")))?,
        _ => StepSpec::default(),
    };
    let status: StepStatus = match obj.data.get("status") {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())
            .map_err(|e| ClusterError::Deserialize(format!("step status: {e}")))?,
        _ => StepStatus::default(),
    };
    Ok(Step {
        metadata: StepMeta {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone().unwrap_or_default(),
            deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
        },
        spec,
        status,
    })
}

pub fn pod_info(pod: &Pod) -> PodInfo {
    let meta = &pod.metadata;
    let status = pod.status.as_ref();
    let phase = match status.and_then(|s| s.phase.as_deref()) {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };
    let container_statuses = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|all| all.iter().filter_map(container_status).collect())
        .unwrap_or_default();
    PodInfo {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        phase,
        message: status.and_then(|s| s.message.clone()).unwrap_or_default(),
        container_statuses,
    }
}

fn container_status(status: &KubeContainerStatus) -> Option<ContainerStatus> {
    let state = status.state.as_ref()?;
    let state = if let Some(t) = &state.terminated {
        ContainerState::Terminated {
            exit_code: t.exit_code,
            reason: t.reason.clone().unwrap_or_default(),
        }
    } else if state.running.is_some() {
        ContainerState::Running
    } else if let Some(w) = &state.waiting {
        ContainerState::Waiting {
            reason: w.reason.clone().unwrap_or_default(),
        }
    } else {
        return None;
    };
    Some(ContainerStatus {
        name: status.name.clone(),
        state,
    })
}

/// Build the Kubernetes pod for a worker.
pub fn pod_from_worker(worker: &WorkerPod) -> Pod {
    let owner = &worker.owner;
    Pod {
        metadata: ObjectMeta {
            name: Some(worker.name.clone()),
            namespace: Some(worker.namespace.clone()),
            labels: Some(worker.labels.clone()),
            annotations: Some(worker.annotations.clone()),
            owner_references: Some(vec![OwnerReference {
                api_version: owner.api_version.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some(worker.restart_policy.as_str().to_string()),
            volumes: Some(
                worker
                    .volumes
                    .iter()
                    .map(|name| Volume {
                        name: name.clone(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Volume::default()
                    })
                    .collect(),
            ),
            init_containers: Some(worker.init_containers.iter().map(container).collect()),
            containers: worker.containers.iter().map(container).collect(),
            ..PodSpec::default()
        }),
        status: None,
    }
}

fn container(c: &Container) -> KubeContainer {
    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());
    KubeContainer {
        name: c.name.clone(),
        image: Some(c.image.clone()),
        image_pull_policy: (!c.image_pull_policy.is_empty()).then(|| c.image_pull_policy.clone()),
        command: non_empty(&c.command),
        args: non_empty(&c.args),
        env: Some(
            c.env
                .iter()
                .map(|e| KubeEnvVar {
                    name: e.name.clone(),
                    value: Some(e.value.clone()),
                    ..KubeEnvVar::default()
                })
                .collect(),
        ),
        volume_mounts: Some(
            c.volume_mounts
                .iter()
                .map(|m| KubeVolumeMount {
                    name: m.name.clone(),
                    mount_path: m.mount_path.clone(),
                    ..KubeVolumeMount::default()
                })
                .collect(),
        ),
        readiness_probe: c.readiness_probe.as_ref().map(|h| Probe {
            http_get: Some(http_get(h)),
            ..Probe::default()
        }),
        lifecycle: c.pre_stop.as_ref().map(|h| Lifecycle {
            pre_stop: Some(LifecycleHandler {
                http_get: Some(http_get(h)),
                ..LifecycleHandler::default()
            }),
            ..Lifecycle::default()
        }),
        ..KubeContainer::default()
    }
}

fn http_get(h: &HttpGet) -> HTTPGetAction {
    HTTPGetAction {
        path: Some(h.path.clone()),
        port: IntOrString::Int(i32::from(h.port)),
        ..HTTPGetAction::default()
    }
}
