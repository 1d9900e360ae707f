//! PodLifecycleManager — one worker pod per replica index.
//!
//! Pod `<step>-<i>` runs replica `i`. Convergence deletes pods whose index is
//! at or above the desired count and creates the missing ones below it. Both
//! halves tolerate racing with another writer: a pod that is already gone or
//! already exists is treated as done.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use flowgrid_state::{
    CTR_INIT, CTR_MAIN, CTR_SIDECAR, ClusterApi, Container, ENV_NAMESPACE, ENV_PIPELINE_NAME,
    ENV_REPLICA, ENV_STEP, ENV_UPDATE_INTERVAL, EnvVar, HttpGet, KEY_PIPELINE_NAME, KEY_REPLICA,
    KEY_STEP_NAME, OwnerRef, SCRATCH_PATH, SCRATCH_VOLUME, SIDECAR_PORT, STEP_API_VERSION,
    STEP_KIND, Step, VolumeMount, WorkerPod,
};

use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};

/// Name of the pod running `replica` of a step.
pub fn pod_name(step_name: &str, replica: u32) -> String {
    format!("{step_name}-{replica}")
}

/// Pods touched by one convergence pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Convergence {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
}

pub struct PodLifecycleManager {
    cluster: Arc<dyn ClusterApi>,
    config: ControllerConfig,
}

impl PodLifecycleManager {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ControllerConfig) -> Self {
        Self { cluster, config }
    }

    /// Make the step's pod set match `replicas`.
    pub async fn converge(&self, step: &Step, replicas: u32) -> ControllerResult<Convergence> {
        let namespace = &step.metadata.namespace;
        let existing = self
            .cluster
            .list_pods(namespace, &step.metadata.name)
            .await?;

        let mut result = Convergence::default();
        let mut present = BTreeSet::new();

        for pod in &existing {
            match pod.replica() {
                Some(replica) if replica >= replicas => {
                    info!(pod = %pod.name, replica, replicas, "deleting surplus pod");
                    match self.cluster.delete_pod(namespace, &pod.name).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {
                            debug!(pod = %pod.name, "pod already gone");
                        }
                        Err(e) => return Err(e.into()),
                    }
                    result.deleted.push(pod.name.clone());
                }
                Some(replica) => {
                    present.insert(replica);
                }
                None => {
                    warn!(pod = %pod.name, "pod has no usable replica annotation, ignoring");
                }
            }
        }

        for replica in (0..replicas).filter(|r| !present.contains(r)) {
            let pod = self.build_pod(step, replica)?;
            match self.cluster.create_pod(&pod).await {
                Ok(()) => {
                    info!(pod = %pod.name, replica, "created pod");
                    result.created.push(pod.name);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(pod = %pod.name, "pod already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(result)
    }

    /// Build the pod for one replica of a step.
    pub fn build_pod(&self, step: &Step, replica: u32) -> ControllerResult<WorkerPod> {
        let step_json =
            serde_json::to_string(step).map_err(|e| ControllerError::Encode(e.to_string()))?;
        let runner_env = vec![
            env(ENV_NAMESPACE, &step.metadata.namespace),
            env(ENV_PIPELINE_NAME, step.pipeline_name()),
            env(ENV_REPLICA, &replica.to_string()),
            env(ENV_STEP, &step_json),
            env(
                ENV_UPDATE_INTERVAL,
                &format!("{}s", self.config.update_interval.as_secs()),
            ),
        ];
        let mounts = vec![VolumeMount {
            name: SCRATCH_VOLUME.to_string(),
            mount_path: SCRATCH_PATH.to_string(),
        }];

        let runner = |name: &str, args: &[&str]| Container {
            name: name.to_string(),
            image: self.config.runner_image.clone(),
            image_pull_policy: self.config.image_pull_policy.clone(),
            command: Vec::new(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: runner_env.clone(),
            volume_mounts: mounts.clone(),
            readiness_probe: None,
            pre_stop: None,
        };

        let init = runner(CTR_INIT, &["init"]);
        let sidecar = Container {
            readiness_probe: Some(HttpGet {
                path: "/ready".to_string(),
                port: SIDECAR_PORT,
            }),
            ..runner(CTR_SIDECAR, &["sidecar"])
        };

        let user = &step.spec.container;
        let mut main_env: Vec<EnvVar> = user.env.iter().map(|(k, v)| env(k, v)).collect();
        main_env.extend(runner_env.iter().cloned());
        let main = Container {
            name: CTR_MAIN.to_string(),
            image: user.image.clone(),
            image_pull_policy: self.config.image_pull_policy.clone(),
            command: user.command.clone(),
            args: user.args.clone(),
            env: main_env,
            volume_mounts: mounts.clone(),
            readiness_probe: None,
            pre_stop: Some(HttpGet {
                path: "/pre-stop?source=main".to_string(),
                port: SIDECAR_PORT,
            }),
        };

        let labels = BTreeMap::from([
            (KEY_STEP_NAME.to_string(), step.metadata.name.clone()),
            (
                KEY_PIPELINE_NAME.to_string(),
                step.pipeline_name().to_string(),
            ),
        ]);
        let annotations = BTreeMap::from([(KEY_REPLICA.to_string(), replica.to_string())]);

        Ok(WorkerPod {
            name: pod_name(&step.metadata.name, replica),
            namespace: step.metadata.namespace.clone(),
            labels,
            annotations,
            owner: OwnerRef {
                api_version: STEP_API_VERSION.to_string(),
                kind: STEP_KIND.to_string(),
                name: step.metadata.name.clone(),
                uid: step.metadata.uid.clone(),
            },
            restart_policy: step.spec.restart_policy,
            volumes: vec![SCRATCH_VOLUME.to_string()],
            init_containers: vec![init],
            containers: vec![sidecar, main],
        })
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: value.to_string(),
    }
}
