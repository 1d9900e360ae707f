//! KubeCluster — the Kubernetes-backed cluster adapter.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, ResourceExt};
use serde_json::{Value, json};
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, info, warn};

use flowgrid_state::{
    ClusterApi, ClusterError, ClusterResult, KEY_STEP_NAME, PodInfo, STEP_KIND, Step, StepKey,
    WorkerPod, apply_merge_patch,
};

use crate::convert::{pod_from_worker, pod_info, step_from_dynamic};

const STEP_GROUP: &str = "flowgrid.io";
const STEP_VERSION: &str = "v1alpha1";
const STEP_PLURAL: &str = "steps";
const EVENT_CAPACITY: usize = 1024;

pub struct KubeCluster {
    client: Client,
    steps: ApiResource,
    events: broadcast::Sender<StepKey>,
    watching: OnceCell<()>,
}

impl KubeCluster {
    /// Connect using the in-cluster or kubeconfig credentials.
    pub async fn try_default() -> ClusterResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Api(format!("failed to create client: {e}")))?;
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk(STEP_GROUP, STEP_VERSION, STEP_KIND);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client,
            steps: ApiResource::from_gvk_with_plural(&gvk, STEP_PLURAL),
            events,
            watching: OnceCell::new(),
        }
    }

    fn step_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.steps)
    }

    fn pod_api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn start_watches(&self) {
        let steps: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.steps);
        let tx = self.events.clone();
        tokio::spawn(async move {
            let mut stream = watcher(steps, watcher::Config::default())
                .default_backoff()
                .touched_objects()
                .boxed();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(obj) => {
                        if let Some(namespace) = obj.namespace() {
                            let _ = tx.send(StepKey::new(namespace, obj.name_any()));
                        }
                    }
                    Err(e) => warn!(error = %e, "step watch error"),
                }
            }
        });

        let pods: Api<Pod> = Api::all(self.client.clone());
        let tx = self.events.clone();
        tokio::spawn(async move {
            let config = watcher::Config::default().labels(KEY_STEP_NAME);
            let mut stream = watcher(pods, config)
                .default_backoff()
                .touched_objects()
                .boxed();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(pod) => {
                        let step = pod.labels().get(KEY_STEP_NAME).cloned();
                        if let (Some(namespace), Some(step)) = (pod.namespace(), step) {
                            let _ = tx.send(StepKey::new(namespace, step));
                        }
                    }
                    Err(e) => warn!(error = %e, "pod watch error"),
                }
            }
        });
        info!("watching steps and worker pods");
    }
}

/// Map a kube error onto the cluster error the callers match on.
fn map_error(err: kube::Error, what: &str) -> ClusterError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(what.to_string()),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            ClusterError::Conflict(format!("{what}: {}", resp.message))
        }
        _ if is_container_not_found(&err.to_string()) => {
            ClusterError::ContainerNotFound(what.to_string())
        }
        _ => ClusterError::Api(format!("{what}: {err}")),
    }
}

fn is_container_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("container not found") || message.contains("is not valid for pod")
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_step(&self, key: &StepKey) -> ClusterResult<Option<Step>> {
        let obj = self
            .step_api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_error(e, &key.to_string()))?;
        obj.as_ref().map(step_from_dynamic).transpose()
    }

    async fn list_steps(&self) -> ClusterResult<Vec<Step>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.steps);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error(e, "steps"))?;
        list.items.iter().map(step_from_dynamic).collect()
    }

    async fn patch_step_status(
        &self,
        key: &StepKey,
        patch: &Value,
        resource_version: Option<&str>,
    ) -> ClusterResult<Step> {
        let mut body = patch.clone();
        if let Some(version) = resource_version {
            // The API server rejects the write with 409 if the object moved on.
            apply_merge_patch(&mut body, &json!({"metadata": {"resourceVersion": version}}));
        }
        let obj = self
            .step_api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_error(e, &key.to_string()))?;
        debug!(step = %key, "step status patched");
        step_from_dynamic(&obj)
    }

    async fn list_pods(&self, namespace: &str, step_name: &str) -> ClusterResult<Vec<PodInfo>> {
        let params = ListParams::default().labels(&format!("{KEY_STEP_NAME}={step_name}"));
        let list = self
            .pod_api(namespace)
            .list(&params)
            .await
            .map_err(|e| map_error(e, &format!("{namespace}/{step_name} pods")))?;
        Ok(list.items.iter().map(pod_info).collect())
    }

    async fn create_pod(&self, pod: &WorkerPod) -> ClusterResult<()> {
        self.pod_api(&pod.namespace)
            .create(&PostParams::default(), &pod_from_worker(pod))
            .await
            .map_err(|e| map_error(e, &format!("{}/{}", pod.namespace, pod.name)))?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.pod_api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(e, &format!("{namespace}/{name}")))?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ClusterResult<()> {
        let what = format!("{namespace}/{pod}: {container}");
        let params = AttachParams::default().container(container);
        let mut process = self
            .pod_api(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| map_error(e, &what))?;
        let status = process.take_status();
        process
            .join()
            .await
            .map_err(|e| ClusterError::Api(format!("{what}: {e}")))?;

        let Some(status) = status else {
            return Ok(());
        };
        match status.await {
            Some(s) if s.status.as_deref() == Some("Failure") => {
                let message = s.message.unwrap_or_default();
                if is_container_not_found(&message) {
                    Err(ClusterError::ContainerNotFound(what))
                } else {
                    Err(ClusterError::Api(format!("{what}: {message}")))
                }
            }
            _ => Ok(()),
        }
    }

    async fn watch(&self) -> ClusterResult<broadcast::Receiver<StepKey>> {
        let rx = self.events.subscribe();
        self.watching
            .get_or_init(|| async { self.start_watches() })
            .await;
        Ok(rx)
    }
}
