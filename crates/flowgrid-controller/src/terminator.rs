//! RemoteTerminator — stops the sidecar of a worker whose main container
//! has exited.
//!
//! The pod cannot finish while its sidecar keeps serving, so once `main` has
//! terminated the controller runs the runner's `kill` command inside the
//! sidecar, once per pod. The sidecar's own once-guard covers a restarted
//! controller repeating the request.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use flowgrid_state::{
    CTR_MAIN, CTR_SIDECAR, ClusterApi, ContainerState, PodInfo, RUNNER_BINARY, StepKey,
};

use crate::error::{ControllerError, ControllerResult};

/// What happened when a pod was inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Main still running, or sidecar already stopped.
    NotNeeded,
    /// A kill request was delivered to the sidecar.
    Requested,
    /// The sidecar (or its pod) disappeared before the request landed.
    AlreadyGone,
    /// A kill request for this pod was already delivered.
    AlreadyRequested,
}

pub struct RemoteTerminator {
    cluster: Arc<dyn ClusterApi>,
    /// Pods whose sidecar was sent a kill and still shows as running,
    /// with the step that owns them.
    requested: Mutex<HashMap<String, StepKey>>,
}

impl RemoteTerminator {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            requested: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the pod's main container has exited while its sidecar runs on.
    pub fn needs_termination(pod: &PodInfo) -> bool {
        let main_done = pod
            .container(CTR_MAIN)
            .is_some_and(|c| matches!(c.state, ContainerState::Terminated { .. }));
        let sidecar_running = pod
            .container(CTR_SIDECAR)
            .is_some_and(|c| c.state == ContainerState::Running);
        main_done && sidecar_running
    }

    pub async fn terminate(&self, pod: &PodInfo) -> ControllerResult<Termination> {
        let id = request_id(pod);
        if !Self::needs_termination(pod) {
            self.forget(&id);
            return Ok(Termination::NotNeeded);
        }
        if self.is_requested(&id) {
            return Ok(Termination::AlreadyRequested);
        }

        info!(pod = %pod.name, "main container exited, stopping sidecar");
        let command = vec![RUNNER_BINARY.to_string(), "kill".to_string()];
        match self
            .cluster
            .exec(&pod.namespace, &pod.name, CTR_SIDECAR, &command)
            .await
        {
            Ok(()) => {
                self.remember(id, owner(pod));
                Ok(Termination::Requested)
            }
            Err(e) if e.is_container_not_found() || e.is_not_found() => {
                debug!(pod = %pod.name, error = %e, "sidecar already stopped");
                Ok(Termination::AlreadyGone)
            }
            Err(source) => Err(ControllerError::Exec {
                pod: pod.name.clone(),
                source,
            }),
        }
    }

    /// Drop the records of a step's pods that are no longer listed. With an
    /// empty listing every record of the step goes.
    pub fn prune(&self, step: &StepKey, pods: &[PodInfo]) {
        let live: HashSet<String> = pods.iter().map(request_id).collect();
        self.requested()
            .retain(|id, owner| owner != step || live.contains(id));
    }

    /// Number of pods with an outstanding kill request.
    pub fn outstanding(&self) -> usize {
        self.requested().len()
    }

    fn is_requested(&self, id: &str) -> bool {
        self.requested().contains_key(id)
    }

    fn remember(&self, id: String, owner: StepKey) {
        self.requested().insert(id, owner);
    }

    fn forget(&self, id: &str) {
        self.requested().remove(id);
    }

    // The map holds plain data, so a panicked holder cannot leave it torn.
    fn requested(&self) -> MutexGuard<'_, HashMap<String, StepKey>> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn owner(pod: &PodInfo) -> StepKey {
    StepKey::new(&pod.namespace, pod.step_name().unwrap_or_default())
}

/// Pods are tracked by uid so a recreated pod with the same name is killed
/// again.
fn request_id(pod: &PodInfo) -> String {
    if pod.uid.is_empty() {
        pod.table_key()
    } else {
        pod.uid.clone()
    }
}
