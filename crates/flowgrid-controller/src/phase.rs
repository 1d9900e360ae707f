//! PhaseAggregator — folds per-pod phases into one step phase.
//!
//! The step is as healthy as its least healthy replica: `Failed` beats
//! `Pending` beats `Running` beats `Succeeded`, and `Unknown` yields to
//! any of them. A step with no pods is `Unknown`.

use flowgrid_state::{ContainerState, PodInfo, PodPhase, StepPhase, StepSpec};

/// Waiting reasons that mean a container will not start without outside help.
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
];

/// When a step counts as succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Every replica must succeed.
    #[default]
    AllReplicas,
    /// One replica succeeding completes the step, unless another failed.
    AnyReplica,
}

impl CompletionPolicy {
    pub fn for_step(spec: &StepSpec) -> Self {
        if spec.terminator {
            Self::AnyReplica
        } else {
            Self::AllReplicas
        }
    }
}

/// Aggregate phase plus the message to surface with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseSummary {
    pub phase: StepPhase,
    pub message: String,
}

/// The phase a single pod contributes, with its message.
///
/// A pod stuck behind a fatal waiting reason is reported as failed even
/// though the orchestrator still calls it pending.
pub fn pod_phase(pod: &PodInfo) -> (StepPhase, String) {
    for container in &pod.container_statuses {
        if let ContainerState::Waiting { reason } = &container.state
            && FATAL_WAITING_REASONS.contains(&reason.as_str())
        {
            return (StepPhase::Failed, format!("{}: {}", container.name, reason));
        }
    }
    let phase = match pod.phase {
        PodPhase::Pending => StepPhase::Pending,
        PodPhase::Running => StepPhase::Running,
        PodPhase::Succeeded => StepPhase::Succeeded,
        PodPhase::Failed => StepPhase::Failed,
        PodPhase::Unknown => StepPhase::Unknown,
    };
    (phase, pod.message.clone())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseAggregator {
    policy: CompletionPolicy,
}

impl PhaseAggregator {
    pub fn new(policy: CompletionPolicy) -> Self {
        Self { policy }
    }

    pub fn aggregate(&self, pods: &[PodInfo]) -> PhaseSummary {
        let observed: Vec<(StepPhase, String)> = pods.iter().map(pod_phase).collect();
        let min = observed
            .iter()
            .fold(StepPhase::Unknown, |acc, (phase, _)| acc.min(*phase));

        let phase = match self.policy {
            CompletionPolicy::AllReplicas => min,
            CompletionPolicy::AnyReplica => {
                let any_succeeded = observed.iter().any(|(p, _)| *p == StepPhase::Succeeded);
                if any_succeeded && min != StepPhase::Failed {
                    StepPhase::Succeeded
                } else {
                    min
                }
            }
        };

        // Only a completed step carries a message.
        let message = if phase.completed() {
            observed
                .iter()
                .find(|(p, m)| *p == phase && !m.is_empty())
                .or_else(|| observed.iter().find(|(_, m)| !m.is_empty()))
                .map(|(_, m)| m.clone())
                .unwrap_or_default()
        } else {
            String::new()
        };

        PhaseSummary { phase, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_state::{CTR_MAIN, ContainerStatus};

    fn pod(phase: PodPhase) -> PodInfo {
        PodInfo {
            name: format!("{phase:?}").to_lowercase(),
            phase,
            ..PodInfo::default()
        }
    }

    fn all() -> PhaseAggregator {
        PhaseAggregator::new(CompletionPolicy::AllReplicas)
    }

    #[test]
    fn no_pods_is_unknown() {
        assert_eq!(all().aggregate(&[]).phase, StepPhase::Unknown);
    }

    #[test]
    fn running_and_pending_is_pending() {
        let pods = [pod(PodPhase::Running), pod(PodPhase::Pending)];
        assert_eq!(all().aggregate(&pods).phase, StepPhase::Pending);
    }

    #[test]
    fn all_succeeded_is_succeeded() {
        let pods = [pod(PodPhase::Succeeded), pod(PodPhase::Succeeded)];
        assert_eq!(all().aggregate(&pods).phase, StepPhase::Succeeded);
    }

    #[test]
    fn unknown_pods_yield_to_known() {
        let pods = [pod(PodPhase::Unknown), pod(PodPhase::Running)];
        assert_eq!(all().aggregate(&pods).phase, StepPhase::Running);
    }

    #[test]
    fn adding_a_failed_pod_never_improves_the_phase() {
        let phases = [
            PodPhase::Pending,
            PodPhase::Running,
            PodPhase::Succeeded,
            PodPhase::Failed,
            PodPhase::Unknown,
        ];
        for policy in [CompletionPolicy::AllReplicas, CompletionPolicy::AnyReplica] {
            let aggregator = PhaseAggregator::new(policy);
            for a in phases {
                for b in phases {
                    let mut pods = vec![pod(a), pod(b)];
                    pods.push(pod(PodPhase::Failed));
                    assert_eq!(
                        aggregator.aggregate(&pods).phase,
                        StepPhase::Failed,
                        "{policy:?} {a:?} {b:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn any_replica_succeeds_on_first_success() {
        let any = PhaseAggregator::new(CompletionPolicy::AnyReplica);
        let pods = [pod(PodPhase::Running), pod(PodPhase::Succeeded)];
        assert_eq!(any.aggregate(&pods).phase, StepPhase::Succeeded);
        assert_eq!(all().aggregate(&pods).phase, StepPhase::Running);
    }

    #[test]
    fn terminator_flag_selects_policy() {
        let mut spec = StepSpec::default();
        assert_eq!(CompletionPolicy::for_step(&spec), CompletionPolicy::AllReplicas);
        spec.terminator = true;
        assert_eq!(CompletionPolicy::for_step(&spec), CompletionPolicy::AnyReplica);
    }

    #[test]
    fn crash_looping_pending_pod_is_failed() {
        let mut p = pod(PodPhase::Pending);
        p.container_statuses.push(ContainerStatus {
            name: CTR_MAIN.to_string(),
            state: ContainerState::Waiting {
                reason: "ImagePullBackOff".to_string(),
            },
        });
        let summary = all().aggregate(&[p, pod(PodPhase::Running)]);
        assert_eq!(summary.phase, StepPhase::Failed);
        assert_eq!(summary.message, "main: ImagePullBackOff");
    }

    #[test]
    fn benign_waiting_reason_stays_pending() {
        let mut p = pod(PodPhase::Pending);
        p.container_statuses.push(ContainerStatus {
            name: CTR_MAIN.to_string(),
            state: ContainerState::Waiting {
                reason: "ContainerCreating".to_string(),
            },
        });
        assert_eq!(pod_phase(&p).0, StepPhase::Pending);
    }

    #[test]
    fn message_only_surfaced_when_completed() {
        let mut running = pod(PodPhase::Running);
        running.message = "busy".to_string();
        assert_eq!(all().aggregate(&[running.clone()]).message, "");

        let mut failed = pod(PodPhase::Failed);
        failed.message = "OOMKilled".to_string();
        let summary = all().aggregate(&[running, failed]);
        assert_eq!(summary.phase, StepPhase::Failed);
        assert_eq!(summary.message, "OOMKilled");
    }
}
