//! Autoscaler — backlog-driven replica counts.
//!
//! [`calculate`] is the pure scaling formula. [`Autoscaler`] wraps it with
//! the scale window: whatever the formula says, a step's replica count
//! changes at most once per window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use flowgrid_state::{ScalingPolicy, StepStatus};

/// Minimum time between two replica-count changes of one step.
pub const SCALE_WINDOW: Duration = Duration::from_secs(60);

/// A scaling decision for a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified replica count.
    ScaleTo(u32),
    /// The formula wants a different count but the scale window is still open.
    Hold { desired: u32 },
    /// No change needed.
    NoChange,
}

impl ScaleDecision {
    /// The replica count to run with, given the current one.
    pub fn replicas(self, current: u32) -> u32 {
        match self {
            Self::ScaleTo(n) => n,
            Self::Hold { .. } | Self::NoChange => current,
        }
    }
}

/// Desired replica count for a backlog.
///
/// `current` and `since_last_scale` only matter for peeking: a step that
/// may scale to zero, is at zero, and wants zero gets one replica once the
/// policy's peek delay has passed since it last scaled (or if it never has).
pub fn calculate(
    policy: &ScalingPolicy,
    pending: u64,
    current: u32,
    since_last_scale: Option<Duration>,
) -> u32 {
    let Some(ratio) = policy.ratio() else {
        return policy.min;
    };

    // Float-to-int casts saturate, so a huge backlog lands on u32::MAX.
    let raw = (pending as f64 / ratio).ceil() as u32;
    let desired = match policy.max {
        Some(max) => raw.clamp(policy.min, max.max(policy.min)),
        None => raw.max(policy.min),
    };

    if desired == 0
        && policy.min == 0
        && current == 0
        && since_last_scale.is_none_or(|elapsed| elapsed >= policy.peek_delay())
    {
        return 1;
    }

    desired
}

/// Applies the scaling formula and the scale window to a step's status.
#[derive(Debug, Clone)]
pub struct Autoscaler {
    window: Duration,
}

impl Default for Autoscaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Autoscaler {
    /// Create an autoscaler with the standard 60s scale window.
    pub fn new() -> Self {
        Self {
            window: SCALE_WINDOW,
        }
    }

    pub fn with_window(window: Duration) -> Self {
        Self { window }
    }

    /// Evaluate a step's last observed status at time `now`.
    pub fn evaluate(
        &self,
        policy: &ScalingPolicy,
        status: &StepStatus,
        now: DateTime<Utc>,
    ) -> ScaleDecision {
        let current = status.replicas;
        let since_last_scale = status
            .last_scale_time
            .map(|t| (now - t).to_std().unwrap_or(Duration::ZERO));
        let pending = status.pending();
        let desired = calculate(policy, pending, current, since_last_scale);

        if desired == current {
            return ScaleDecision::NoChange;
        }

        if let Some(elapsed) = since_last_scale
            && elapsed < self.window
        {
            debug!(
                current,
                desired,
                pending,
                elapsed_secs = elapsed.as_secs(),
                "scale window still open, holding replicas"
            );
            return ScaleDecision::Hold { desired };
        }

        debug!(from = current, to = desired, pending, "scaling");
        ScaleDecision::ScaleTo(desired)
    }
}
