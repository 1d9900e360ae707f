//! The seam between the sidecar and message transports.
//!
//! Transports (Kafka, NATS Streaming, HTTP) live outside this crate. The
//! sidecar connects each one at startup and only reports ready once all of
//! them have connected.

use std::sync::Arc;

use async_trait::async_trait;

use flowgrid_state::Step;

use crate::counters::ReplicaCounters;
use crate::hooks::LifecycleHookRegistry;

/// What a transport gets to work with.
#[derive(Clone)]
pub struct TransportContext {
    pub step: Step,
    pub replica: u32,
    /// Counters to bump as messages flow.
    pub counters: Arc<ReplicaCounters>,
    /// For registering flush or close hooks.
    pub hooks: Arc<LifecycleHookRegistry>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Connect and start moving messages. Returns once connected.
    async fn connect(&self, ctx: &TransportContext) -> anyhow::Result<()>;
}
