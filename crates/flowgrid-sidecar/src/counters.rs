//! ReplicaCounters — lock-free message counters for one replica.
//!
//! Transports bump these on their hot path; a pre-patch hook copies them
//! into the aggregator's status right before each merge cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use flowgrid_state::{Metrics, Step};

use crate::aggregator::SidecarStatusAggregator;
use crate::hooks::Hook;

/// Counters for one source or sink.
#[derive(Debug, Default)]
pub struct ConnectorCounters {
    total: AtomicU64,
    pending: AtomicU64,
}

impl ConnectorCounters {
    /// Count `n` more messages.
    pub fn record(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Set the backlog the transport last observed.
    pub fn set_pending(&self, n: u64) {
        self.pending.store(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }
}

pub struct ReplicaCounters {
    replica: u32,
    sources: BTreeMap<String, Arc<ConnectorCounters>>,
    sinks: BTreeMap<String, Arc<ConnectorCounters>>,
}

impl ReplicaCounters {
    /// One counter per source and sink the step declares.
    pub fn for_step(step: &Step, replica: u32) -> Self {
        let build = |names: Vec<String>| {
            names
                .into_iter()
                .map(|n| (n, Arc::new(ConnectorCounters::default())))
                .collect()
        };
        Self {
            replica,
            sources: build(step.spec.sources.iter().map(|c| c.name.clone()).collect()),
            sinks: build(step.spec.sinks.iter().map(|c| c.name.clone()).collect()),
        }
    }

    pub fn replica(&self) -> u32 {
        self.replica
    }

    pub fn source(&self, name: &str) -> Option<Arc<ConnectorCounters>> {
        self.sources.get(name).cloned()
    }

    pub fn sink(&self, name: &str) -> Option<Arc<ConnectorCounters>> {
        self.sinks.get(name).cloned()
    }

    pub fn source_metrics(&self) -> BTreeMap<String, Metrics> {
        self.metrics(&self.sources)
    }

    pub fn sink_metrics(&self) -> BTreeMap<String, Metrics> {
        self.metrics(&self.sinks)
    }

    fn metrics(
        &self,
        counters: &BTreeMap<String, Arc<ConnectorCounters>>,
    ) -> BTreeMap<String, Metrics> {
        counters
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    Metrics {
                        replica: self.replica,
                        total: c.total(),
                        pending: c.pending(),
                    },
                )
            })
            .collect()
    }

    /// Pre-patch hook copying the counters into the aggregator's status.
    pub fn flush_hook(self: &Arc<Self>, aggregator: Arc<SidecarStatusAggregator>) -> Hook {
        let counters = self.clone();
        Arc::new(move || {
            let counters = counters.clone();
            let aggregator = aggregator.clone();
            Box::pin(async move {
                aggregator
                    .apply_metrics(&counters.source_metrics(), &counters.sink_metrics())
                    .await;
                Ok::<(), anyhow::Error>(())
            })
        })
    }
}
