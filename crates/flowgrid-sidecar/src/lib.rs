//! flowgrid-sidecar — the per-replica status plane.
//!
//! Every worker pod runs a sidecar next to the user's main container. It
//! keeps this replica's source and sink metrics, merges them into the step's
//! shared status on a jittered timer, and coordinates the pod's shutdown.
//!
//! # Architecture
//!
//! ```text
//! Transports ──bump──► ReplicaCounters
//!                          │ pre-patch flush hook
//!                          ▼
//!               SidecarStatusAggregator ──merge patch──► ClusterApi
//!                          ▲
//! HTTP :3569  /ready /pre-stop /metrics
//! ```
//!
//! # Shutdown
//!
//! SIGTERM (delivered by `flowd kill`) or the main container's pre-stop
//! request runs the pre-stop hooks once: readiness drops first, then a final
//! status merge. A pre-stop that lands during startup leaves the replica
//! unready for good. The merge loop then stops, one last merge picks up late
//! counters, and the HTTP server drains within [`SHUTDOWN_GRACE`].

pub mod aggregator;
pub mod config;
pub mod counters;
pub mod hooks;
pub mod prometheus;
pub mod server;
pub mod transport;

pub use aggregator::{PatchOutcome, SidecarStatusAggregator};
pub use config::{ConfigError, SidecarConfig};
pub use counters::{ConnectorCounters, ReplicaCounters};
pub use hooks::{Hook, HookPhase, LifecycleHookRegistry};
pub use server::{SidecarState, build_router};
pub use transport::{Transport, TransportContext};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use flowgrid_state::{ClusterApi, SIDECAR_PORT};

/// How long the HTTP server gets to drain after the pre-stop hooks.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Sidecar {
    config: SidecarConfig,
    cluster: Arc<dyn ClusterApi>,
    transports: Vec<Box<dyn Transport>>,
    bind_addr: SocketAddr,
}

impl Sidecar {
    pub fn new(config: SidecarConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            config,
            cluster,
            transports: Vec::new(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], SIDECAR_PORT)),
        }
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Serve until `shutdown` flips, then run the shutdown sequence.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let config = &self.config;
        info!(
            step = %config.step_key(),
            pipeline = %config.pipeline_name,
            replica = config.replica,
            update_interval_ms = config.update_interval.as_millis() as u64,
            "sidecar starting"
        );

        let hooks = Arc::new(LifecycleHookRegistry::new());
        let aggregator = Arc::new(SidecarStatusAggregator::new(
            self.cluster.clone(),
            config,
            hooks.clone(),
        ));
        let counters = Arc::new(ReplicaCounters::for_step(&config.step, config.replica));

        // All hooks are in place before anything can call pre-stop. Readiness
        // drops first.
        let agg = aggregator.clone();
        let become_unready: Hook = Arc::new(move || {
            let agg = agg.clone();
            Box::pin(async move {
                agg.drain().await;
                Ok::<(), anyhow::Error>(())
            })
        });
        hooks
            .register(HookPhase::PreStop, "become-unready", become_unready)
            .await;
        hooks
            .register(
                HookPhase::PrePatch,
                "flush-counters",
                counters.flush_hook(aggregator.clone()),
            )
            .await;
        let agg = aggregator.clone();
        let final_patch: Hook = Arc::new(move || {
            let agg = agg.clone();
            Box::pin(async move {
                agg.patch_status().await?;
                Ok::<(), anyhow::Error>(())
            })
        });
        hooks
            .register(HookPhase::PreStop, "final-status-patch", final_patch)
            .await;

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .context("failed to bind sidecar HTTP server")?;
        info!(addr = %self.bind_addr, "sidecar HTTP server listening");
        let router = build_router(SidecarState {
            aggregator: aggregator.clone(),
            hooks: hooks.clone(),
            counters: counters.clone(),
        });
        let (server_stop_tx, mut server_stop_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_stop_rx.changed().await;
                })
                .await
        });

        let ctx = TransportContext {
            step: config.step.clone(),
            replica: config.replica,
            counters: counters.clone(),
            hooks: hooks.clone(),
        };
        for transport in &self.transports {
            if let Err(e) = transport.connect(&ctx).await {
                let _ = server_stop_tx.send(true);
                return Err(e).with_context(|| format!("failed to connect {}", transport.name()));
            }
            info!(transport = transport.name(), "transport connected");
        }

        let (loop_stop_tx, loop_stop_rx) = watch::channel(false);
        let merge_loop = tokio::spawn(
            aggregator
                .clone()
                .run(config.update_interval, loop_stop_rx),
        );

        if aggregator.set_ready(true).await {
            info!("ready");
        } else {
            info!("shutdown began during startup, staying unready");
        }

        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }
        info!("shutdown requested");

        hooks.pre_stop("signal").await;
        let _ = loop_stop_tx.send(true);
        if let Err(e) = merge_loop.await {
            warn!(error = %e, "status merge loop panicked");
        }
        // Counters may have moved since the pre-stop hooks ran.
        if let Err(e) = aggregator.patch_status().await {
            warn!(error = %e, "final status patch failed");
        }

        let _ = server_stop_tx.send(true);
        match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
            Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server failed"),
            Ok(Err(e)) => warn!(error = %e, "HTTP server task panicked"),
            Err(_) => warn!("HTTP server did not drain within the grace period"),
        }

        info!("done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowgrid_state::{Connector, StateStore, Step, StepKey, StepMeta, StepSpec};

    struct Counting;

    #[async_trait]
    impl Transport for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn connect(&self, ctx: &TransportContext) -> anyhow::Result<()> {
            let source = ctx.counters.source("in").context("no source named in")?;
            source.record(3);
            source.set_pending(1);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Transport for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn connect(&self, _ctx: &TransportContext) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    fn setup() -> (StateStore, SidecarConfig) {
        let store = StateStore::open_in_memory().unwrap();
        let step = store
            .put_step(&Step {
                metadata: StepMeta {
                    name: "demo-main".to_string(),
                    namespace: "default".to_string(),
                    ..StepMeta::default()
                },
                spec: StepSpec {
                    name: "main".to_string(),
                    sources: vec![Connector {
                        name: "in".to_string(),
                        ..Connector::default()
                    }],
                    ..StepSpec::default()
                },
                ..Step::default()
            })
            .unwrap();
        let config = SidecarConfig {
            namespace: "default".to_string(),
            pipeline_name: "demo".to_string(),
            step,
            replica: 1,
            update_interval: Duration::from_secs(3600),
        };
        (store, config)
    }

    fn local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn shutdown_flushes_final_metrics() {
        let (store, config) = setup();
        let sidecar = Sidecar::new(config, Arc::new(store.clone()))
            .with_transport(Box::new(Counting))
            .with_bind_addr(local());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sidecar.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let step = store
            .load_step(&StepKey::new("default", "demo-main"))
            .unwrap()
            .unwrap();
        let metrics = step.status.source_statuses["in"].metrics["1"];
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.replica, 1);
    }

    /// Receives the main container's pre-stop while still connecting.
    struct StopsWhileConnecting {
        source: Arc<std::sync::Mutex<Option<Arc<ConnectorCounters>>>>,
    }

    #[async_trait]
    impl Transport for StopsWhileConnecting {
        fn name(&self) -> &str {
            "stops-while-connecting"
        }

        async fn connect(&self, ctx: &TransportContext) -> anyhow::Result<()> {
            let source = ctx.counters.source("in").context("no source named in")?;
            source.record(3);
            ctx.hooks.pre_stop("main").await;
            *self.source.lock().unwrap() = Some(source);
            Ok(())
        }
    }

    async fn get_status_line(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.lines().next().unwrap_or_default().to_string()
    }

    fn free_local_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind(local()).unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn pre_stop_during_startup_keeps_replica_unready_and_flushes() {
        let (store, config) = setup();
        let addr = free_local_addr();
        let slot = Arc::new(std::sync::Mutex::new(None));
        let sidecar = Sidecar::new(config, Arc::new(store.clone()))
            .with_transport(Box::new(StopsWhileConnecting {
                source: slot.clone(),
            }))
            .with_bind_addr(addr);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sidecar.run(rx));
        let mut source = None;
        for _ in 0..200 {
            source = slot.lock().unwrap().clone();
            if source.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let source = source.expect("transport never connected");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = get_status_line(addr, "/ready").await;
        assert!(status.contains("503"), "unexpected readiness: {status}");

        source.record(7);
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let step = store
            .load_step(&StepKey::new("default", "demo-main"))
            .unwrap()
            .unwrap();
        assert_eq!(step.status.source_statuses["in"].metrics["1"].total, 10);
    }

    #[tokio::test]
    async fn failed_transport_aborts_startup() {
        let (store, config) = setup();
        let sidecar = Sidecar::new(config, Arc::new(store))
            .with_transport(Box::new(Broken))
            .with_bind_addr(local());
        let (_tx, rx) = watch::channel(false);
        let err = sidecar.run(rx).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
