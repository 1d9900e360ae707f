//! Subcommand bodies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

use flowgrid_controller::{Controller, ControllerConfig};
use flowgrid_kube::KubeCluster;
use flowgrid_sidecar::{Sidecar, SidecarConfig};
use flowgrid_state::{ClusterApi, StateStore};

pub async fn run_controller(
    config: ControllerConfig,
    standalone_db: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!(
        runner_image = %config.runner_image,
        workers = config.workers,
        "flowgrid controller starting"
    );

    let cluster: Arc<dyn ClusterApi> = match standalone_db {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = StateStore::open(&path)?;
            info!(path = ?path, "using embedded state store");
            Arc::new(store)
        }
        None => Arc::new(KubeCluster::try_default().await?),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "failed to install signal handlers");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    Controller::new(cluster, config).run(shutdown_rx).await?;
    info!("flowgrid controller stopped");
    Ok(())
}

pub async fn run_sidecar() -> anyhow::Result<()> {
    let config = SidecarConfig::from_env().context("invalid sidecar environment")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::try_default().await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "failed to install signal handlers");
        }
        let _ = shutdown_tx.send(true);
    });

    Sidecar::new(config, cluster).run(shutdown_rx).await
}

pub fn init(dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    info!(dir = %dir.display(), "scratch volume ready");
    Ok(())
}

pub fn kill() -> anyhow::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(1, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("failed to signal PID 1");
    }
    info!("sent SIGTERM to PID 1");
    Ok(())
}

/// Resolve on SIGTERM or SIGINT.
async fn wait_for_signal() -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    Ok(())
}
