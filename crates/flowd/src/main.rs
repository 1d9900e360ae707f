//! flowd — the Flowgrid daemon.
//!
//! One binary, four roles:
//! - `controller`: the step control loop (one per cluster)
//! - `sidecar`: the per-replica status plane (one per worker pod)
//! - `init`: prepares the worker pod's scratch volume
//! - `kill`: asks the sidecar process (PID 1 of its container) to stop
//!
//! # Usage
//!
//! ```text
//! flowd controller --runner-image flowgrid/runner:v1 --workers 8
//! flowd controller --standalone-db /var/lib/flowgrid/state.redb
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flowd", about = "Flowgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the step controller.
    Controller {
        /// Image providing the init, sidecar and kill subcommands.
        #[arg(long, env = "FLOWGRID_RUNNER_IMAGE", default_value = "flowgrid/runner:latest")]
        runner_image: String,

        /// Pull policy for the runner image.
        #[arg(long, env = "FLOWGRID_IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
        image_pull_policy: String,

        /// Sidecar status merge period in seconds.
        #[arg(long, env = "FLOWGRID_CONTROLLER_UPDATE_INTERVAL", default_value = "15")]
        update_interval: u64,

        /// Full resync period in seconds.
        #[arg(long, env = "FLOWGRID_RESYNC_INTERVAL", default_value = "30")]
        resync_interval: u64,

        /// Maximum reconciles in flight.
        #[arg(long, env = "FLOWGRID_WORKERS", default_value = "4")]
        workers: usize,

        /// Use an embedded store at this path instead of Kubernetes.
        #[arg(long)]
        standalone_db: Option<PathBuf>,
    },

    /// Run a replica's sidecar. Configured from FLOWGRID_* variables.
    Sidecar,

    /// Prepare the scratch volume.
    Init {
        #[arg(long, default_value = flowgrid_state::SCRATCH_PATH)]
        dir: PathBuf,
    },

    /// Stop the sidecar running in this container.
    Kill,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flowd=debug,flowgrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Controller {
            runner_image,
            image_pull_policy,
            update_interval,
            resync_interval,
            workers,
            standalone_db,
        } => {
            let config = flowgrid_controller::ControllerConfig {
                runner_image,
                image_pull_policy,
                update_interval: std::time::Duration::from_secs(update_interval.max(1)),
                resync_interval: std::time::Duration::from_secs(resync_interval.max(1)),
                workers: workers.max(1),
            };
            commands::run_controller(config, standalone_db).await
        }
        Command::Sidecar => commands::run_sidecar().await,
        Command::Init { dir } => commands::init(&dir),
        Command::Kill => commands::kill(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_flags_parse() {
        let cli = Cli::try_parse_from([
            "flowd",
            "controller",
            "--image-pull-policy",
            "Always",
            "--update-interval",
            "5",
            "--resync-interval",
            "60",
            "--workers",
            "8",
        ])
        .unwrap();
        match cli.command {
            Command::Controller {
                image_pull_policy,
                update_interval,
                resync_interval,
                workers,
                standalone_db,
                ..
            } => {
                assert_eq!(image_pull_policy, "Always");
                assert_eq!(update_interval, 5);
                assert_eq!(resync_interval, 60);
                assert_eq!(workers, 8);
                assert!(standalone_db.is_none());
            }
            _ => panic!("expected the controller subcommand"),
        }
    }

    #[test]
    fn every_controller_flag_has_an_env_fallback() {
        use clap::CommandFactory;
        let cmd = Cli::command();
        let controller = cmd.find_subcommand("controller").unwrap();
        for (flag, var) in [
            ("runner_image", "FLOWGRID_RUNNER_IMAGE"),
            ("image_pull_policy", "FLOWGRID_IMAGE_PULL_POLICY"),
            ("update_interval", "FLOWGRID_CONTROLLER_UPDATE_INTERVAL"),
            ("resync_interval", "FLOWGRID_RESYNC_INTERVAL"),
            ("workers", "FLOWGRID_WORKERS"),
        ] {
            let arg = controller
                .get_arguments()
                .find(|a| a.get_id() == flag)
                .unwrap();
            assert_eq!(arg.get_env().and_then(|v| v.to_str()), Some(var), "{flag}");
        }
    }
}
