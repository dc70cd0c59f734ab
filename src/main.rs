//! slimwatch sensor binary.
//!
//! Runs inside the observed container: starts the monitors, launches the
//! target application under trace, waits for the remote controller's
//! `monitor.finish` command (or a termination signal), then resolves the
//! observations into the artifact inventory and announces completion.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use slimwatch::artifacts::{ArtifactOptions, ArtifactStore};
use slimwatch::ipc::{
    CommandServer, EventPublisher, CMD_MONITOR_FINISH, EVT_MONITOR_FINISH_COMPLETED,
    PUBLISH_ATTEMPTS,
};
use slimwatch::monitor::{CompositeMonitor, MonitorConfig};

const REPORT_NAME: &str = "creport.json";

/// How often the session loop re-checks the termination flag while waiting
/// for a command.
const CMD_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "slimwatch")]
#[command(about = "Watch a containerized app and build its minimal artifact inventory")]
struct Opts {
    /// Mount point watched for file access events.
    #[arg(long, default_value = "/")]
    mount_point: PathBuf,

    /// Directory receiving the artifact store and the final report.
    #[arg(long, default_value = "/opt/slimwatch/artifacts")]
    artifacts_dir: PathBuf,

    /// Working directory for the target app (defaults to the sensor's).
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// User to run the target app as.
    #[arg(long)]
    run_as_user: Option<String>,

    /// Command (request/reply) endpoint address.
    #[arg(long, default_value = "0.0.0.0:65501")]
    cmd_addr: String,

    /// Event (publish) endpoint address.
    #[arg(long, default_value = "0.0.0.0:65502")]
    evt_addr: String,

    /// Restrict resolved file activity to the target process subtree.
    #[arg(long)]
    scope_to_target: bool,

    /// Target command.
    command: String,

    /// Target arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();
    run(opts)
}

fn run(opts: Opts) -> Result<()> {
    let terminate = Arc::new(AtomicBool::new(false));
    {
        let terminate = Arc::clone(&terminate);
        ctrlc::set_handler(move || {
            terminate.store(true, Ordering::Release);
        })
        .context("installing signal handler")?;
    }

    let workdir = match opts.workdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving working directory")?,
    };

    // Control plane first; then the monitors, so a mandatory monitor
    // startup failure aborts before the target process begins executing.
    let mut publisher = EventPublisher::bind(&opts.evt_addr)?;
    let cmd_server = CommandServer::bind(&opts.cmd_addr)?;

    let composite = CompositeMonitor::start(MonitorConfig {
        mount_point: opts.mount_point.clone(),
        command: opts.command.clone(),
        args: opts.args.clone(),
        workdir,
        run_as_user: opts.run_as_user.clone(),
    })?;
    let target_pid = composite.target_pid();

    let cmd_rx = cmd_server.run(Arc::clone(&terminate));
    info!("sensor: monitoring pid {}, waiting for commands", target_pid);

    let finished = loop {
        if terminate.load(Ordering::Acquire) {
            info!("sensor: termination signal, stopping monitor");
            break false;
        }
        match cmd_rx.recv_timeout(CMD_POLL) {
            Ok(cmd) if cmd == CMD_MONITOR_FINISH => {
                info!("sensor: '{}' command, stopping monitor", cmd);
                break true;
            }
            Ok(cmd) => info!("sensor: ignoring command '{}'", cmd),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("sensor: command channel closed");
                break false;
            }
        }
    };

    // Stop is fanned out once; collect blocks until every monitor has
    // delivered its report.
    composite.stop();
    let report = composite.collect();

    if finished {
        let mut store = ArtifactStore::new(
            &opts.artifacts_dir,
            &opts.mount_point,
            report,
            ArtifactOptions {
                scope_to_target: opts.scope_to_target,
                target_pid,
            },
        );
        store.resolve_artifacts();
        store.save_artifacts();

        let report_path = opts.artifacts_dir.join(REPORT_NAME);
        store
            .save_report(&report_path)
            .with_context(|| format!("saving report to {}", report_path.display()))?;
        info!("sensor: report saved to {}", report_path.display());

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match publisher.publish(EVT_MONITOR_FINISH_COMPLETED) {
                Ok(()) => {
                    info!("sensor: published '{}'", EVT_MONITOR_FINISH_COMPLETED);
                    break;
                }
                Err(err) => warn!(
                    "sensor: publish attempt {}/{} failed: {}",
                    attempt, PUBLISH_ATTEMPTS, err
                ),
            }
        }
    }

    // Unblocks the command loop; both endpoints close on drop regardless of
    // which branch got us here.
    terminate.store(true, Ordering::Release);
    info!("sensor: done");
    Ok(())
}
