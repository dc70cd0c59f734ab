//! Monitor coordinator.
//!
//! Owns the three monitors' lifecycles: starts them in the order that keeps
//! a mandatory startup failure ahead of the target launch, fans one stop
//! signal out to all of them, and fans their completion reports back into
//! one aggregate for the resolution engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::errors::{MonitorError, SensorError};
use crate::fanmon::FanMonitor;
use crate::pemon::PeMonitor;
use crate::ptmon::{self, PtMonitorConfig};
use crate::report::{FanMonitorReport, MonitorReport, PeMonitorReport, PtMonitorReport};

/// How long to wait for the syscall monitor's launch notification.
const START_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait for a mandatory monitor's final report after stop.
const REPORT_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period for the optional process event monitor's report.
const PE_GRACE: Duration = Duration::from_secs(5);

pub struct MonitorConfig {
    pub mount_point: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub run_as_user: Option<String>,
}

pub struct CompositeMonitor {
    stop: Arc<AtomicBool>,
    target_pid: i32,
    pt_rx: Receiver<PtMonitorReport>,
    fan_rx: Receiver<FanMonitorReport>,
    pe_rx: Option<Receiver<PeMonitorReport>>,
}

impl CompositeMonitor {
    /// Start all monitors and launch the target app under trace.
    ///
    /// The fanotify group is created first: it is mandatory, and a failure
    /// must abort the session before the target process begins executing.
    /// The process event monitor is optional; without it the session runs
    /// degraded (no subtree scoping precision).
    pub fn start(config: MonitorConfig) -> Result<CompositeMonitor, SensorError> {
        let stop = Arc::new(AtomicBool::new(false));

        let fanmon = FanMonitor::init(&config.mount_point)?;
        let pemon = match PeMonitor::init() {
            Ok(monitor) => Some(monitor),
            Err(err) => {
                warn!("monitor: running degraded, no process tree: {}", err);
                None
            }
        };

        let fan_rx = fanmon.run(Arc::clone(&stop));
        let pe_rx = pemon.map(|monitor| monitor.run(Arc::clone(&stop)));

        let (start_tx, start_rx) = channel();
        let pt_rx = ptmon::run(
            start_tx,
            Arc::clone(&stop),
            PtMonitorConfig {
                command: config.command,
                args: config.args,
                workdir: config.workdir,
                run_as_user: config.run_as_user,
            },
        );

        let target_pid = match start_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(pid)) => pid.as_raw(),
            Ok(Err(err)) => {
                stop.store(true, Ordering::Release);
                return Err(err.into());
            }
            Err(_) => {
                stop.store(true, Ordering::Release);
                return Err(SensorError::Monitor(MonitorError::TraceSetup(
                    "no launch notification from the trace loop".to_string(),
                )));
            }
        };
        info!("monitor: all monitors running, target pid {}", target_pid);

        Ok(CompositeMonitor {
            stop,
            target_pid,
            pt_rx,
            fan_rx,
            pe_rx,
        })
    }

    pub fn target_pid(&self) -> i32 {
        self.target_pid
    }

    /// Signal all monitors to finish. Safe to call any number of times.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for every monitor's completion report. Resolution must not start
    /// before all mandatory reports are in; the optional process tree gets a
    /// bounded grace period.
    pub fn collect(self) -> MonitorReport {
        self.stop();

        let pt = recv_report(&self.pt_rx, "ptmon").unwrap_or_default();
        let fan = recv_report(&self.fan_rx, "fanmon").unwrap_or_default();
        let ptree = self.pe_rx.and_then(|rx| match rx.recv_timeout(PE_GRACE) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!("monitor: no process tree report: {}", err);
                None
            }
        });

        MonitorReport { pt, fan, ptree }
    }
}

fn recv_report<T>(rx: &Receiver<T>, name: &str) -> Option<T> {
    match rx.recv_timeout(REPORT_TIMEOUT) {
        Ok(report) => Some(report),
        Err(RecvTimeoutError::Timeout) => {
            warn!("monitor: {} report timed out", name);
            None
        }
        Err(RecvTimeoutError::Disconnected) => {
            warn!("monitor: {} ended without a report", name);
            None
        }
    }
}
