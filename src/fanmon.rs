//! File access monitor.
//!
//! Subscribes to fanotify open/access/modify events for a whole mount and
//! accumulates per-process path-touch counters. The notification group is
//! created up front so a missing kernel facility or insufficient privilege
//! fails the session before the target app is launched; the collection
//! thread then drains events until the stop signal fires, and the group fd
//! is released only after draining stops so in-flight events are not lost.

use std::collections::HashMap;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::fanotify::{EventFFlags, Fanotify, InitFlags, MarkFlags, MaskFlags};
use nix::unistd;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

use crate::errors::MonitorError;
use crate::report::{FanMonitorReport, FileInfo, ProcessInfo};

/// How long the drain loop sleeps when no events are pending.
const DRAIN_IDLE: Duration = Duration::from_millis(50);

/// One decoded file-touch event.
#[derive(Debug, Clone)]
struct FanEvent {
    id: u32,
    pid: i32,
    path: String,
    is_read: bool,
    is_write: bool,
    is_exec: bool,
}

/// Memoized pid -> process metadata lookups; each pid is resolved at most
/// once per session, even when it no longer exists.
struct ProcessCache {
    sys: System,
    cache: HashMap<i32, Option<ProcessInfo>>,
}

impl ProcessCache {
    fn new() -> Self {
        ProcessCache {
            sys: System::new(),
            cache: HashMap::new(),
        }
    }

    fn lookup(&mut self, pid: i32) -> Option<ProcessInfo> {
        if let Some(cached) = self.cache.get(&pid) {
            return cached.clone();
        }
        let info = self.resolve(pid);
        self.cache.insert(pid, info.clone());
        info
    }

    fn resolve(&mut self, pid: i32) -> Option<ProcessInfo> {
        let sys_pid = SysPid::from_u32(pid as u32);
        self.sys
            .refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        let proc_ = self.sys.process(sys_pid)?;
        Some(ProcessInfo {
            pid,
            name: proc_.name().to_string_lossy().into_owned(),
            path: proc_
                .exe()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            cmd: proc_
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" "),
            cwd: proc_
                .cwd()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            root: proc_
                .root()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            ppid: proc_.parent().map(|p| p.as_u32() as i32).unwrap_or(0),
        })
    }
}

pub struct FanMonitor {
    fan: Fanotify,
    mount_point: PathBuf,
}

impl FanMonitor {
    /// Create the notification group and mark the mount. Fails fast with a
    /// configuration error when the kernel facility is unavailable.
    pub fn init(mount_point: &Path) -> Result<FanMonitor, MonitorError> {
        info!("fanmon: watching mount {}", mount_point.display());

        let unavailable = |source: Errno| MonitorError::FanotifyUnavailable {
            mount: mount_point.display().to_string(),
            source,
        };

        let fan = Fanotify::init(
            InitFlags::FAN_CLOEXEC | InitFlags::FAN_CLASS_NOTIF | InitFlags::FAN_NONBLOCK,
            EventFFlags::O_RDONLY | EventFFlags::O_LARGEFILE,
        )
        .map_err(unavailable)?;

        let mask =
            MaskFlags::FAN_ACCESS | MaskFlags::FAN_MODIFY | MaskFlags::FAN_OPEN | MaskFlags::FAN_OPEN_EXEC;
        let marked = fan.mark(
            MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_MOUNT,
            mask,
            None,
            Some(mount_point),
        );
        if let Err(err) = marked {
            // FAN_OPEN_EXEC needs a 5.0+ kernel; fall back to the exe-path
            // heuristic on older ones.
            if err == Errno::EINVAL {
                debug!("fanmon: FAN_OPEN_EXEC rejected, marking without it");
                fan.mark(
                    MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_MOUNT,
                    MaskFlags::FAN_ACCESS | MaskFlags::FAN_MODIFY | MaskFlags::FAN_OPEN,
                    None,
                    Some(mount_point),
                )
                .map_err(unavailable)?;
            } else {
                return Err(unavailable(err));
            }
        }

        Ok(FanMonitor {
            fan,
            mount_point: mount_point.to_path_buf(),
        })
    }

    /// Start the collection thread. The report is delivered exactly once on
    /// the returned channel when the stop signal fires.
    pub fn run(self, stop: Arc<AtomicBool>) -> Receiver<FanMonitorReport> {
        let (report_tx, report_rx) = channel();

        thread::spawn(move || {
            debug!("fanmon: collector starting on {}", self.mount_point.display());
            let mut report = FanMonitorReport {
                monitor_pid: unistd::getpid().as_raw(),
                monitor_ppid: unistd::getppid().as_raw(),
                ..Default::default()
            };
            let mut cache = ProcessCache::new();
            let mut event_id: u32 = 0;

            loop {
                let drained = self.drain(&mut report, &mut cache, &mut event_id);
                if stop.load(Ordering::Acquire) {
                    // One last pass so events queued before the stop are
                    // kept.
                    self.drain(&mut report, &mut cache, &mut event_id);
                    break;
                }
                if !drained {
                    thread::sleep(DRAIN_IDLE);
                }
            }

            info!("fanmon: done, {} events", report.event_count);
            let _ = report_tx.send(report);
            // The fanotify group fd is released here, after draining
            // stopped.
        });

        report_rx
    }

    /// Read and record all currently queued events; returns whether any were
    /// seen.
    fn drain(
        &self,
        report: &mut FanMonitorReport,
        cache: &mut ProcessCache,
        event_id: &mut u32,
    ) -> bool {
        match self.fan.read_events() {
            Ok(events) if !events.is_empty() => {
                for raw in events {
                    if raw.mask().contains(MaskFlags::FAN_Q_OVERFLOW) {
                        warn!("fanmon: queue overflow event");
                        continue;
                    }
                    let Some(event) = decode_event(&raw, event_id) else {
                        continue;
                    };
                    let pinfo = cache.lookup(event.pid);
                    record_event(report, &event, pinfo.as_ref());
                }
                true
            }
            Ok(_) => false,
            Err(Errno::EAGAIN) => false,
            Err(err) => {
                // Transient read failure; keep the loop alive.
                warn!("fanmon: event read error: {}", err);
                false
            }
        }
    }
}

fn decode_event(raw: &nix::sys::fanotify::FanotifyEvent, event_id: &mut u32) -> Option<FanEvent> {
    let mask = raw.mask();
    let is_read = mask.contains(MaskFlags::FAN_ACCESS);
    let is_write = mask.contains(MaskFlags::FAN_MODIFY);
    let is_exec = mask.contains(MaskFlags::FAN_OPEN_EXEC);
    let notify = is_read
        || is_write
        || is_exec
        || mask.contains(MaskFlags::FAN_OPEN);
    if !notify {
        return None;
    }

    // The event carries an open fd to the touched file; the path comes from
    // the fd's proc entry. The fd closes when `raw` drops.
    let fd = raw.fd()?;
    let path = fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).ok()?;

    *event_id += 1;
    Some(FanEvent {
        id: *event_id,
        pid: raw.pid(),
        path: path.display().to_string(),
        is_read,
        is_write,
        is_exec,
    })
}

fn record_event(report: &mut FanMonitorReport, event: &FanEvent, pinfo: Option<&ProcessInfo>) {
    report.event_count += 1;
    let pid_key = event.pid.to_string();

    if event.id == 1 {
        // The first event comes from the main target process.
        if let Some(info) = pinfo {
            report.main_process = Some(info.clone());
        }
    }
    if let Some(info) = pinfo {
        report
            .processes
            .entry(pid_key.clone())
            .or_insert_with(|| info.clone());
    }

    // A process opening its own executable image is an execution.
    let is_exec = event.is_exec
        || pinfo.is_some_and(|info| !info.path.is_empty() && info.path == event.path);

    let files = report.process_files.entry(pid_key).or_default();
    let info = files.entry(event.path.clone()).or_insert_with(|| FileInfo {
        first_eid: event.id,
        ..Default::default()
    });
    info.event_count += 1;
    if event.is_read {
        info.reads += 1;
    }
    if event.is_write {
        info.writes += 1;
    }
    if is_exec {
        info.execs += 1;
    }
}
