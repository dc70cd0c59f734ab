//! Syscall monitor.
//!
//! Launches the target under trace control and counts every syscall it
//! makes. The kernel requires that all trace calls for one tracee come from
//! the thread that owns it, so the whole trace loop runs on one dedicated
//! OS thread for its lifetime: it starts the target (which raises
//! `PTRACE_TRACEME` before exec), then alternates between awaiting a syscall
//! entry and awaiting the matching return, reading the saved syscall-number
//! register on entry and the return-value register on return. Each complete
//! pair is one internal event for the aggregation loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use syscalls::Sysno;

use crate::errors::MonitorError;
use crate::report::{PtMonitorReport, SyscallStatInfo};
use crate::target::{self, TargetApp};

/// One completed (entry, return) pair.
#[derive(Debug, Clone, Copy)]
struct SyscallEvent {
    call_num: u64,
    #[allow(dead_code)]
    ret_val: u64,
}

/// How often the aggregation loop checks the stop signal while idle.
const EVENT_POLL: Duration = Duration::from_millis(100);

#[cfg(target_arch = "x86_64")]
const ARCH_NAME: &str = "amd64";
#[cfg(not(target_arch = "x86_64"))]
const ARCH_NAME: &str = "unsupported";

pub struct PtMonitorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub run_as_user: Option<String>,
}

/// Start the syscall monitor. The target pid (or the launch failure) is
/// delivered once on `start_tx` before any tracing happens; the final report
/// is delivered exactly once on the returned channel, even when the loop
/// ends early.
pub fn run(
    start_tx: Sender<Result<Pid, MonitorError>>,
    stop: Arc<AtomicBool>,
    config: PtMonitorConfig,
) -> Receiver<PtMonitorReport> {
    let (report_tx, report_rx) = channel();

    thread::spawn(move || {
        let (event_tx, event_rx) = channel::<SyscallEvent>();
        let target_pid = Arc::new(AtomicI32::new(0));

        {
            let target_pid = Arc::clone(&target_pid);
            // Dedicated tracer thread; every ptrace call for the target
            // happens here.
            thread::spawn(move || trace_loop(start_tx, target_pid, config, event_tx));
        }

        let mut syscall_count: u64 = 0;
        let mut syscall_stats: HashMap<u64, u64> = HashMap::new();

        loop {
            match event_rx.recv_timeout(EVENT_POLL) {
                Ok(event) => {
                    syscall_count += 1;
                    *syscall_stats.entry(event.call_num).or_insert(0) += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Acquire) {
                        info!("ptmon: stop signal, terminating target");
                        let pid = target_pid.load(Ordering::Acquire);
                        if pid > 0 {
                            target::terminate_pid(Pid::from_raw(pid));
                        }
                        break;
                    }
                }
                // Tracer finished and dropped its sender; all buffered
                // events have been drained.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let report = finalize_report(ARCH_NAME, syscall_count, &syscall_stats);
        info!(
            "ptmon: done, {} syscall executions across {} syscalls",
            report.syscall_count, report.syscall_num
        );
        let _ = report_tx.send(report);
    });

    report_rx
}

/// Read (syscall number register, return value register) from the stopped
/// tracee.
#[cfg(target_arch = "x86_64")]
fn read_syscall_regs(pid: Pid) -> nix::Result<(u64, u64)> {
    let regs = ptrace::getregs(pid)?;
    Ok((regs.orig_rax, regs.rax))
}

#[cfg(not(target_arch = "x86_64"))]
fn read_syscall_regs(_pid: Pid) -> nix::Result<(u64, u64)> {
    Err(nix::errno::Errno::ENOSYS)
}

fn trace_loop(
    start_tx: Sender<Result<Pid, MonitorError>>,
    target_pid: Arc<AtomicI32>,
    config: PtMonitorConfig,
    event_tx: Sender<SyscallEvent>,
) {
    if !cfg!(target_arch = "x86_64") {
        let _ = start_tx.send(Err(MonitorError::ArchUnsupported));
        return;
    }

    let mut app = match TargetApp::start(
        &config.command,
        &config.args,
        &config.workdir,
        config.run_as_user.as_deref(),
        true,
    ) {
        Ok(app) => app,
        Err(err) => {
            let _ = start_tx.send(Err(err));
            return;
        }
    };

    let pid = app.pid();
    target_pid.store(pid.as_raw(), Ordering::Release);
    let _ = start_tx.send(Ok(pid));
    debug!("ptmon: target pid {}", pid);

    // First stop is the trace stop raised at exec.
    match waitpid(pid, None) {
        Ok(WaitStatus::Exited(_, code)) => {
            warn!("ptmon: target exited before tracing started (code {code})");
            return;
        }
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            warn!("ptmon: target signaled before tracing started ({sig})");
            return;
        }
        Ok(status) => debug!("ptmon: initial status {:?}", status),
        Err(err) => {
            warn!("ptmon: error waiting for {}: {}", pid, err);
            return;
        }
    }

    let mut awaiting_return = false;
    let mut call_num: u64 = 0;
    loop {
        match read_syscall_regs(pid) {
            Ok((num, ret)) => {
                if awaiting_return {
                    // A pair is complete only once the return-side stop has
                    // been read.
                    let _ = event_tx.send(SyscallEvent {
                        call_num,
                        ret_val: ret,
                    });
                } else {
                    call_num = num;
                }
                awaiting_return = !awaiting_return;
            }
            Err(err) => {
                // Kernel contract violated; end the loop with whatever was
                // accumulated.
                error!("ptmon: {}", MonitorError::RegisterRead(err));
                break;
            }
        }

        if let Err(err) = ptrace::syscall(pid, None) {
            warn!("ptmon: resuming tracee failed: {}", err);
            break;
        }

        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::PtraceSyscall(_)) => {}
            Ok(status) => {
                debug!("ptmon: tracee left traceable state: {:?}", status);
                break;
            }
            Err(err) => {
                warn!("ptmon: wait error: {}", err);
                break;
            }
        }
    }

    // Reap if the target already exited; harmless otherwise.
    app.wait();
    debug!("ptmon: trace loop exiting");
}

fn syscall_name(num: u64) -> String {
    match Sysno::new(num as usize) {
        Some(sysno) => sysno.name().to_string(),
        None => format!("syscall_{num}"),
    }
}

fn finalize_report(
    arch_name: &str,
    syscall_count: u64,
    stats: &HashMap<u64, u64>,
) -> PtMonitorReport {
    let mut report = PtMonitorReport {
        arch_name: arch_name.to_string(),
        syscall_count,
        ..Default::default()
    };
    for (&num, &count) in stats {
        report.syscall_stats.insert(
            num.to_string(),
            SyscallStatInfo {
                num,
                name: syscall_name(num),
                count,
            },
        );
    }
    report.syscall_num = report.syscall_stats.len() as u32;
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_report_counts() {
        let mut stats = HashMap::new();
        stats.insert(0, 12u64); // read
        stats.insert(1, 5); // write
        stats.insert(257, 3); // openat

        let report = finalize_report("amd64", 20, &stats);
        assert_eq!(report.syscall_count, 20);
        assert_eq!(report.syscall_num, 3);

        let total: u64 = report.syscall_stats.values().map(|s| s.count).sum();
        assert_eq!(total, report.syscall_count);
        assert_eq!(report.syscall_stats["1"].name, "write");
        assert_eq!(report.syscall_stats["257"].name, "openat");
    }

    #[test]
    fn test_unknown_syscall_gets_numeric_name() {
        assert_eq!(syscall_name(99999), "syscall_99999");
    }

    #[test]
    fn test_empty_session_report() {
        let report = finalize_report("amd64", 0, &HashMap::new());
        assert_eq!(report.syscall_count, 0);
        assert_eq!(report.syscall_num, 0);
        assert!(report.syscall_stats.is_empty());
    }
}
