//! Launching the observed application.
//!
//! The target runs as a regular child process with standard streams
//! inherited. When started for the syscall monitor it requests trace control
//! (`PTRACE_TRACEME`) before exec, so the tracer sees the initial trace stop,
//! and arranges to die with the sensor (`PR_SET_PDEATHSIG`).

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, User};

use crate::errors::MonitorError;

/// Handle to the running target application.
pub struct TargetApp {
    child: Child,
}

impl TargetApp {
    /// Start `command` with `args` in `workdir`. With `traced` the child
    /// enters a trace stop before its first instruction; the caller must be
    /// the thread that keeps driving it.
    pub fn start(
        command: &str,
        args: &[String],
        workdir: &Path,
        run_as_user: Option<&str>,
        traced: bool,
    ) -> Result<TargetApp, MonitorError> {
        debug!(
            "target: starting {} {:?} in {} (traced={})",
            command,
            args,
            workdir.display(),
            traced
        );

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(workdir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        if let Some(name) = run_as_user {
            match User::from_name(name) {
                Ok(Some(user)) => {
                    debug!(
                        "target: running as user {} (uid={}, gid={})",
                        name, user.uid, user.gid
                    );
                    cmd.uid(user.uid.as_raw()).gid(user.gid.as_raw());
                }
                Ok(None) => warn!("target: user {} not found, keeping current uid", name),
                Err(err) => warn!("target: user lookup for {} failed: {}", name, err),
            }
        }

        if traced {
            unsafe {
                cmd.pre_exec(|| {
                    // The tracer is the thread that spawned us; nothing else
                    // may issue ptrace calls for this child.
                    ptrace::traceme()
                        .map_err(|err| std::io::Error::from_raw_os_error(err as i32))?;
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(MonitorError::Launch)?;
        debug!("target: started pid {}", child.id());
        Ok(TargetApp { child })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Ask the target to stop, escalating to SIGKILL when SIGTERM cannot be
    /// delivered.
    pub fn terminate(&self) {
        let pid = self.pid();
        if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
            warn!("target: error stopping pid {}: {}", pid, err);
            if let Err(err) = signal::kill(pid, Signal::SIGKILL) {
                warn!("target: error killing pid {}: {}", pid, err);
            }
        }
    }

    /// Reap the child if it has not been reaped through the trace loop.
    pub fn wait(&mut self) {
        match self.child.wait() {
            Ok(status) => debug!("target: exit status {:?}", status),
            Err(err) => debug!("target: wait failed (already reaped?): {}", err),
        }
    }
}

/// Terminate a target known only by pid, SIGTERM first then SIGKILL.
pub fn terminate_pid(pid: Pid) {
    if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
        warn!("target: error stopping pid {}: {}", pid, err);
        if let Err(err) = signal::kill(pid, Signal::SIGKILL) {
            warn!("target: error killing pid {}: {}", pid, err);
        }
    }
}
