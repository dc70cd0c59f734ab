//! Error types for the sensor session and its monitors.

use std::io;

use thiserror::Error;

/// Failures owned by a single monitor. Startup kinds are configuration
/// errors: the fanotify and ptrace kinds are fatal to the whole session,
/// the netlink kind only degrades it.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("fanotify unavailable on {mount}: {source}")]
    FanotifyUnavailable {
        mount: String,
        source: nix::errno::Errno,
    },

    #[error("netlink process connector unavailable: {0}")]
    NetlinkUnavailable(io::Error),

    #[error("trace setup failed: {0}")]
    TraceSetup(String),

    #[error("syscall tracing not supported on this architecture")]
    ArchUnsupported,

    #[error("reading tracee registers failed: {0}")]
    RegisterRead(nix::errno::Errno),

    #[error("malformed process event message")]
    MalformedEvent,

    #[error("failed to launch target app: {0}")]
    Launch(io::Error),
}

/// Top-level failures reported by the sensor binary.
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("monitor startup failed: {0}")]
    Monitor(#[from] MonitorError),

    #[error("ipc endpoint {addr} unavailable: {source}")]
    Ipc { addr: String, source: io::Error },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
