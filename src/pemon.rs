//! Process event monitor.
//!
//! Subscribes to the kernel's netlink process connector for system-wide
//! fork/exec/exit events and accumulates a bidirectional process tree from
//! the fork stream. Exec and exit events are observed but not used to prune
//! the tree. The connector is unavailable inside some virtualized kernels
//! and without CAP_NET_ADMIN; that only degrades the session, it never
//! fails it.
//!
//! The wire format is `nlmsghdr` + `cn_msg` + `proc_event`, all in host
//! byte order (linux/connector.h, linux/cn_proc.h).

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};

use crate::errors::MonitorError;
use crate::report::PeMonitorReport;

// linux/connector.h
const CN_IDX_PROC: u32 = 0x1;
const CN_VAL_PROC: u32 = 0x1;

// linux/cn_proc.h
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_CN_MCAST_IGNORE: u32 = 2;
const PROC_EVENT_FORK: u32 = 0x00000001;
const PROC_EVENT_EXEC: u32 = 0x00000002;
const PROC_EVENT_EXIT: u32 = 0x80000000;

const NLMSG_HDRLEN: usize = 16;
const CN_MSG_LEN: usize = 20;
const PROC_EVENT_HDRLEN: usize = 16;

/// Receive timeout; bounds how long the loop can miss the stop signal.
const RECV_TIMEOUT_MS: i64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEvent {
    Fork { parent: i32, child: i32 },
    Exec { pid: i32 },
    Exit { pid: i32 },
}

/// Netlink connector socket subscribed to process events.
struct NetlinkSocket {
    fd: RawFd,
    seq: u32,
}

impl NetlinkSocket {
    fn connect() -> io::Result<NetlinkSocket> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_CONNECTOR,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut sock = NetlinkSocket { fd, seq: 0 };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = std::process::id();
        addr.nl_groups = CN_IDX_PROC;
        let rc = unsafe {
            libc::bind(
                sock.fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: (RECV_TIMEOUT_MS * 1000) as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        sock.send_op(PROC_CN_MCAST_LISTEN)?;
        Ok(sock)
    }

    /// Send a PROC_CN_MCAST_* control message to the connector driver.
    fn send_op(&mut self, op: u32) -> io::Result<()> {
        self.seq += 1;
        let total = NLMSG_HDRLEN + CN_MSG_LEN + 4;

        let mut buf = Vec::with_capacity(total);
        // nlmsghdr
        buf.extend_from_slice(&(total as u32).to_ne_bytes());
        buf.extend_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&self.seq.to_ne_bytes());
        buf.extend_from_slice(&std::process::id().to_ne_bytes());
        // cn_msg
        buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
        buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
        buf.extend_from_slice(&self.seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&4u16.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        // op
        buf.extend_from_slice(&op.to_ne_bytes());

        let sent = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // Best effort unsubscribe before closing.
        let _ = self.send_op(PROC_CN_MCAST_IGNORE);
        unsafe { libc::close(self.fd) };
    }
}

pub struct PeMonitor {
    sock: NetlinkSocket,
}

impl PeMonitor {
    /// Bind the connector socket and subscribe. A failure here means the
    /// facility is unavailable; the caller degrades the session.
    pub fn init() -> Result<PeMonitor, MonitorError> {
        let sock = NetlinkSocket::connect().map_err(MonitorError::NetlinkUnavailable)?;
        info!("pemon: subscribed to process events");
        Ok(PeMonitor { sock })
    }

    /// Start the collection thread; delivers the accumulated tree exactly
    /// once when the stop signal fires (or the loop dies on a malformed
    /// message, in which case the partial tree is still delivered).
    pub fn run(self, stop: Arc<AtomicBool>) -> Receiver<PeMonitorReport> {
        let (report_tx, report_rx) = channel();

        thread::spawn(move || {
            let mut report = PeMonitorReport::default();
            let mut buf = vec![0u8; 8192];

            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match self.sock.recv(&mut buf) {
                    Ok(n) => match parse_messages(&buf[..n]) {
                        Ok(events) => {
                            for event in events {
                                handle_event(&mut report, event);
                            }
                        }
                        Err(err) => {
                            error!("pemon: {}", err);
                            break;
                        }
                    },
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::TimedOut
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        continue;
                    }
                    Err(err) => {
                        warn!("pemon: receive error: {}", err);
                    }
                }
            }

            info!(
                "pemon: done, {} events, {} tracked parents",
                report.event_count,
                report.children.len()
            );
            let _ = report_tx.send(report);
            // Socket drops here: unsubscribe + close.
        });

        report_rx
    }
}

fn handle_event(report: &mut PeMonitorReport, event: ProcEvent) {
    match event {
        ProcEvent::Fork { parent, child } => report.record_fork(parent, child),
        ProcEvent::Exec { pid } => {
            debug!("pemon: exec pid {}", pid);
            report.event_count += 1;
        }
        ProcEvent::Exit { pid } => {
            debug!("pemon: exit pid {}", pid);
            report.event_count += 1;
        }
    }
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_ne_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

/// Split a datagram into netlink messages and decode the process events it
/// carries. A truncated or inconsistent message is a protocol error.
fn parse_messages(buf: &[u8]) -> Result<Vec<ProcEvent>, MonitorError> {
    let mut events = Vec::new();
    let mut off = 0usize;

    while off + NLMSG_HDRLEN <= buf.len() {
        let msg_len = read_u32(buf, off).ok_or(MonitorError::MalformedEvent)? as usize;
        let msg_type = read_u16(buf, off + 4).ok_or(MonitorError::MalformedEvent)?;
        if msg_len < NLMSG_HDRLEN || off + msg_len > buf.len() {
            return Err(MonitorError::MalformedEvent);
        }

        if msg_type == libc::NLMSG_DONE as u16 {
            if let Some(event) = decode_proc_event(&buf[off + NLMSG_HDRLEN..off + msg_len])? {
                events.push(event);
            }
        }

        // Messages are 4-byte aligned within a datagram.
        off += (msg_len + 3) & !3;
    }

    Ok(events)
}

/// Decode one `cn_msg` + `proc_event` payload. Events other than
/// fork/exec/exit are ignored.
fn decode_proc_event(payload: &[u8]) -> Result<Option<ProcEvent>, MonitorError> {
    if payload.len() < CN_MSG_LEN + PROC_EVENT_HDRLEN {
        return Err(MonitorError::MalformedEvent);
    }
    let idx = read_u32(payload, 0).ok_or(MonitorError::MalformedEvent)?;
    if idx != CN_IDX_PROC {
        return Ok(None);
    }

    let what = read_u32(payload, CN_MSG_LEN).ok_or(MonitorError::MalformedEvent)?;
    let data = CN_MSG_LEN + PROC_EVENT_HDRLEN;

    match what {
        PROC_EVENT_FORK => {
            let parent_tgid = read_u32(payload, data + 4).ok_or(MonitorError::MalformedEvent)?;
            let child_tgid = read_u32(payload, data + 12).ok_or(MonitorError::MalformedEvent)?;
            Ok(Some(ProcEvent::Fork {
                parent: parent_tgid as i32,
                child: child_tgid as i32,
            }))
        }
        PROC_EVENT_EXEC => {
            let tgid = read_u32(payload, data + 4).ok_or(MonitorError::MalformedEvent)?;
            Ok(Some(ProcEvent::Exec { pid: tgid as i32 }))
        }
        PROC_EVENT_EXIT => {
            let tgid = read_u32(payload, data + 4).ok_or(MonitorError::MalformedEvent)?;
            Ok(Some(ProcEvent::Exit { pid: tgid as i32 }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Build one netlink datagram carrying a single proc_event.
    fn netlink_message(what: u32, fields: [u32; 4]) -> Vec<u8> {
        let payload_len = CN_MSG_LEN + PROC_EVENT_HDRLEN + 16;
        let total = NLMSG_HDRLEN + payload_len;
        let mut buf = Vec::new();
        // nlmsghdr
        push_u32(&mut buf, total as u32);
        push_u16(&mut buf, libc::NLMSG_DONE as u16);
        push_u16(&mut buf, 0);
        push_u32(&mut buf, 1);
        push_u32(&mut buf, 0);
        // cn_msg
        push_u32(&mut buf, CN_IDX_PROC);
        push_u32(&mut buf, CN_VAL_PROC);
        push_u32(&mut buf, 1);
        push_u32(&mut buf, 0);
        push_u16(&mut buf, (PROC_EVENT_HDRLEN + 16) as u16);
        push_u16(&mut buf, 0);
        // proc_event header: what, cpu, timestamp_ns
        push_u32(&mut buf, what);
        push_u32(&mut buf, 0);
        buf.extend_from_slice(&0u64.to_ne_bytes());
        // event data
        for field in fields {
            push_u32(&mut buf, field);
        }
        buf
    }

    #[test]
    fn test_fork_event_decodes_tgids() {
        // fork data: parent_pid, parent_tgid, child_pid, child_tgid
        let buf = netlink_message(PROC_EVENT_FORK, [101, 100, 201, 200]);
        let events = parse_messages(&buf).unwrap();
        assert_eq!(
            events,
            vec![ProcEvent::Fork {
                parent: 100,
                child: 200
            }]
        );
    }

    #[test]
    fn test_exec_and_exit_events() {
        let buf = netlink_message(PROC_EVENT_EXEC, [301, 300, 0, 0]);
        assert_eq!(parse_messages(&buf).unwrap(), vec![ProcEvent::Exec { pid: 300 }]);

        let buf = netlink_message(PROC_EVENT_EXIT, [401, 400, 1, 0]);
        assert_eq!(parse_messages(&buf).unwrap(), vec![ProcEvent::Exit { pid: 400 }]);
    }

    #[test]
    fn test_unknown_event_kind_is_skipped() {
        let buf = netlink_message(0x400, [1, 2, 3, 4]);
        assert!(parse_messages(&buf).unwrap().is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_datagram() {
        let mut buf = netlink_message(PROC_EVENT_FORK, [11, 10, 21, 20]);
        buf.extend_from_slice(&netlink_message(PROC_EVENT_FORK, [21, 20, 31, 30]));
        let events = parse_messages(&buf).unwrap();
        assert_eq!(events.len(), 2);

        let mut report = PeMonitorReport::default();
        for event in events {
            handle_event(&mut report, event);
        }
        let mut pids = report.subtree(10);
        pids.sort_unstable();
        assert_eq!(pids, vec![10, 20, 30]);
    }

    #[test]
    fn test_truncated_message_is_malformed() {
        let mut buf = netlink_message(PROC_EVENT_FORK, [1, 1, 2, 2]);
        buf.truncate(NLMSG_HDRLEN + 10);
        assert!(parse_messages(&buf).is_err());
    }

    #[test]
    fn test_fork_updates_both_tree_directions() {
        let mut report = PeMonitorReport::default();
        handle_event(
            &mut report,
            ProcEvent::Fork {
                parent: 1,
                child: 7,
            },
        );
        assert_eq!(report.children[&1], vec![7]);
        assert_eq!(report.parents[&7], 1);
    }
}
