//! IPC control plane.
//!
//! A remote controller tells the sensor when to stop monitoring over a
//! request/reply command endpoint, and the sensor announces completion on a
//! publish endpoint. One request is in flight at a time; the request body is
//! a bare UTF-8 command string and the reply is always the fixed `ok` ack.
//! The command loop polls with a repeating short timeout purely so
//! process-level termination is noticed; the timeout is not an error. Both
//! endpoints close unconditionally on drop, whichever state the session
//! reached.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::errors::SensorError;

/// The one command the sensor acts on; everything else is acked and
/// ignored.
pub const CMD_MONITOR_FINISH: &str = "monitor.finish";
/// Completion event broadcast after the report has been persisted.
pub const EVT_MONITOR_FINISH_COMPLETED: &str = "monitor.finish.completed";
/// Completion publishing is best-effort with a bounded number of attempts.
pub const PUBLISH_ATTEMPTS: u32 = 3;

const ACK: &[u8] = b"ok";
const IO_TIMEOUT: Duration = Duration::from_secs(3);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

fn bind(addr: &str) -> Result<TcpListener, SensorError> {
    let listener = TcpListener::bind(addr).map_err(|source| SensorError::Ipc {
        addr: addr.to_string(),
        source,
    })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| SensorError::Ipc {
            addr: addr.to_string(),
            source,
        })?;
    Ok(listener)
}

/// Reply-role command endpoint.
pub struct CommandServer {
    listener: TcpListener,
}

impl CommandServer {
    pub fn bind(addr: &str) -> Result<CommandServer, SensorError> {
        info!("ipc: command server listening on {}", addr);
        Ok(CommandServer {
            listener: bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Start the receive loop. Every received command is forwarded on the
    /// returned channel; filtering is the caller's business. The loop exits
    /// when `done` is set, releasing the listening socket.
    pub fn run(self, done: Arc<AtomicBool>) -> Receiver<String> {
        let (cmd_tx, cmd_rx) = channel();

        thread::spawn(move || loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("ipc: command connection from {}", peer);
                    match handle_request(stream) {
                        Ok(cmd) => {
                            debug!("ipc: got command: {}", cmd);
                            if cmd_tx.send(cmd).is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!("ipc: command request error: {}", err),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if done.load(Ordering::Acquire) {
                        debug!("ipc: command server done");
                        return;
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    warn!("ipc: accept error: {}", err);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        });

        cmd_rx
    }
}

/// Read one command and always send the fixed ack; the reply must go out
/// before the next request is accepted.
fn handle_request(mut stream: TcpStream) -> std::io::Result<String> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf)?;
    let cmd = String::from_utf8_lossy(&buf[..n]).trim().to_string();

    stream.write_all(ACK)?;
    stream.flush()?;
    Ok(cmd)
}

/// Publish-role event endpoint. Subscribers connect; `publish` broadcasts
/// to whoever is connected at that moment, with no delivery guarantee.
pub struct EventPublisher {
    listener: TcpListener,
    subscribers: Vec<TcpStream>,
}

impl EventPublisher {
    pub fn bind(addr: &str) -> Result<EventPublisher, SensorError> {
        info!("ipc: event publisher listening on {}", addr);
        Ok(EventPublisher {
            listener: bind(addr)?,
            subscribers: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr().ok()
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("ipc: event subscriber from {}", peer);
                    if stream.set_write_timeout(Some(IO_TIMEOUT)).is_ok() {
                        self.subscribers.push(stream);
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// Send `event` to every connected subscriber. Waits up to the send
    /// timeout for at least one subscriber to show up, then errors; one
    /// successful write counts as delivered.
    pub fn publish(&mut self, event: &str) -> std::io::Result<()> {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            self.accept_pending();
            if !self.subscribers.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no event subscribers",
                ));
            }
            thread::sleep(ACCEPT_POLL);
        }

        let payload = format!("{event}\n");
        let mut delivered = 0usize;
        self.subscribers.retain_mut(|stream| {
            match stream.write_all(payload.as_bytes()).and_then(|()| stream.flush()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(err) => {
                    debug!("ipc: dropping event subscriber: {}", err);
                    false
                }
            }
        });

        if delivered == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "event delivered to no subscriber",
            ));
        }
        debug!("ipc: published '{}' to {} subscriber(s)", event, delivered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    #[test]
    fn test_command_round_trip_with_ack() {
        let server = CommandServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let cmd_rx = server.run(Arc::clone(&done));

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(CMD_MONITOR_FINISH.as_bytes()).unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");

        let cmd = cmd_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cmd, CMD_MONITOR_FINISH);

        done.store(true, Ordering::Release);
    }

    #[test]
    fn test_unknown_command_is_acked_and_forwarded() {
        let server = CommandServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let cmd_rx = server.run(Arc::clone(&done));

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"monitor.pause").unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");

        // The filter lives in the session loop; the transport forwards
        // everything it receives.
        assert_eq!(
            cmd_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "monitor.pause"
        );

        done.store(true, Ordering::Release);
    }

    #[test]
    fn test_publish_reaches_connected_subscriber() {
        let mut publisher = EventPublisher::bind("127.0.0.1:0").unwrap();
        let addr = publisher.local_addr().unwrap();

        let subscriber = TcpStream::connect(addr).unwrap();
        publisher.publish(EVT_MONITOR_FINISH_COMPLETED).unwrap();

        let mut lines = BufReader::new(subscriber).lines();
        assert_eq!(lines.next().unwrap().unwrap(), EVT_MONITOR_FINISH_COMPLETED);
    }

    #[test]
    fn test_publish_without_subscriber_times_out() {
        let mut publisher = EventPublisher::bind("127.0.0.1:0").unwrap();
        let err = publisher.publish("nobody.listening").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
