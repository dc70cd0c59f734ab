//! Live monitor tests against the real kernel facilities.
//!
//! These need root (fanotify and the netlink process connector are
//! privileged) and are `#[ignore]`d by default:
//!
//! ```
//! sudo cargo test --test live_monitors -- --ignored
//! ```

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slimwatch::fanmon::FanMonitor;
use slimwatch::pemon::PeMonitor;
use slimwatch::ptmon::{self, PtMonitorConfig};
use tempfile::TempDir;

#[test]
#[ignore] // Requires CAP_SYS_ADMIN
fn fanmon_observes_file_access_and_stop_is_idempotent() {
    let monitor = FanMonitor::init(std::path::Path::new("/")).expect("fanotify init");
    let stop = Arc::new(AtomicBool::new(false));
    let report_rx = monitor.run(Arc::clone(&stop));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("probe");
    fs::write(&path, b"probe").unwrap();
    let _ = fs::read(&path).unwrap();
    thread::sleep(Duration::from_millis(300));

    // Stop more than once; exactly one completion report may arrive.
    stop.store(true, Ordering::Release);
    stop.store(true, Ordering::Release);

    let report = report_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("one report");
    assert!(report.event_count > 0);
    assert!(report_rx.recv_timeout(Duration::from_secs(1)).is_err());
}

#[test]
#[ignore] // Requires root for the netlink process connector
fn pemon_tracks_forks() {
    let monitor = PeMonitor::init().expect("netlink init");
    let stop = Arc::new(AtomicBool::new(false));
    let report_rx = monitor.run(Arc::clone(&stop));

    // Fork some children for the connector to report.
    for _ in 0..3 {
        std::process::Command::new("true").status().unwrap();
    }
    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Release);

    let report = report_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("one report");
    assert!(report.event_count > 0);
    let me = std::process::id() as i32;
    assert!(report.children.contains_key(&me));
    assert!(report_rx.recv_timeout(Duration::from_secs(1)).is_err());
}

#[test]
#[ignore] // Requires ptrace permission for child processes
fn ptmon_counts_syscalls_of_short_command() {
    let (start_tx, start_rx) = channel();
    let stop = Arc::new(AtomicBool::new(false));
    let report_rx = ptmon::run(
        start_tx,
        Arc::clone(&stop),
        PtMonitorConfig {
            command: "true".to_string(),
            args: Vec::new(),
            workdir: std::env::current_dir().unwrap(),
            run_as_user: None,
        },
    );

    let pid = start_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("launch notification")
        .expect("launch ok");
    assert!(pid.as_raw() > 0);

    let report = report_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("one report");
    assert!(report.syscall_count > 0);
    let total: u64 = report.syscall_stats.values().map(|s| s.count).sum();
    assert_eq!(total, report.syscall_count);
    assert!(report_rx.recv_timeout(Duration::from_secs(1)).is_err());
}
