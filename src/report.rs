//! Report data model shared by the monitors and the artifact resolution
//! engine, plus the persisted `creport.json` document that downstream image
//! and profile tooling consumes.
//!
//! Map-valued fields use `BTreeMap` so a report serializes identically across
//! runs; consumers treat absent optional fields as "not applicable".

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-syscall-number execution statistics, frozen once the session report
/// is finalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyscallStatInfo {
    pub num: u64,
    pub name: String,
    pub count: u64,
}

/// Report from the syscall monitor for one monitoring session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PtMonitorReport {
    pub arch_name: String,
    /// Total syscall executions; equals the sum of all per-syscall counts.
    pub syscall_count: u64,
    /// Number of distinct syscalls observed.
    pub syscall_num: u32,
    /// Keyed by the decimal syscall number.
    pub syscall_stats: BTreeMap<String, SyscallStatInfo>,
}

/// Metadata for one observed process, resolved once per pid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    pub path: String,
    pub cmd: String,
    pub cwd: String,
    pub root: String,
    pub ppid: i32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Access counters for one path as touched by one process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub event_count: u32,
    pub first_eid: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reads: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub writes: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub execs: u32,
}

/// Report from the file access monitor. `processes` and `process_files` are
/// keyed by the decimal pid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanMonitorReport {
    pub monitor_pid: i32,
    pub monitor_ppid: i32,
    pub event_count: u32,
    pub main_process: Option<ProcessInfo>,
    pub processes: BTreeMap<String, ProcessInfo>,
    pub process_files: BTreeMap<String, BTreeMap<String, FileInfo>>,
}

/// Fork/exec/exit relationships accumulated by the process event monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeMonitorReport {
    pub event_count: u32,
    /// parent pid -> child pids, in fork-delivery order.
    pub children: BTreeMap<i32, Vec<i32>>,
    /// child pid -> parent pid.
    pub parents: BTreeMap<i32, i32>,
}

impl PeMonitorReport {
    pub fn record_fork(&mut self, parent: i32, child: i32) {
        self.children.entry(parent).or_default().push(child);
        self.parents.insert(child, parent);
        self.event_count += 1;
    }

    /// The pid plus every descendant reachable through recorded forks.
    pub fn subtree(&self, root: i32) -> Vec<i32> {
        let mut pids = vec![root];
        let mut queue = vec![root];
        while let Some(pid) = queue.pop() {
            if let Some(kids) = self.children.get(&pid) {
                for &kid in kids {
                    if !pids.contains(&kid) {
                        pids.push(kid);
                        queue.push(kid);
                    }
                }
            }
        }
        pids
    }
}

/// Aggregate session report handed from the coordinator to the artifact
/// resolution engine. The process tree is absent when the process event
/// monitor is unavailable (degraded session).
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub pt: PtMonitorReport,
    pub fan: FanMonitorReport,
    pub ptree: Option<PeMonitorReport>,
}

/// Filesystem entry classification for one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactType {
    Dir,
    File,
    Symlink,
    Unknown,
}

impl Default for ArtifactType {
    fn default() -> Self {
        ArtifactType::Unknown
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Canonical record for one resolved filesystem path. Identity is the path
/// string; the record is immutable once prepared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactProps {
    pub file_type: ArtifactType,
    pub file_path: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_ref: Option<String>,
    /// Set when a symlink's target could not be read; `link_ref` is then
    /// empty.
    #[serde(default, skip_serializing_if = "is_false")]
    pub link_unresolved: bool,
    /// Set on directory artifacts, which are anomalies in the touched set.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unexpected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub file_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageReport {
    pub files: Vec<ArtifactProps>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorReports {
    pub fan: FanMonitorReport,
    pub pt: PtMonitorReport,
}

/// The externally persisted session result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerReport {
    pub monitors: MonitorReports,
    pub image: ImageReport,
}

impl ContainerReport {
    pub fn new(pt: PtMonitorReport, fan: FanMonitorReport, files: Vec<ArtifactProps>) -> Self {
        ContainerReport {
            monitors: MonitorReports { fan, pt },
            image: ImageReport { files },
        }
    }

    /// Write the report as pretty-printed JSON, creating the parent
    /// directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating report dir {}", dir.display()))?;
        }
        let data = serde_json::to_vec_pretty(self).context("serializing container report")?;
        fs::write(path, data).with_context(|| format!("writing report {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_stats_sum_matches_count() {
        let mut report = PtMonitorReport {
            arch_name: "amd64".to_string(),
            ..Default::default()
        };
        for (num, count) in [(0u64, 10u64), (1, 4), (257, 2)] {
            report.syscall_stats.insert(
                num.to_string(),
                SyscallStatInfo {
                    num,
                    name: format!("sys_{num}"),
                    count,
                },
            );
            report.syscall_count += count;
        }
        report.syscall_num = report.syscall_stats.len() as u32;

        let total: u64 = report.syscall_stats.values().map(|s| s.count).sum();
        assert_eq!(total, report.syscall_count);
        assert_eq!(report.syscall_num, 3);
    }

    #[test]
    fn test_file_info_zero_counts_omitted() {
        let fi = FileInfo {
            event_count: 3,
            first_eid: 7,
            reads: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&fi).unwrap();
        assert!(json.contains("\"reads\":3"));
        assert!(!json.contains("writes"));
        assert!(!json.contains("execs"));
    }

    #[test]
    fn test_artifact_type_serializes_as_text() {
        let props = ArtifactProps {
            file_type: ArtifactType::Symlink,
            file_path: "/bin/sh".to_string(),
            link_ref: Some("/bin/busybox".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&props).unwrap();
        assert!(json.contains("\"file_type\":\"Symlink\""));
        assert!(json.contains("\"link_ref\":\"/bin/busybox\""));
        // optional fields absent, not null
        assert!(!json.contains("sha1_hash"));
        assert!(!json.contains("data_type"));
        assert!(!json.contains("link_unresolved"));
    }

    #[test]
    fn test_subtree_walks_descendants() {
        let mut tree = PeMonitorReport::default();
        tree.record_fork(1, 10);
        tree.record_fork(10, 11);
        tree.record_fork(10, 12);
        tree.record_fork(2, 20);

        let mut pids = tree.subtree(10);
        pids.sort_unstable();
        assert_eq!(pids, vec![10, 11, 12]);
        assert_eq!(tree.parents[&11], 10);
        assert_eq!(tree.event_count, 4);
    }

    #[test]
    fn test_subtree_tolerates_fork_cycles() {
        // A recycled pid can produce a loop in raw fork data; the walk must
        // still terminate.
        let mut tree = PeMonitorReport::default();
        tree.record_fork(5, 6);
        tree.record_fork(6, 5);
        let mut pids = tree.subtree(5);
        pids.sort_unstable();
        assert_eq!(pids, vec![5, 6]);
    }

    #[test]
    fn test_container_report_shape() {
        let report = ContainerReport::new(
            PtMonitorReport::default(),
            FanMonitorReport::default(),
            vec![ArtifactProps {
                file_type: ArtifactType::File,
                file_path: "/usr/lib/libfoo.so".to_string(),
                ..Default::default()
            }],
        );
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert!(value["monitors"]["pt"].is_object());
        assert!(value["monitors"]["fan"].is_object());
        assert_eq!(
            value["image"]["files"][0]["file_path"],
            "/usr/lib/libfoo.so"
        );
    }
}
