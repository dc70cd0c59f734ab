//! Artifact resolution engine.
//!
//! Turns the aggregate monitor report into the canonical, deduplicated
//! artifact inventory: every touched path is classified with `lstat`,
//! regular files get a content hash and a best-effort data type, per-process
//! access counters are merged into one flag set per path, and symlink
//! targets that were never directly observed are recovered through a
//! one-time inode reverse index over the mount point (which also picks up
//! bind-mount and hard-link aliases). The inventory is emitted in
//! lexicographic path order so repeated resolution of the same report
//! against the same filesystem state is byte-identical.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use log::{debug, warn};
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::report::{
    ArtifactProps, ArtifactType, ContainerReport, FanMonitorReport, MonitorReport,
};

/// Upper bound on pending-target resolution passes; each pass can only add
/// paths, so this only guards against pathological link farms.
const MAX_RESOLVE_PASSES: usize = 8;

/// Options for one resolution run.
#[derive(Debug, Clone, Default)]
pub struct ArtifactOptions {
    /// Restrict file activity to the target process subtree. Off by
    /// default: without it all observed activity on the mount resolves into
    /// artifacts regardless of which process touched it.
    pub scope_to_target: bool,
    pub target_pid: i32,
}

/// Immutable inode -> paths lookup table built from one walk of the mount
/// point. Symlinks are recorded under their followed inode, so aliases of a
/// link target (including the target itself) share an entry.
struct InodeIndex {
    dev: u64,
    paths: HashMap<u64, Vec<String>>,
}

impl InodeIndex {
    fn build(mount_point: &Path) -> Option<InodeIndex> {
        let dev = fs::metadata(mount_point).ok()?.dev();
        let mut paths: HashMap<u64, Vec<String>> = HashMap::new();

        let walker = WalkDir::new(mount_point)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                // Stay on the mount's filesystem; other mounts hang off
                // directories.
                if entry.file_type().is_dir() {
                    match entry.metadata() {
                        Ok(meta) => meta.dev() == dev,
                        Err(_) => false,
                    }
                } else {
                    true
                }
            });

        for entry in walker.filter_map(|e| e.ok()) {
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            // Follow the path so a symlink lands on its target's inode,
            // the way `find -L -printf "%i %p"` reports it.
            let Ok(meta) = fs::metadata(entry.path()) else {
                continue;
            };
            if meta.dev() != dev || !meta.is_file() {
                continue;
            }
            paths
                .entry(meta.ino())
                .or_default()
                .push(entry.path().display().to_string());
        }

        Some(InodeIndex { dev, paths })
    }

    fn aliases(&self, dev: u64, ino: u64) -> &[String] {
        if dev != self.dev {
            return &[];
        }
        self.paths.get(&ino).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub struct ArtifactStore {
    store_location: PathBuf,
    mount_point: PathBuf,
    report: MonitorReport,
    options: ArtifactOptions,
    /// Prepared artifacts keyed by path; the key order is the emit order.
    raw: BTreeMap<String, ArtifactProps>,
    /// Link targets awaiting inode-alias resolution, already absolute.
    resolve: BTreeSet<String>,
}

impl ArtifactStore {
    pub fn new(
        store_location: &Path,
        mount_point: &Path,
        report: MonitorReport,
        options: ArtifactOptions,
    ) -> ArtifactStore {
        ArtifactStore {
            store_location: store_location.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            report,
            options,
            raw: BTreeMap::new(),
            resolve: BTreeSet::new(),
        }
    }

    /// Run the full resolution pass: touched-path union, per-path
    /// classification, and pending-link resolution through the inode index.
    pub fn resolve_artifacts(&mut self) {
        for path in self.collect_touched() {
            self.prepare_artifact(&path);
        }
        self.resolve_links();
    }

    /// Union of all touched paths, optionally scoped to the target process
    /// subtree. Scoping needs the process tree; a degraded session falls
    /// back to all observed processes.
    fn collect_touched(&self) -> Vec<String> {
        let scope = if self.options.scope_to_target {
            match self.report.ptree {
                Some(ref tree) => Some(tree.subtree(self.options.target_pid)),
                None => {
                    warn!("artifacts: no process tree, scoping to all observed processes");
                    None
                }
            }
        } else {
            None
        };

        let mut touched = BTreeSet::new();
        for (pid, files) in &self.report.fan.process_files {
            if let Some(ref pids) = scope {
                match pid.parse::<i32>() {
                    Ok(pid) if pids.contains(&pid) => {}
                    _ => continue,
                }
            }
            for path in files.keys() {
                touched.insert(path.clone());
            }
        }
        touched.into_iter().collect()
    }

    fn prepare_artifact(&mut self, path: &str) {
        if self.raw.contains_key(path) {
            return;
        }
        // No-follow so symlinks classify as themselves.
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                // Raced with a short-lived file; skip, never fail the pass.
                warn!("artifacts: {} vanished before resolution: {}", path, err);
                return;
            }
        };

        let mut props = ArtifactProps {
            file_path: path.to_string(),
            mode: mode_text(&meta),
            file_size: meta.len() as i64,
            flags: artifact_flags(&self.report.fan, path),
            ..Default::default()
        };

        let file_type = meta.file_type();
        if file_type.is_file() {
            props.file_type = ArtifactType::File;
            props.sha1_hash = file_hash(path);
            props.data_type = file_data_type(path);
        } else if file_type.is_symlink() {
            props.file_type = ArtifactType::Symlink;
            match fs::read_link(path) {
                Ok(target) => {
                    let target = target.display().to_string();
                    let absolute = absolutize(Path::new(path), &target);
                    if !self.raw.contains_key(&absolute) {
                        self.resolve.insert(absolute);
                    }
                    props.link_ref = Some(target);
                }
                Err(err) => {
                    warn!("artifacts: unreadable symlink target for {}: {}", path, err);
                    props.link_unresolved = true;
                }
            }
        } else if file_type.is_dir() {
            // Directories are not normally touched directly; keep them but
            // mark the anomaly.
            warn!("artifacts: directory in touched set: {}", path);
            props.file_type = ArtifactType::Dir;
            props.unexpected = true;
        } else {
            warn!("artifacts: unexpected file type: {}", path);
            props.file_type = ArtifactType::Unknown;
        }

        self.raw.insert(path.to_string(), props);
    }

    /// Map paths to inodes and pull in every path aliasing those inodes.
    ///
    /// The lookup set covers the pending link targets and every observed
    /// regular file: a bind-mount duplicate or a symlink to an observed
    /// binary is reachable only through its inode. Newly added aliases may
    /// register further pending targets, so the pass repeats until the set
    /// drains.
    fn resolve_links(&mut self) {
        let mut pending = std::mem::take(&mut self.resolve);
        for (path, props) in &self.raw {
            if props.file_type == ArtifactType::File {
                pending.insert(path.clone());
            }
        }
        if pending.is_empty() {
            return;
        }

        let Some(index) = InodeIndex::build(&self.mount_point) else {
            warn!(
                "artifacts: cannot index {}, links left unresolved",
                self.mount_point.display()
            );
            return;
        };

        for _ in 0..MAX_RESOLVE_PASSES {
            if pending.is_empty() {
                break;
            }
            for target in std::mem::take(&mut pending) {
                let meta = match fs::metadata(&target) {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!("artifacts: link target {} not resolvable: {}", target, err);
                        continue;
                    }
                };
                for alias in index.aliases(meta.dev(), meta.ino()).to_vec() {
                    self.prepare_artifact(&alias);
                }
            }
            // Aliases that were symlinks may have queued new targets.
            pending = std::mem::take(&mut self.resolve);
        }
    }

    /// The resolved inventory in lexicographic path order.
    pub fn artifacts(&self) -> Vec<ArtifactProps> {
        self.raw.values().cloned().collect()
    }

    /// Copy regular-file artifacts into `<store>/files/<path>` preserving
    /// their mode, and re-create symlink artifacts. Per-entry errors are
    /// logged and never abort the pass.
    pub fn save_artifacts(&self) {
        let files_root = self.store_location.join("files");
        for (path, props) in &self.raw {
            let dst = files_root.join(path.trim_start_matches('/'));
            match props.file_type {
                ArtifactType::File => {
                    if let Err(err) = copy_preserving_mode(Path::new(path), &dst) {
                        warn!("artifacts: error saving {}: {}", path, err);
                    }
                }
                ArtifactType::Symlink => {
                    let Some(ref target) = props.link_ref else {
                        continue;
                    };
                    if let Some(dir) = dst.parent() {
                        if let Err(err) = fs::create_dir_all(dir) {
                            warn!("artifacts: dir error for {}: {}", path, err);
                            continue;
                        }
                    }
                    if let Err(err) = symlink(target, &dst) {
                        warn!("artifacts: symlink create error for {}: {}", path, err);
                    }
                }
                ArtifactType::Dir | ArtifactType::Unknown => {}
            }
        }
    }

    /// Build and persist the final `ContainerReport`.
    pub fn save_report(&self, report_path: &Path) -> anyhow::Result<ContainerReport> {
        let report = ContainerReport::new(
            self.report.pt.clone(),
            self.report.fan.clone(),
            self.artifacts(),
        );
        report.save(report_path)?;
        Ok(report)
    }
}

/// Merge every process's access counters for `path` into one R/W/X set;
/// absent when nothing recorded any access kind.
fn artifact_flags(fan: &FanMonitorReport, path: &str) -> Option<BTreeMap<String, bool>> {
    let mut flags = BTreeMap::new();
    for files in fan.process_files.values() {
        if let Some(info) = files.get(path) {
            if info.reads > 0 {
                flags.insert("R".to_string(), true);
            }
            if info.writes > 0 {
                flags.insert("W".to_string(), true);
            }
            if info.execs > 0 {
                flags.insert("X".to_string(), true);
            }
        }
    }
    if flags.is_empty() {
        None
    } else {
        Some(flags)
    }
}

/// Render a `ls -l` style mode string from the lstat result.
fn mode_text(meta: &fs::Metadata) -> String {
    let mode = meta.permissions().mode();
    let file_type = meta.file_type();

    let type_char = if file_type.is_dir() {
        'd'
    } else if file_type.is_symlink() {
        'l'
    } else if file_type.is_file() {
        '-'
    } else {
        '?'
    };

    let mut text = String::with_capacity(10);
    text.push(type_char);
    let triplets = [
        (mode >> 6, mode & 0o4000 != 0, 's'),
        (mode >> 3, mode & 0o2000 != 0, 's'),
        (mode, mode & 0o1000 != 0, 't'),
    ];
    for (bits, special, special_char) in triplets {
        text.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        text.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        text.push(match (exec, special) {
            (true, false) => 'x',
            (false, false) => '-',
            (true, true) => special_char,
            (false, true) => special_char.to_ascii_uppercase(),
        });
    }
    text
}

/// SHA-1 digest of the file contents, absent when the file cannot be read.
fn file_hash(path: &str) -> Option<String> {
    let data = fs::read(path).ok()?;
    let mut hasher = Sha1::new();
    hasher.update(&data);
    Some(hex::encode(hasher.finalize()))
}

/// Best-effort content classification via file(1).
fn file_data_type(path: &str) -> Option<String> {
    let output = Command::new("file").arg(path).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let (_, data_type) = stdout.trim().split_once(':')?;
    Some(data_type.trim().to_string())
}

/// Make a symlink target absolute relative to the link's directory,
/// resolving `.` and `..` lexically.
fn absolutize(link_path: &Path, target: &str) -> String {
    let target_path = Path::new(target);
    let joined = if target_path.is_absolute() {
        target_path.to_path_buf()
    } else {
        link_path
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .join(target_path)
    };

    let mut normalized = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized.display().to_string()
}

fn copy_preserving_mode(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(dir) = dst.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::copy(src, dst)?;
    let mode = fs::metadata(src)?.permissions().mode();
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    debug!("artifacts: saved {} -> {}", src.display(), dst.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FileInfo;

    fn fan_with(path: &str, pid: i32, reads: u32, writes: u32, execs: u32) -> FanMonitorReport {
        let mut fan = FanMonitorReport::default();
        fan.process_files.entry(pid.to_string()).or_default().insert(
            path.to_string(),
            FileInfo {
                event_count: reads + writes + execs,
                first_eid: 1,
                reads,
                writes,
                execs,
            },
        );
        fan
    }

    #[test]
    fn test_flags_merge_across_processes() {
        let mut fan = fan_with("/data/log", 10, 2, 0, 0);
        fan.process_files.entry("11".to_string()).or_default().insert(
            "/data/log".to_string(),
            FileInfo {
                event_count: 1,
                first_eid: 5,
                writes: 1,
                ..Default::default()
            },
        );

        let flags = artifact_flags(&fan, "/data/log").unwrap();
        assert!(flags["R"]);
        assert!(flags["W"]);
        assert!(!flags.contains_key("X"));
    }

    #[test]
    fn test_flags_absent_when_untouched() {
        let fan = fan_with("/data/log", 10, 1, 0, 0);
        assert!(artifact_flags(&fan, "/data/other").is_none());
    }

    #[test]
    fn test_absolutize_relative_target() {
        assert_eq!(absolutize(Path::new("/bin/sh"), "busybox"), "/bin/busybox");
        assert_eq!(
            absolutize(Path::new("/usr/bin/vi"), "../lib/vim"),
            "/usr/lib/vim"
        );
        assert_eq!(
            absolutize(Path::new("/bin/sh"), "/usr/bin/dash"),
            "/usr/bin/dash"
        );
        assert_eq!(absolutize(Path::new("/bin/sh"), "./dash"), "/bin/dash");
    }

    #[test]
    fn test_absolutize_does_not_escape_root() {
        assert_eq!(absolutize(Path::new("/bin/sh"), "../../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn test_mode_text_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let meta = fs::symlink_metadata(&path).unwrap();
        assert_eq!(mode_text(&meta), "-rwxr-xr-x");

        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        let meta = fs::symlink_metadata(&path).unwrap();
        assert_eq!(mode_text(&meta), "-rw-r-----");
    }

    #[test]
    fn test_mode_text_setuid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o4755)).unwrap();
        let meta = fs::symlink_metadata(&path).unwrap();
        assert_eq!(mode_text(&meta), "-rwsr-xr-x");
    }

    #[test]
    fn test_file_hash_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hello\n").unwrap();
        // sha1("hello\n")
        assert_eq!(
            file_hash(path.to_str().unwrap()).unwrap(),
            "f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }
}
