use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};

use crate::error::{DevboxError, Result};

pub const DEFAULT_EXCLUDES: &[&str] = &["lost+found"];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

const WAIT_STEP: Duration = Duration::from_millis(50);
const STDERR_TAIL: usize = 512;

/// What to archive, what to leave out, and where the archive lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupPlan {
    source_root: PathBuf,
    exclude: Vec<String>,
    destination: PathBuf,
}

impl BackupPlan {
    pub fn new(
        source_root: impl Into<PathBuf>,
        exclude: Vec<String>,
        destination: impl Into<PathBuf>,
    ) -> Result<Self> {
        let source_root = source_root.into();
        let destination = destination.into();
        if !source_root.is_absolute() || !destination.is_absolute() {
            return Err(DevboxError::config(format!(
                "backup paths must be absolute (source {}, destination {})",
                source_root.display(),
                destination.display()
            )));
        }
        let dest_dir = match (destination.parent(), destination.file_name()) {
            (Some(parent), Some(_)) => parent,
            _ => {
                return Err(DevboxError::config(format!(
                    "backup destination {} has no file name",
                    destination.display()
                )));
            }
        };
        if is_path_within(&lexical(dest_dir), &lexical(&source_root)) {
            return Err(DevboxError::config(format!(
                "backup destination {} lies inside the archived tree {}",
                destination.display(),
                source_root.display()
            )));
        }
        if exclude.iter().any(|p| p.trim().is_empty()) {
            return Err(DevboxError::config("backup exclude patterns must not be empty"));
        }
        Ok(Self {
            source_root,
            exclude,
            destination,
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".partial");
        self.destination.with_file_name(name)
    }
}

/// Well-known archive location for `source_root` under the durable root.
pub fn default_destination(data_root: &Path, source_root: &Path) -> PathBuf {
    if source_root == Path::new("/root") {
        return data_root.join("root_full_backup.tar.gz");
    }
    // Fine-tuning images keep their model cache under an unsloth directory.
    if source_root.to_string_lossy().contains("unsloth") {
        return data_root.join("llama_backup.tar.gz");
    }
    let flattened = source_root.to_string_lossy().replace('/', "_");
    data_root.join(format!("{flattened}_backup.tar.gz"))
}

fn is_path_within(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

fn lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored(PathBuf),
    Skipped,
}

/// Produces and unpacks session snapshots. Implementations block; async
/// callers should hop onto a blocking thread.
pub trait Archiver: Send + Sync {
    fn archive(&self, plan: &BackupPlan) -> Result<PathBuf>;

    fn restore(&self, plan: &BackupPlan) -> Result<RestoreOutcome>;
}

/// Shells out to `tar`, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    tar_bin: PathBuf,
    timeout: Duration,
}

impl TarArchiver {
    pub fn new(tar_bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            tar_bin: tar_bin.into(),
            timeout,
        }
    }

    fn run(&self, mut cmd: Command, what: &str) -> Result<()> {
        let started = Instant::now();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                DevboxError::Backup(format!("failed to spawn {}: {err}", self.tar_bin.display()))
            })?;

        // Drain stderr off-thread so a chatty tar never blocks on a full pipe.
        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    kill_and_reap(&mut child);
                    return Err(DevboxError::Backup(format!(
                        "{what} timed out after {}s",
                        self.timeout.as_secs_f32()
                    )));
                }
                Ok(None) => std::thread::sleep(WAIT_STEP),
                Err(err) => {
                    kill_and_reap(&mut child);
                    return Err(DevboxError::Backup(format!("failed to wait for tar: {err}")));
                }
            }
        };

        if !status.success() {
            let stderr = stderr_reader.join().unwrap_or_default();
            return Err(DevboxError::Backup(format!(
                "{what} exited with {status}: {}",
                tail(&stderr)
            )));
        }
        Ok(())
    }
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self::new("tar", DEFAULT_TIMEOUT)
    }
}

impl Archiver for TarArchiver {
    fn archive(&self, plan: &BackupPlan) -> Result<PathBuf> {
        info!(
            source = %plan.source_root.display(),
            destination = %plan.destination.display(),
            "creating backup"
        );
        if let Some(parent) = plan.destination.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                DevboxError::Backup(format!("cannot create {}: {err}", parent.display()))
            })?;
        }

        let staging = plan.staging_path();
        let mut cmd = Command::new(&self.tar_bin);
        cmd.arg("-czf").arg(&staging);
        for pattern in &plan.exclude {
            cmd.arg("--exclude").arg(pattern);
        }
        cmd.arg("-C").arg(&plan.source_root).arg(".");

        if let Err(err) = self.run(cmd, "tar archive") {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
        fs::rename(&staging, &plan.destination).map_err(|err| {
            let _ = fs::remove_file(&staging);
            DevboxError::Backup(format!(
                "cannot move archive into {}: {err}",
                plan.destination.display()
            ))
        })?;

        info!(destination = %plan.destination.display(), "backup saved");
        Ok(plan.destination.clone())
    }

    fn restore(&self, plan: &BackupPlan) -> Result<RestoreOutcome> {
        if !plan.destination.is_file() {
            info!(archive = %plan.destination.display(), "no previous backup to restore");
            return Ok(RestoreOutcome::Skipped);
        }
        fs::create_dir_all(&plan.source_root).map_err(|err| {
            DevboxError::Backup(format!("cannot create {}: {err}", plan.source_root.display()))
        })?;

        let mut cmd = Command::new(&self.tar_bin);
        cmd.arg("-xzf")
            .arg(&plan.destination)
            .arg("-C")
            .arg(&plan.source_root);
        self.run(cmd, "tar extract")?;

        info!(
            archive = %plan.destination.display(),
            target = %plan.source_root.display(),
            "restored previous backup"
        );
        Ok(RestoreOutcome::Restored(plan.destination.clone()))
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn tail(output: &str) -> &str {
    let trimmed = output.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &trimmed[start..]
}

/// An armed, at-most-once backup.
///
/// Fires on [`BackupGuard::fire`], or on drop if nobody fired it first, so
/// unwinding and early returns still leave a snapshot behind.
pub struct BackupGuard {
    armed: Option<(Arc<dyn Archiver>, BackupPlan)>,
}

impl BackupGuard {
    pub fn arm(archiver: Arc<dyn Archiver>, plan: BackupPlan) -> Self {
        info!(destination = %plan.destination.display(), "backup registered for session end");
        Self {
            armed: Some((archiver, plan)),
        }
    }

    /// Run the backup now. Returns `None` if it already ran.
    pub fn fire(&mut self) -> Option<Result<PathBuf>> {
        let (archiver, plan) = self.armed.take()?;
        Some(run_logged(archiver.as_ref(), &plan))
    }

    /// Like [`fire`](Self::fire) but runs the archiver on the blocking pool.
    pub async fn fire_blocking(mut self) -> Option<Result<PathBuf>> {
        let (archiver, plan) = self.armed.take()?;
        let joined = tokio::task::spawn_blocking(move || run_logged(archiver.as_ref(), &plan)).await;
        Some(joined.unwrap_or_else(|err| {
            Err(DevboxError::Backup(format!("backup task failed: {err}")))
        }))
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if self.armed.is_none() {
            return;
        }
        warn!("session ended without an explicit stop; running backup from drop");
        // tar can run for the whole backup timeout. On a multi-thread runtime
        // hand the worker's other tasks off first; a current-thread runtime has
        // nowhere to move them, so it blocks.
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let _ = tokio::task::block_in_place(|| self.fire());
            }
            _ => {
                let _ = self.fire();
            }
        }
    }
}

fn run_logged(archiver: &dyn Archiver, plan: &BackupPlan) -> Result<PathBuf> {
    let result = archiver.archive(plan);
    if let Err(err) = &result {
        warn!("backup did not complete: {err}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tar_available() -> bool {
        Command::new("tar")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn fake_tar(dir: &Path, body: &str) -> PathBuf {
        let script = dir.join("fake-tar");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        script
    }

    #[derive(Default)]
    struct CountingArchiver {
        calls: AtomicUsize,
    }

    impl Archiver for CountingArchiver {
        fn archive(&self, plan: &BackupPlan) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(plan.destination().to_path_buf())
        }

        fn restore(&self, _plan: &BackupPlan) -> Result<RestoreOutcome> {
            Ok(RestoreOutcome::Skipped)
        }
    }

    #[test]
    fn plan_rejects_destination_inside_source() {
        let err = BackupPlan::new("/root", vec![], "/root/backups/root.tar.gz")
            .expect_err("self-archive must fail");
        assert!(err.to_string().contains("inside"));
        assert!(BackupPlan::new("/root", vec![], "/root/../root/x.tar.gz").is_err());
        assert!(BackupPlan::new("/root", vec![], "/data/root_full_backup.tar.gz").is_ok());
        assert!(BackupPlan::new("/root", vec![], "/rootless/x.tar.gz").is_ok());
        assert!(BackupPlan::new("root", vec![], "/data/x.tar.gz").is_err());
    }

    #[test]
    fn default_destinations_follow_source() {
        let data = Path::new("/data");
        assert_eq!(
            default_destination(data, Path::new("/root")),
            PathBuf::from("/data/root_full_backup.tar.gz")
        );
        assert_eq!(
            default_destination(data, Path::new("/opt/models/unsloth")),
            PathBuf::from("/data/llama_backup.tar.gz")
        );
        assert_eq!(
            default_destination(data, Path::new("/workspace/notebooks")),
            PathBuf::from("/data/_workspace_notebooks_backup.tar.gz")
        );
    }

    #[test]
    fn archive_and_restore_round_trip_with_excludes() {
        if !tar_available() {
            eprintln!("skipping tar test: tar not available");
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("root");
        fs::create_dir_all(source.join("project")).expect("mkdir");
        fs::create_dir_all(source.join("lost+found")).expect("mkdir");
        fs::write(source.join("project/main.rs"), "fn main() {}").expect("write");
        fs::write(source.join("lost+found/junk"), "junk").expect("write");
        let dest = dir.path().join("data").join("root_full_backup.tar.gz");
        let plan = BackupPlan::new(&source, vec!["lost+found".into()], &dest).expect("plan");
        let archiver = TarArchiver::default();

        let written = archiver.archive(&plan).expect("archive");
        assert_eq!(written, dest);
        assert!(!plan.staging_path().exists());

        fs::remove_dir_all(&source).expect("wipe source");
        let restored = archiver.restore(&plan).expect("restore");
        assert_eq!(restored, RestoreOutcome::Restored(dest.clone()));
        assert_eq!(
            fs::read_to_string(source.join("project/main.rs")).expect("read"),
            "fn main() {}"
        );
        assert!(!source.join("lost+found").exists());
    }

    #[test]
    fn restore_without_archive_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = BackupPlan::new(
            dir.path().join("root"),
            vec![],
            dir.path().join("data/none.tar.gz"),
        )
        .expect("plan");
        let outcome = TarArchiver::default().restore(&plan).expect("restore");
        assert_eq!(outcome, RestoreOutcome::Skipped);
    }

    #[test]
    fn nonzero_exit_is_backup_error_and_keeps_previous_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("data").join("root_full_backup.tar.gz");
        fs::create_dir_all(dest.parent().expect("parent")).expect("mkdir");
        fs::write(&dest, "previous good archive").expect("seed");
        let plan = BackupPlan::new(dir.path().join("root"), vec![], &dest).expect("plan");
        let archiver = TarArchiver::new(
            fake_tar(dir.path(), "echo 'tar: disk full' >&2; exit 2"),
            Duration::from_secs(5),
        );

        let err = archiver.archive(&plan).expect_err("exit 2 should fail");

        assert!(matches!(err, DevboxError::Backup(_)));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(fs::read_to_string(&dest).expect("read"), "previous good archive");
    }

    #[test]
    fn hung_archiver_is_killed_after_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = BackupPlan::new(
            dir.path().join("root"),
            vec![],
            dir.path().join("data/root.tar.gz"),
        )
        .expect("plan");
        let archiver = TarArchiver::new(
            fake_tar(dir.path(), "exec sleep 30"),
            Duration::from_millis(200),
        );

        let started = Instant::now();
        let err = archiver.archive(&plan).expect_err("should time out");

        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn guard_fires_at_most_once() {
        let archiver = Arc::new(CountingArchiver::default());
        let plan = BackupPlan::new("/root", vec![], "/data/root.tar.gz").expect("plan");
        let mut guard = BackupGuard::arm(archiver.clone(), plan);

        assert!(guard.fire().is_some());
        assert!(guard.fire().is_none());
        drop(guard);

        assert_eq!(archiver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_fires_on_drop() {
        let archiver = Arc::new(CountingArchiver::default());
        let plan = BackupPlan::new("/root", vec![], "/data/root.tar.gz").expect("plan");
        {
            let _guard = BackupGuard::arm(archiver.clone(), plan);
        }
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_fires_while_unwinding() {
        let archiver = Arc::new(CountingArchiver::default());
        let plan = BackupPlan::new("/root", vec![], "/data/root.tar.gz").expect("plan");
        let inner = archiver.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = BackupGuard::arm(inner, plan);
            panic!("session crashed");
        }));
        assert!(result.is_err());
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guard_fires_on_blocking_pool() {
        let archiver = Arc::new(CountingArchiver::default());
        let plan = BackupPlan::new("/root", vec![], "/data/root.tar.gz").expect("plan");
        let guard = BackupGuard::arm(archiver.clone(), plan);

        let outcome = guard.fire_blocking().await.expect("fired");

        assert_eq!(outcome.expect("ok"), PathBuf::from("/data/root.tar.gz"));
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn guard_dropped_on_multi_thread_worker_still_fires() {
        let archiver = Arc::new(CountingArchiver::default());
        let plan = BackupPlan::new("/root", vec![], "/data/root.tar.gz").expect("plan");
        let guard = BackupGuard::arm(archiver.clone(), plan);

        tokio::spawn(async move { drop(guard) }).await.expect("join");

        assert_eq!(archiver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guard_dropped_on_current_thread_runtime_fires_inline() {
        let archiver = Arc::new(CountingArchiver::default());
        let plan = BackupPlan::new("/root", vec![], "/data/root.tar.gz").expect("plan");
        drop(BackupGuard::arm(archiver.clone(), plan));

        assert_eq!(archiver.calls.load(Ordering::SeqCst), 1);
    }
}
