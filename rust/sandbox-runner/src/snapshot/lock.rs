//! Two-layer lock serializing work on one snapshot image.
//!
//! The first layer is a reference-counted in-process mutex per path, so tasks
//! inside one runner queue up without touching the filesystem. The second is
//! an exclusive `flock` on `<path>.lock`, shared with every other runner
//! process using the same disk store. Layers are always taken in that order
//! and released in reverse, and the guard releases both on every exit path.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SnapshotConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::metrics;

#[derive(Debug)]
struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

type LockTable = Arc<Mutex<HashMap<PathBuf, LockEntry>>>;

/// Hands out [`SnapshotLockGuard`]s for image paths
#[derive(Debug, Clone)]
pub struct SnapshotLockManager {
    entries: LockTable,
    timeout: Duration,
    poll_interval: Duration,
}

impl SnapshotLockManager {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            poll_interval,
        }
    }

    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self::new(config.lock_timeout(), config.lock_poll_interval())
    }

    /// Paths with at least one holder or waiter in this process
    pub fn tracked_paths(&self) -> usize {
        self.entries.lock().len()
    }

    /// Lock `path` in this process and across processes.
    ///
    /// Fails with [`RunnerError::LockTimeout`] when either layer is not
    /// obtained before the deadline, and with [`RunnerError::Cancelled`] as
    /// soon as `cancel` fires. Nothing stays held on failure.
    pub async fn acquire(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> RunnerResult<SnapshotLockGuard> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        let registration = self.register(path);
        let mutex = Arc::clone(&registration.lock);

        let in_process = tokio::select! {
            () = cancel.cancelled() => {
                return Err(RunnerError::Cancelled(format!("lock on {}", path.display())));
            }
            locked = tokio::time::timeout_at(deadline, mutex.lock_owned()) => {
                locked.map_err(|_elapsed| self.timeout_error(path))?
            }
        };

        let lock_path = lock_file_path(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;

            let replaced = match try_flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
                Ok(()) if still_linked(&file, &lock_path) => break file,
                Ok(()) => {
                    // A previous holder unlinked the file after we opened it
                    debug!(path = %lock_path.display(), "Lock file replaced, retrying");
                    true
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                Err(e) => return Err(e.into()),
            };

            self.check_wait(path, deadline, cancel)?;
            if replaced {
                // Retry at once, the new file is most likely free
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(RunnerError::Cancelled(format!("lock on {}", path.display())));
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        let waited = started.elapsed();
        metrics::observe_lock_wait(waited.as_secs_f64());
        debug!(
            path = %path.display(),
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "Snapshot lock acquired"
        );

        Ok(SnapshotLockGuard {
            path: path.to_path_buf(),
            lock_path,
            file: Some(file),
            in_process: Some(in_process),
            registration: Some(registration),
        })
    }

    fn register(&self, path: &Path) -> Registration {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(path.to_path_buf())
            .or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
        entry.refs += 1;

        Registration {
            entries: Arc::clone(&self.entries),
            path: path.to_path_buf(),
            lock: Arc::clone(&entry.lock),
        }
    }

    /// Whether waiting for `path` may go on
    fn check_wait(
        &self,
        path: &Path,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> RunnerResult<()> {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled(format!("lock on {}", path.display())));
        }
        if Instant::now() >= deadline {
            return Err(self.timeout_error(path));
        }
        Ok(())
    }

    fn timeout_error(&self, path: &Path) -> RunnerError {
        RunnerError::LockTimeout {
            path: path.to_path_buf(),
            waited_secs: self.timeout.as_secs(),
        }
    }
}

/// One reference on a [`LockEntry`]; dropping it removes the entry at zero
#[derive(Debug)]
struct Registration {
    entries: LockTable,
    path: PathBuf,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&self.path) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(&self.path);
            }
        }
    }
}

/// Held snapshot lock. Released on drop or by [`release`](Self::release).
#[derive(Debug)]
pub struct SnapshotLockGuard {
    path: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    in_process: Option<OwnedMutexGuard<()>>,
    registration: Option<Registration>,
}

impl SnapshotLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            // Unlink while still holding the lock so a waiter never ends up
            // owning a file nobody else can see.
            if let Err(e) = fs::remove_file(&self.lock_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.lock_path.display(), error = %e, "Failed to remove lock file");
                }
            }
            if let Err(e) = try_flock(&file, libc::LOCK_UN) {
                warn!(path = %self.lock_path.display(), error = %e, "Failed to unlock lock file");
            }
            drop(file);
        }
        drop(self.in_process.take());
        drop(self.registration.take());
        debug!(path = %self.path.display(), "Snapshot lock released");
    }
}

impl Drop for SnapshotLockGuard {
    fn drop(&mut self) {
        if self.file.is_some() || self.in_process.is_some() || self.registration.is_some() {
            self.release_inner();
        }
    }
}

pub fn lock_file_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn try_flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor belongs to `file`, which is borrowed for the whole call.
    let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// True when `path` still names the inode `file` refers to
fn still_linked(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_file_path() {
        assert_eq!(
            lock_file_path(Path::new("/snapshots/base.qcow2")),
            PathBuf::from("/snapshots/base.qcow2.lock")
        );
    }

    #[tokio::test]
    async fn test_release_removes_lock_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");
        let manager = SnapshotLockManager::new(Duration::from_secs(5), Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let guard = manager.acquire(&path, &cancel).await.unwrap();
        assert!(guard.lock_file().exists());
        assert_eq!(manager.tracked_paths(), 1);

        guard.release();
        assert!(!lock_file_path(&path).exists());
        assert_eq!(manager.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_file_lock_held_elsewhere_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");
        let cancel = CancellationToken::new();

        // Stands in for another runner process holding the file lock
        let other = File::create(lock_file_path(&path)).unwrap();
        try_flock(&other, libc::LOCK_EX).unwrap();

        let manager = SnapshotLockManager::new(Duration::from_millis(100), Duration::from_millis(10));
        let err = manager.acquire(&path, &cancel).await.unwrap_err();
        assert!(matches!(err, RunnerError::LockTimeout { .. }));
        assert_eq!(manager.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_check_wait_stops_at_deadline_or_cancel() {
        let manager = SnapshotLockManager::new(Duration::from_secs(5), Duration::from_millis(10));
        let path = Path::new("/snapshots/base.qcow2");
        let cancel = CancellationToken::new();

        let later = Instant::now() + Duration::from_secs(5);
        assert!(manager.check_wait(path, later, &cancel).is_ok());

        let passed = Instant::now();
        assert!(matches!(
            manager.check_wait(path, passed, &cancel),
            Err(RunnerError::LockTimeout { .. })
        ));

        cancel.cancel();
        assert!(matches!(
            manager.check_wait(path, later, &cancel),
            Err(RunnerError::Cancelled(_))
        ));
    }
}
