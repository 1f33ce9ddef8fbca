//! Snapshot lock and snapshot transfer tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shannon_sandbox_runner::config::SnapshotConfig;
use shannon_sandbox_runner::error::{RunnerError, RunnerResult};
use shannon_sandbox_runner::snapshot::{
    lock_file_path, DirectoryStorage, SnapshotLockManager, SnapshotManager, SnapshotStorage,
};
use tokio_util::sync::CancellationToken;

fn manager(timeout: Duration) -> SnapshotLockManager {
    SnapshotLockManager::new(timeout, Duration::from_millis(10))
}

#[tokio::test]
async fn test_same_path_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base.qcow2");
    let locks = manager(Duration::from_secs(10));
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let locks = locks.clone();
        let path = path.clone();
        let holders = Arc::clone(&holders);
        let max_seen = Arc::clone(&max_seen);
        handles.push(tokio::spawn(async move {
            let guard = locks.acquire(&path, &CancellationToken::new()).await.unwrap();
            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            guard.release();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(locks.tracked_paths(), 0);
    assert!(!lock_file_path(&path).exists());
}

#[tokio::test]
async fn test_different_paths_lock_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(Duration::from_millis(200));
    let cancel = CancellationToken::new();

    let a = locks.acquire(&dir.path().join("a.qcow2"), &cancel).await.unwrap();
    let b = locks.acquire(&dir.path().join("b.qcow2"), &cancel).await.unwrap();
    assert_eq!(locks.tracked_paths(), 2);

    drop(a);
    drop(b);
    assert_eq!(locks.tracked_paths(), 0);
}

#[tokio::test]
async fn test_reacquire_after_release_is_immediate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base.qcow2");
    let locks = manager(Duration::from_secs(30));
    let cancel = CancellationToken::new();

    let guard = locks.acquire(&path, &cancel).await.unwrap();
    guard.release();

    let again = tokio::time::timeout(Duration::from_secs(1), locks.acquire(&path, &cancel))
        .await
        .expect("second acquire waited")
        .unwrap();
    assert_eq!(again.path(), path.as_path());
}

#[tokio::test]
async fn test_contended_lock_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base.qcow2");
    let locks = manager(Duration::from_millis(100));
    let cancel = CancellationToken::new();

    let _held = locks.acquire(&path, &cancel).await.unwrap();
    let err = locks.acquire(&path, &cancel).await.unwrap_err();

    assert!(matches!(err, RunnerError::LockTimeout { .. }));
    // Only the holder remains registered
    assert_eq!(locks.tracked_paths(), 1);
}

#[tokio::test]
async fn test_separate_managers_exclude_each_other_via_file_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base.qcow2");
    let cancel = CancellationToken::new();

    let first = manager(Duration::from_secs(5));
    let second = manager(Duration::from_millis(100));

    let guard = first.acquire(&path, &cancel).await.unwrap();
    let err = second.acquire(&path, &cancel).await.unwrap_err();
    assert!(matches!(err, RunnerError::LockTimeout { .. }));

    guard.release();
    let reacquired = second.acquire(&path, &cancel).await;
    assert!(reacquired.is_ok());
}

#[tokio::test]
async fn test_cancellation_interrupts_wait() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base.qcow2");
    let locks = manager(Duration::from_secs(1800));
    let _held = locks.acquire(&path, &CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let locks = locks.clone();
        let path = path.clone();
        let cancel = cancel.clone();
        async move { locks.acquire(&path, &cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter ignored cancellation")
        .unwrap();
    assert!(matches!(result, Err(RunnerError::Cancelled(_))));
    assert_eq!(locks.tracked_paths(), 1);
}

/// Directory store that counts downloads
#[derive(Debug)]
struct CountingStorage {
    inner: DirectoryStorage,
    downloads: AtomicUsize,
}

#[async_trait]
impl SnapshotStorage for CountingStorage {
    async fn exists(&self, locator: &str) -> RunnerResult<bool> {
        self.inner.exists(locator).await
    }

    async fn flatten(&self, source: &Path, dest: &Path) -> RunnerResult<()> {
        self.inner.flatten(source, dest).await
    }

    async fn upload(&self, path: &Path) -> RunnerResult<String> {
        self.inner.upload(path).await
    }

    async fn download(&self, locator: &str, dest: &Path) -> RunnerResult<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.download(locator, dest).await
    }
}

fn snapshot_config(base: &Path) -> SnapshotConfig {
    SnapshotConfig {
        base_path: base.to_path_buf(),
        lock_timeout_secs: 10,
        lock_poll_interval_ms: 10,
    }
}

#[tokio::test]
async fn test_concurrent_pulls_download_once() {
    let store_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    std::fs::write(store_dir.path().join("ubuntu.qcow2"), b"image-bytes").unwrap();

    let storage = Arc::new(CountingStorage {
        inner: DirectoryStorage::new(store_dir.path()),
        downloads: AtomicUsize::new(0),
    });
    let manager = Arc::new(SnapshotManager::new(
        &snapshot_config(local_dir.path()),
        Arc::clone(&storage) as Arc<dyn SnapshotStorage>,
    ));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.pull("snapshots/ubuntu", &CancellationToken::new()).await
        }));
    }
    for handle in handles {
        let path = handle.await.unwrap().unwrap();
        assert_eq!(path, local_dir.path().join("ubuntu.qcow2"));
    }

    assert_eq!(storage.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read(local_dir.path().join("ubuntu.qcow2")).unwrap(),
        b"image-bytes"
    );
    assert!(!local_dir.path().join("ubuntu.qcow2.downloading").exists());
    assert_eq!(manager.list_local().await.unwrap(), vec!["ubuntu.qcow2".to_string()]);
}

#[tokio::test]
async fn test_pull_missing_snapshot_fails_cleanly() {
    let store_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    let manager = SnapshotManager::new(
        &snapshot_config(local_dir.path()),
        Arc::new(DirectoryStorage::new(store_dir.path())),
    );

    let err = manager
        .pull("missing", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Snapshot(_)));
    assert_eq!(manager.locks().tracked_paths(), 0);
    assert!(manager.list_local().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_push_flattens_and_uploads() {
    let store_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let overlay = work_dir.path().join("sandbox-overlay.qcow2");
    std::fs::write(&overlay, b"overlay").unwrap();

    let manager = SnapshotManager::new(
        &snapshot_config(local_dir.path()),
        Arc::new(DirectoryStorage::new(store_dir.path())),
    );

    let locator = manager
        .push(&overlay, "my-snapshot", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(locator, "my-snapshot.qcow2");
    assert_eq!(std::fs::read(store_dir.path().join(&locator)).unwrap(), b"overlay");
    assert!(local_dir.path().join("my-snapshot.qcow2").exists());
    assert!(!lock_file_path(&local_dir.path().join("my-snapshot.qcow2")).exists());
}

#[tokio::test]
async fn test_snapshot_names_stay_under_base_path() {
    let store_dir = tempfile::tempdir().unwrap();
    let local_root = tempfile::tempdir().unwrap();
    let base = local_root.path().join("snaps");
    std::fs::write(store_dir.path().join("outside.qcow2"), b"image").unwrap();

    let manager = SnapshotManager::new(
        &snapshot_config(&base),
        Arc::new(DirectoryStorage::new(store_dir.path())),
    );
    let cancel = CancellationToken::new();

    for name in ["../outside", "snapshots/../../outside", ""] {
        let err = manager.pull(name, &cancel).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidArgument(_)), "{name}: {err}");
    }
    let err = manager
        .push(&store_dir.path().join("outside.qcow2"), "../outside", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::InvalidArgument(_)));
    assert!(!local_root.path().join("outside.qcow2").exists());
    assert_eq!(manager.locks().tracked_paths(), 0);

    // An absolute name resolves inside the base path
    let path = manager.local_path("/outside").unwrap();
    assert_eq!(path, base.join("outside.qcow2"));
}
