//! Snapshot images on local disk and their transfer to and from the store.
//!
//! Every mutation of an image path happens under a [`SnapshotLockGuard`], so a
//! pull racing another pull (in this process or another runner) finds the
//! finished image instead of a half-written one.

pub mod lock;

pub use lock::{lock_file_path, SnapshotLockGuard, SnapshotLockManager};

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SnapshotConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::logging::OpTimer;

const IMAGE_EXTENSION: &str = "qcow2";

/// Disk tooling and object storage used for snapshots
#[async_trait]
pub trait SnapshotStorage: Send + Sync + fmt::Debug {
    async fn exists(&self, locator: &str) -> RunnerResult<bool>;

    /// Turn a differencing disk into a standalone image at `dest`
    async fn flatten(&self, source: &Path, dest: &Path) -> RunnerResult<()>;

    /// Store the image and return its locator
    async fn upload(&self, path: &Path) -> RunnerResult<String>;

    /// Fetch `locator` into `dest`, returning the bytes written
    async fn download(&self, locator: &str, dest: &Path) -> RunnerResult<u64>;

    /// Integrity check of a local image
    async fn validate(&self, _path: &Path) -> RunnerResult<()> {
        Ok(())
    }
}

/// Object store emulated by a plain directory. Flattening is a copy.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SnapshotStorage for DirectoryStorage {
    async fn exists(&self, locator: &str) -> RunnerResult<bool> {
        Ok(fs::try_exists(self.root.join(locator)).await?)
    }

    async fn flatten(&self, source: &Path, dest: &Path) -> RunnerResult<()> {
        fs::copy(source, dest).await?;
        Ok(())
    }

    async fn upload(&self, path: &Path) -> RunnerResult<String> {
        let locator = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RunnerError::InvalidArgument(format!("no file name in {}", path.display())))?
            .to_string();
        fs::create_dir_all(&self.root).await?;
        fs::copy(path, self.root.join(&locator)).await?;
        Ok(locator)
    }

    async fn download(&self, locator: &str, dest: &Path) -> RunnerResult<u64> {
        Ok(fs::copy(self.root.join(locator), dest).await?)
    }
}

/// Pulls and pushes snapshot images under the snapshot lock
#[derive(Debug)]
pub struct SnapshotManager {
    base_path: PathBuf,
    storage: Arc<dyn SnapshotStorage>,
    locks: SnapshotLockManager,
}

impl SnapshotManager {
    pub fn new(config: &SnapshotConfig, storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            base_path: config.base_path.clone(),
            storage,
            locks: SnapshotLockManager::from_config(config),
        }
    }

    pub fn locks(&self) -> &SnapshotLockManager {
        &self.locks
    }

    /// Local image path for a snapshot name. A leading `snapshots/` is
    /// dropped and `.qcow2` appended when missing. The result always stays
    /// under the base path: leading slashes are ignored and names with `..`
    /// are rejected.
    pub fn local_path(&self, name: &str) -> RunnerResult<PathBuf> {
        Ok(self.base_path.join(normalize_name(name)?))
    }

    /// Make `name` available locally and return its path.
    ///
    /// An existing valid image is reused. Otherwise the image is downloaded
    /// next to the target and renamed into place once complete.
    pub async fn pull(&self, name: &str, cancel: &CancellationToken) -> RunnerResult<PathBuf> {
        if name.is_empty() {
            return Err(RunnerError::InvalidArgument("snapshot name is required".into()));
        }

        let locator = normalize_name(name)?;
        let target = self.base_path.join(&locator);
        let temp = with_suffix(&target, ".downloading");
        fs::create_dir_all(target.parent().unwrap_or(&self.base_path)).await?;

        let guard = self.locks.acquire(&target, cancel).await?;

        // Another holder may have finished the download while we waited
        if fs::try_exists(&target).await? {
            match self.storage.validate(&target).await {
                Ok(()) => {
                    info!(snapshot = %name, path = %target.display(), "Snapshot already present");
                    guard.release();
                    return Ok(target);
                }
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "Local snapshot invalid, downloading again");
                    remove_quietly(&target).await;
                }
            }
        }

        if fs::try_exists(&temp).await.unwrap_or(false) {
            warn!(path = %temp.display(), "Removing temp file from interrupted download");
            remove_quietly(&temp).await;
        }

        if !self.storage.exists(&locator).await? {
            return Err(RunnerError::Snapshot(format!("snapshot '{name}' not found in store")));
        }

        let timer = OpTimer::new("snapshot", "pull");
        let result = self.download_into_place(&locator, &temp, &target).await;
        timer.finish_with_result(result.as_ref());
        let written = result?;

        guard.release();
        info!(snapshot = %name, bytes = written, path = %target.display(), "Snapshot pulled");
        Ok(target)
    }

    async fn download_into_place(&self, locator: &str, temp: &Path, target: &Path) -> RunnerResult<u64> {
        let written = match self.storage.download(locator, temp).await {
            Ok(written) => written,
            Err(e) => {
                remove_quietly(temp).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(temp, target).await {
            remove_quietly(temp).await;
            return Err(RunnerError::Snapshot(format!(
                "failed to finalize {}: {e}",
                target.display()
            )));
        }

        if let Err(e) = self.storage.validate(target).await {
            remove_quietly(target).await;
            return Err(RunnerError::Snapshot(format!("downloaded snapshot failed validation: {e}")));
        }

        Ok(written)
    }

    /// Flatten `source` into the local image for `name` and upload it.
    /// Returns the store locator.
    pub async fn push(
        &self,
        source: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> RunnerResult<String> {
        if name.is_empty() {
            return Err(RunnerError::InvalidArgument("snapshot name is required".into()));
        }

        let target = self.local_path(name)?;
        let temp = with_suffix(&target, ".flattening");
        fs::create_dir_all(target.parent().unwrap_or(&self.base_path)).await?;

        let guard = self.locks.acquire(&target, cancel).await?;
        let timer = OpTimer::new("snapshot", "push");

        let result = async {
            if let Err(e) = self.storage.flatten(source, &temp).await {
                remove_quietly(&temp).await;
                return Err(e);
            }
            if let Err(e) = fs::rename(&temp, &target).await {
                remove_quietly(&temp).await;
                return Err(RunnerError::from(e));
            }
            self.storage.upload(&target).await
        }
        .await;

        timer.finish_with_result(result.as_ref());
        guard.release();

        let locator = result?;
        info!(snapshot = %name, locator = %locator, "Snapshot pushed");
        Ok(locator)
    }

    /// Names of the images in the snapshot directory, sorted
    pub async fn list_local(&self) -> RunnerResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == IMAGE_EXTENSION) && entry.file_type().await?.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn normalize_name(name: &str) -> RunnerResult<String> {
    let name = name.trim_start_matches('/');
    let name = name.strip_prefix("snapshots/").unwrap_or(name);

    let relative = Path::new(name);
    if name.is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(RunnerError::InvalidArgument(format!(
            "invalid snapshot name '{name}'"
        )));
    }

    if relative.extension().is_some_and(|ext| ext == IMAGE_EXTENSION) {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.{IMAGE_EXTENSION}"))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("snapshots/ubuntu").unwrap(), "ubuntu.qcow2");
        assert_eq!(normalize_name("ubuntu.qcow2").unwrap(), "ubuntu.qcow2");
        assert_eq!(normalize_name("python-3.12").unwrap(), "python-3.12.qcow2");
        assert_eq!(normalize_name("/team/base").unwrap(), "team/base.qcow2");
    }

    #[test]
    fn test_normalize_name_rejects_escapes() {
        for name in ["", "/", "../etc/passwd", "snapshots/../../x", "team/../../x", "./x"] {
            assert!(
                matches!(normalize_name(name), Err(RunnerError::InvalidArgument(_))),
                "{name} accepted"
            );
        }
    }

    #[test]
    fn test_local_path() {
        let config = SnapshotConfig {
            base_path: PathBuf::from("/var/lib/snaps"),
            ..SnapshotConfig::default()
        };
        let manager = SnapshotManager::new(&config, Arc::new(DirectoryStorage::new("/tmp/store")));
        assert_eq!(
            manager.local_path("snapshots/base").unwrap(),
            PathBuf::from("/var/lib/snaps/base.qcow2")
        );

        let absolute = manager.local_path("/etc/cron.d/evil").unwrap();
        assert!(absolute.starts_with("/var/lib/snaps"));
        assert_eq!(absolute, PathBuf::from("/var/lib/snaps/etc/cron.d/evil.qcow2"));

        assert!(manager.local_path("../../etc/cron.d/evil").is_err());
    }
}
