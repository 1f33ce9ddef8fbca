//! Configuration for the sandbox runner

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RunnerError, RunnerResult};

const KIB_PER_GB: f64 = 1024.0 * 1024.0;

/// Runner configuration: warm pool, balloon loop, stats store and snapshot locking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Warm pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Memory balloon controller configuration
    #[serde(default)]
    pub balloon: BalloonConfig,

    /// Memory stats persistence configuration
    #[serde(default)]
    pub stats: StatsConfig,

    /// Snapshot store configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of paused VMs to keep ready (0 disables the watcher)
    #[serde(default)]
    pub target_size: usize,

    /// Seconds between replenishment checks (default: 10s)
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,

    /// Name prefix for pool VMs, followed by a 7 digit index
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Placeholder VM resources
    #[serde(default = "default_vm_vcpus")]
    pub vm_vcpus: u32,
    #[serde(default = "default_vm_memory_mib")]
    pub vm_memory_mib: u64,
    #[serde(default = "default_vm_disk_gb")]
    pub vm_disk_gb: u32,

    /// How long to wait for the guest daemon to answer (default: 120s)
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Pause after a failed creation before the next attempt (default: 5s)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Failed creations tolerated per cycle before waiting for the next tick
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_cycle: u32,

    /// VMs stuck in `creating` longer than this are reaped (default: 600s)
    #[serde(default = "default_stale_creating")]
    pub stale_creating_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalloonConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between balloon adjustments (default: 30s)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Floor for any VM allocation (default: 1GB)
    #[serde(default = "default_min_vm_memory_gb")]
    pub min_vm_memory_gb: f64,

    /// Fixed headroom above used memory (default: 2GB)
    #[serde(default = "default_safety_buffer_gb")]
    pub safety_buffer_gb: f64,

    /// Proportional headroom, used when larger than the fixed buffer (default: 0.25)
    #[serde(default = "default_safety_buffer_ratio")]
    pub safety_buffer_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Directory holding `memory_stats.db`
    #[serde(default = "default_stats_path")]
    pub data_path: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Queued samples before new ones are dropped (default: 1000)
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_path")]
    pub base_path: PathBuf,

    /// Snapshot transfers are slow, so the lock wait is long (default: 30min)
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,
}

fn default_watch_interval() -> u64 {
    10
}
fn default_name_prefix() -> String {
    "pool-vm-".to_string()
}
fn default_vm_vcpus() -> u32 {
    1
}
fn default_vm_memory_mib() -> u64 {
    1024
}
fn default_vm_disk_gb() -> u32 {
    10
}
fn default_ready_timeout() -> u64 {
    120
}
fn default_ready_poll_interval() -> u64 {
    1000
}
fn default_retry_backoff() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    5
}
fn default_stale_creating() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_check_interval() -> u64 {
    30
}
fn default_min_vm_memory_gb() -> f64 {
    1.0
}
fn default_safety_buffer_gb() -> f64 {
    2.0
}
fn default_safety_buffer_ratio() -> f64 {
    0.25
}
fn default_stats_path() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".sandbox-runner")
}
fn default_retention_days() -> u32 {
    7
}
fn default_cleanup_interval() -> u64 {
    3600
}
fn default_write_buffer_size() -> usize {
    1000
}
fn default_flush_interval() -> u64 {
    30
}
fn default_batch_size() -> usize {
    100
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/lib/sandbox-runner/snapshots")
}
fn default_lock_timeout() -> u64 {
    30 * 60
}
fn default_lock_poll_interval() -> u64 {
    500
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 0,
            watch_interval_secs: default_watch_interval(),
            name_prefix: default_name_prefix(),
            vm_vcpus: default_vm_vcpus(),
            vm_memory_mib: default_vm_memory_mib(),
            vm_disk_gb: default_vm_disk_gb(),
            ready_timeout_secs: default_ready_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            retry_backoff_secs: default_retry_backoff(),
            max_attempts_per_cycle: default_max_attempts(),
            stale_creating_secs: default_stale_creating(),
        }
    }
}

impl Default for BalloonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval(),
            min_vm_memory_gb: default_min_vm_memory_gb(),
            safety_buffer_gb: default_safety_buffer_gb(),
            safety_buffer_ratio: default_safety_buffer_ratio(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            data_path: default_stats_path(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval(),
            write_buffer_size: default_write_buffer_size(),
            flush_interval_secs: default_flush_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            base_path: default_snapshot_path(),
            lock_timeout_secs: default_lock_timeout(),
            lock_poll_interval_ms: default_lock_poll_interval(),
        }
    }
}

impl PoolConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn stale_creating_after(&self) -> Duration {
        Duration::from_secs(self.stale_creating_secs)
    }
}

impl BalloonConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn min_vm_memory_kib(&self) -> u64 {
        gb_to_kib(self.min_vm_memory_gb)
    }

    pub fn safety_buffer_kib(&self) -> u64 {
        gb_to_kib(self.safety_buffer_gb)
    }
}

impl StatsConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_path.join("memory_stats.db")
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl SnapshotConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "sizes are validated non-negative and far below u64::MAX"
)]
fn gb_to_kib(gb: f64) -> u64 {
    (gb * KIB_PER_GB).round() as u64
}

impl Config {
    /// Load configuration from the YAML file (if any), then environment overrides
    pub fn load() -> RunnerResult<Self> {
        let config = match config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        let config = Self::from_env(config);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> RunnerResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RunnerError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = serde_yaml::from_str::<Config>(&content)?;
        tracing::info!(path = %path.display(), "Loaded runner configuration");
        Ok(config)
    }

    /// Apply environment variable overrides on top of `config`
    pub fn from_env(mut config: Config) -> Config {
        if let Some(v) = env_parse::<usize>("POOL_TARGET_SIZE") {
            config.pool.target_size = v;
        }
        if let Some(v) = env_parse::<u64>("POOL_WATCH_INTERVAL_SECS") {
            config.pool.watch_interval_secs = v;
        }
        if let Some(v) = env_parse::<u64>("POOL_VM_MEMORY_MIB") {
            config.pool.vm_memory_mib = v;
        }
        if let Some(v) = env_parse::<u64>("POOL_READY_TIMEOUT_SECS") {
            config.pool.ready_timeout_secs = v;
        }

        if let Some(v) = env_parse::<bool>("BALLOON_ENABLED") {
            config.balloon.enabled = v;
        }
        if let Some(v) = env_parse::<u64>("BALLOON_CHECK_INTERVAL_SECS") {
            config.balloon.check_interval_secs = v;
        }
        if let Some(v) = env_parse::<f64>("BALLOON_MIN_VM_MEMORY_GB") {
            config.balloon.min_vm_memory_gb = v;
        }
        if let Some(v) = env_parse::<f64>("BALLOON_SAFETY_BUFFER_GB") {
            config.balloon.safety_buffer_gb = v;
        }
        if let Some(v) = env_parse::<f64>("BALLOON_SAFETY_BUFFER_RATIO") {
            config.balloon.safety_buffer_ratio = v;
        }

        if let Ok(v) = env::var("STATS_DATA_PATH") {
            if !v.trim().is_empty() {
                config.stats.data_path = PathBuf::from(v);
            }
        }
        if let Some(v) = env_parse::<u32>("STATS_RETENTION_DAYS") {
            config.stats.retention_days = v;
        }
        if let Some(v) = env_parse::<usize>("STATS_WRITE_BUFFER_SIZE") {
            config.stats.write_buffer_size = v;
        }

        if let Ok(v) = env::var("SNAPSHOT_BASE_PATH") {
            if !v.trim().is_empty() {
                config.snapshot.base_path = PathBuf::from(v);
            }
        }
        if let Some(v) = env_parse::<u64>("SNAPSHOT_LOCK_TIMEOUT_SECS") {
            config.snapshot.lock_timeout_secs = v;
        }

        config
    }

    pub fn validate(&self) -> RunnerResult<()> {
        let invalid = |msg: &str| Err(RunnerError::Configuration(msg.to_string()));

        if self.pool.watch_interval_secs == 0 {
            return invalid("pool.watch_interval_secs must be positive");
        }
        if self.pool.ready_timeout_secs == 0 || self.pool.ready_poll_interval_ms == 0 {
            return invalid("pool readiness timeout and poll interval must be positive");
        }
        if !self.pool.name_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return invalid("pool.name_prefix may only contain ASCII letters, digits and '-'");
        }
        if self.balloon.check_interval_secs == 0 {
            return invalid("balloon.check_interval_secs must be positive");
        }
        if !(self.balloon.min_vm_memory_gb > 0.0) {
            return invalid("balloon.min_vm_memory_gb must be positive");
        }
        if !(self.balloon.safety_buffer_gb >= 0.0) {
            return invalid("balloon.safety_buffer_gb must not be negative");
        }
        if !(0.0..=10.0).contains(&self.balloon.safety_buffer_ratio) {
            return invalid("balloon.safety_buffer_ratio must be within [0, 10]");
        }
        if self.stats.retention_days == 0 {
            return invalid("stats.retention_days must be positive");
        }
        if self.stats.write_buffer_size == 0 || self.stats.batch_size == 0 {
            return invalid("stats write buffer and batch size must be positive");
        }
        if self.stats.cleanup_interval_secs == 0 || self.stats.flush_interval_secs == 0 {
            return invalid("stats cleanup and flush intervals must be positive");
        }
        if self.snapshot.lock_timeout_secs == 0 || self.snapshot.lock_poll_interval_ms == 0 {
            return invalid("snapshot lock timeout and poll interval must be positive");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn config_path() -> Option<PathBuf> {
    if let Ok(env_path) = env::var("RUNNER_CONFIG_PATH") {
        if !env_path.trim().is_empty() {
            let candidate = PathBuf::from(&env_path);
            if candidate.is_dir() {
                let file = candidate.join("runner.yaml");
                if file.exists() {
                    return Some(file);
                }
            } else if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    let defaults = ["/etc/sandbox-runner/config.yaml", "config/runner.yaml"];
    defaults.iter().map(PathBuf::from).find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.pool.target_size, 0);
        assert_eq!(config.pool.name_prefix, "pool-vm-");
        assert_eq!(config.balloon.min_vm_memory_kib(), 1_048_576);
        assert_eq!(config.balloon.safety_buffer_kib(), 2_097_152);
        assert_eq!(config.stats.retention_days, 7);
        assert_eq!(config.stats.write_buffer_size, 1000);
        assert_eq!(config.snapshot.lock_timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_sections() {
        let yaml = r"
pool:
  target_size: 3
balloon:
  safety_buffer_ratio: 0.5
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pool.target_size, 3);
        assert_eq!(config.pool.watch_interval_secs, 10);
        assert!((config.balloon.safety_buffer_ratio - 0.5).abs() < f64::EPSILON);
        assert!((config.balloon.safety_buffer_gb - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.stats.flush_interval_secs, 30);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: test-only environment mutation, serialized by #[serial]
        unsafe {
            env::set_var("POOL_TARGET_SIZE", "4");
            env::set_var("BALLOON_SAFETY_BUFFER_RATIO", "0.1");
            env::set_var("STATS_RETENTION_DAYS", "not-a-number");
            env::set_var("SNAPSHOT_BASE_PATH", "/tmp/snaps");
        }

        let config = Config::from_env(Config::default());

        assert_eq!(config.pool.target_size, 4);
        assert!((config.balloon.safety_buffer_ratio - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.stats.retention_days, 7);
        assert_eq!(config.snapshot.base_path, PathBuf::from("/tmp/snaps"));

        // SAFETY: test-only environment mutation, serialized by #[serial]
        unsafe {
            env::remove_var("POOL_TARGET_SIZE");
            env::remove_var("BALLOON_SAFETY_BUFFER_RATIO");
            env::remove_var("STATS_RETENTION_DAYS");
            env::remove_var("SNAPSHOT_BASE_PATH");
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.balloon.safety_buffer_ratio = -0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.balloon.min_vm_memory_gb = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stats.write_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.name_prefix = "pool vm".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("runner.yaml");
        fs::write(&file, "pool:\n  target_size: 2\nstats:\n  retention_days: 3\n").unwrap();

        // SAFETY: test-only environment mutation, serialized by #[serial]
        unsafe {
            env::set_var("RUNNER_CONFIG_PATH", dir.path());
        }
        let config = Config::load().unwrap();
        // SAFETY: test-only environment mutation, serialized by #[serial]
        unsafe {
            env::remove_var("RUNNER_CONFIG_PATH");
        }

        assert_eq!(config.pool.target_size, 2);
        assert_eq!(config.stats.retention_days, 3);
    }
}
