//! Sandbox Runner
//!
//! Keeps a warm pool of paused VMs ready to be claimed by new sandboxes,
//! rebalances guest memory through balloon drivers, records memory samples
//! for inspection and serializes snapshot image transfers across runner
//! processes.

pub mod config;
pub mod error;
pub mod hypervisor;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod runner;
pub mod snapshot;
pub mod stats_store;

pub use config::Config;
pub use error::{HypervisorError, HypervisorResult, RunnerError, RunnerResult};
pub use hypervisor::{Hypervisor, InMemoryHypervisor};
pub use memory::{MemoryController, VmMemoryStats};
pub use pool::{PoolStats, PoolVm, PoolVmState, PoolWatcher, VmPool};
pub use runner::SandboxRunner;
pub use snapshot::{SnapshotLockGuard, SnapshotLockManager, SnapshotManager, SnapshotStorage};
pub use stats_store::{MemoryStatsRecord, StatsStore};
