//! Hypervisor gateway boundary.
//!
//! The runner never talks to a hypervisor directly. Everything it needs
//! (define, pause, resume, destroy, memory statistics, live memory resize,
//! address lookup and sandbox metadata) goes through the [`Hypervisor`]
//! trait, so the pool, the balloon controller and the tests can share one
//! abstraction.

mod in_memory;

pub use in_memory::InMemoryHypervisor;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HypervisorResult;
use crate::memory::VmMemoryStats;

/// Hypervisor-level domain state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Running,
    Paused,
    Shutoff,
    Crashed,
    Other,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::Running => "running",
            DomainState::Paused => "paused",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::Other => "other",
        };
        f.write_str(s)
    }
}

/// Which domains `list_domains` should return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainFilter {
    #[default]
    All,
    Running,
    Paused,
}

impl DomainFilter {
    pub fn matches(self, state: DomainState) -> bool {
        match self {
            DomainFilter::All => true,
            DomainFilter::Running => state == DomainState::Running,
            DomainFilter::Paused => state == DomainState::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
}

/// Identity of a freshly defined and started domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedDomain {
    pub uuid: String,
    pub name: String,
}

/// Resources for a new domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gb: u32,
}

/// Hypervisor domain gateway.
///
/// `pause`, `resume` and `destroy` tolerate repeats: pausing a paused domain
/// succeeds. `set_memory` rejects values above the configured maximum.
/// `ip_address`/`mac_address` return an empty string while unknown.
#[async_trait]
pub trait Hypervisor: Send + Sync + fmt::Debug {
    async fn define_and_start(&self, spec: &DomainSpec) -> HypervisorResult<DefinedDomain>;

    async fn pause(&self, id: &str) -> HypervisorResult<()>;

    async fn resume(&self, id: &str) -> HypervisorResult<()>;

    async fn destroy(&self, id: &str) -> HypervisorResult<()>;

    async fn state(&self, id: &str) -> HypervisorResult<DomainState>;

    async fn list_domains(&self, filter: DomainFilter) -> HypervisorResult<Vec<DomainInfo>>;

    async fn memory_stats(&self, id: &str) -> HypervisorResult<VmMemoryStats>;

    async fn set_memory(&self, id: &str, kib: u64) -> HypervisorResult<()>;

    async fn ip_address(&self, id: &str) -> HypervisorResult<String>;

    async fn mac_address(&self, id: &str) -> HypervisorResult<String>;

    /// Readiness probe against the guest control plane
    async fn daemon_ready(&self, id: &str) -> HypervisorResult<bool>;

    /// Tag a domain with the sandbox that owns it
    async fn set_sandbox_metadata(&self, id: &str, sandbox_id: &str) -> HypervisorResult<()>;

    /// Ownership tag, `None` when the domain carries none
    async fn sandbox_metadata(&self, id: &str) -> HypervisorResult<Option<String>>;
}
