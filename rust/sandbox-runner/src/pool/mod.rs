//! Warm pool of pre-booted, paused VMs.
//!
//! A pool VM moves through a small state machine:
//!
//! ```text
//!   mark_creating ──► Creating ──finish_creating──► Available ──claim──► Claimed
//!                        │  ▲                           │                   │
//!              cancel_creating   └──── resume failed ───┘              release
//!                        ▼                                                  ▼
//!                    (removed)                                          (removed)
//! ```
//!
//! Pool VMs are single-use: a released VM leaves the pool instead of going
//! back to `Available`. All state lives behind one lock per pool; `claim`
//! keeps that lock across the resume call so two callers can never resume the
//! same VM.

pub mod recovery;
pub mod watcher;

pub use recovery::{recover, RecoveryReport};
pub use watcher::{PoolWatcher, WatcherReport};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::hypervisor::Hypervisor;
use crate::metrics;

/// Digits in the numeric suffix of a pool VM name
pub const NAME_INDEX_WIDTH: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolVmState {
    /// Name reserved, domain being booted (or waiting to be reaped)
    Creating,
    /// Paused and ready to hand out
    Available,
    /// Resumed and owned by a sandbox
    Claimed,
}

impl PoolVmState {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolVmState::Creating => "creating",
            PoolVmState::Available => "available",
            PoolVmState::Claimed => "claimed",
        }
    }

    /// Transitions between tracked states. Removal is not a state.
    pub fn can_transition_to(self, next: PoolVmState) -> bool {
        matches!(
            (self, next),
            (PoolVmState::Creating, PoolVmState::Available)
                | (PoolVmState::Available, PoolVmState::Claimed)
                | (PoolVmState::Available, PoolVmState::Creating)
        )
    }
}

impl fmt::Display for PoolVmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked pool VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolVm {
    pub name: String,
    pub domain_name: String,
    pub uuid: String,
    pub ip: String,
    pub mac: String,
    pub state: PoolVmState,
    /// Owner; empty unless `Claimed`
    pub sandbox_id: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the VM entered its current state
    pub state_since: DateTime<Utc>,
}

impl PoolVm {
    /// An available VM, ready for [`VmPool::add`]
    pub fn new(
        name: impl Into<String>,
        domain_name: impl Into<String>,
        uuid: impl Into<String>,
        ip: impl Into<String>,
        mac: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            domain_name: domain_name.into(),
            uuid: uuid.into(),
            ip: ip.into(),
            mac: mac.into(),
            state: PoolVmState::Available,
            sandbox_id: String::new(),
            created_at: now,
            claimed_at: None,
            state_since: now,
        }
    }

    fn creating(name: &str) -> Self {
        let mut vm = Self::new(name, name, "", "", "");
        vm.state = PoolVmState::Creating;
        vm
    }

    fn transition(&mut self, next: PoolVmState) -> RunnerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(RunnerError::invalid_transition(&self.name, self.state, next));
        }
        self.state = next;
        self.state_since = Utc::now();
        Ok(())
    }
}

/// Counts exposed to health and metrics endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub available: usize,
    pub claimed: usize,
    pub creating: usize,
    pub target_size: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    vms: HashMap<String, PoolVm>,
    next_index: u64,
}

impl PoolInner {
    fn count(&self, state: PoolVmState) -> usize {
        self.vms.values().filter(|vm| vm.state == state).count()
    }
}

/// The warm pool registry
#[derive(Debug)]
pub struct VmPool {
    hypervisor: Arc<dyn Hypervisor>,
    target_size: usize,
    name_prefix: String,
    inner: Mutex<PoolInner>,
}

impl VmPool {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, target_size: usize, name_prefix: impl Into<String>) -> Self {
        Self {
            hypervisor,
            target_size,
            name_prefix: name_prefix.into(),
            inner: Mutex::new(PoolInner {
                vms: HashMap::new(),
                next_index: 1,
            }),
        }
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Hand the oldest available VM to `sandbox_id`.
    ///
    /// Returns `Ok(None)` when nothing can be claimed; callers fall back to a
    /// cold boot. A VM whose resume fails is moved to `Creating` and the next
    /// candidate is tried.
    pub async fn claim(&self, sandbox_id: &str) -> RunnerResult<Option<PoolVm>> {
        if sandbox_id.is_empty() {
            return Err(RunnerError::InvalidArgument(
                "sandbox id must not be empty".into(),
            ));
        }

        let claimed = {
            let mut inner = self.inner.lock().await;
            let claimed = self.claim_locked(&mut inner, sandbox_id).await?;
            Self::publish_stats(&inner, self.target_size);
            claimed
        };

        let Some(vm) = claimed else {
            debug!(sandbox_id = %sandbox_id, "No pool VM available");
            metrics::inc_claim("miss");
            return Ok(None);
        };

        // Diagnostic only, outside the pool lock
        if let Err(e) = self
            .hypervisor
            .set_sandbox_metadata(&vm.domain_name, sandbox_id)
            .await
        {
            warn!(vm = %vm.name, sandbox_id = %sandbox_id, error = %e, "Failed to tag claimed VM");
            metrics::inc_claim_tag_failure();
        }

        info!(vm = %vm.name, sandbox_id = %sandbox_id, "Claimed pool VM");
        metrics::inc_claim("hit");
        Ok(Some(vm))
    }

    async fn claim_locked(
        &self,
        inner: &mut PoolInner,
        sandbox_id: &str,
    ) -> RunnerResult<Option<PoolVm>> {
        let mut candidates: Vec<(DateTime<Utc>, String)> = inner
            .vms
            .values()
            .filter(|vm| vm.state == PoolVmState::Available)
            .map(|vm| (vm.created_at, vm.name.clone()))
            .collect();
        candidates.sort();

        for (_, name) in candidates {
            let Some(vm) = inner.vms.get_mut(&name) else {
                continue;
            };

            if let Err(e) = self.hypervisor.resume(&vm.domain_name).await {
                warn!(vm = %name, error = %e, "Failed to resume pool VM, marking for recreation");
                vm.transition(PoolVmState::Creating)?;
                continue;
            }

            vm.transition(PoolVmState::Claimed)?;
            vm.sandbox_id = sandbox_id.to_string();
            vm.claimed_at = Some(Utc::now());
            return Ok(Some(vm.clone()));
        }

        Ok(None)
    }

    /// Publish `vm` as available, stamping its creation time
    pub async fn add(&self, mut vm: PoolVm) -> RunnerResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.vms.contains_key(&vm.name) {
            return Err(RunnerError::DuplicateVm(vm.name));
        }

        let now = Utc::now();
        vm.state = PoolVmState::Available;
        vm.sandbox_id.clear();
        vm.claimed_at = None;
        vm.created_at = now;
        vm.state_since = now;

        debug!(vm = %vm.name, "Added pool VM");
        inner.vms.insert(vm.name.clone(), vm);
        Self::publish_stats(&inner, self.target_size);
        Ok(())
    }

    /// Forget the VM owned by `sandbox_id`. Returns `None` when no VM matches.
    pub async fn release(&self, sandbox_id: &str) -> Option<PoolVm> {
        if sandbox_id.is_empty() {
            return None;
        }

        let mut inner = self.inner.lock().await;
        let name = inner
            .vms
            .values()
            .find(|vm| vm.state == PoolVmState::Claimed && vm.sandbox_id == sandbox_id)
            .map(|vm| vm.name.clone());

        let Some(name) = name else {
            debug!(sandbox_id = %sandbox_id, "No pool VM owned by sandbox");
            return None;
        };

        let released = inner.vms.remove(&name);
        info!(vm = %name, sandbox_id = %sandbox_id, "Released pool VM");
        Self::publish_stats(&inner, self.target_size);
        released
    }

    pub async fn remove(&self, name: &str) -> Option<PoolVm> {
        let mut inner = self.inner.lock().await;
        let removed = inner.vms.remove(name);
        if removed.is_some() {
            Self::publish_stats(&inner, self.target_size);
        }
        removed
    }

    pub async fn get(&self, name: &str) -> Option<PoolVm> {
        self.inner.lock().await.vms.get(name).cloned()
    }

    /// Snapshot of every tracked VM, sorted by name
    pub async fn list(&self) -> Vec<PoolVm> {
        let inner = self.inner.lock().await;
        let mut vms: Vec<PoolVm> = inner.vms.values().cloned().collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        vms
    }

    /// Reserve `name` for a VM about to be created
    pub async fn mark_creating(&self, name: &str) -> RunnerResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.vms.contains_key(name) {
            return Err(RunnerError::DuplicateVm(name.to_string()));
        }
        inner.vms.insert(name.to_string(), PoolVm::creating(name));
        Self::publish_stats(&inner, self.target_size);
        Ok(())
    }

    /// Complete a creation started with [`mark_creating`](Self::mark_creating)
    pub async fn finish_creating(
        &self,
        name: &str,
        domain_name: &str,
        uuid: &str,
        ip: &str,
        mac: &str,
    ) -> RunnerResult<()> {
        let mut inner = self.inner.lock().await;
        let vm = inner
            .vms
            .get_mut(name)
            .ok_or_else(|| RunnerError::VmNotFound(name.to_string()))?;

        vm.transition(PoolVmState::Available)?;
        vm.domain_name = domain_name.to_string();
        vm.uuid = uuid.to_string();
        vm.ip = ip.to_string();
        vm.mac = mac.to_string();
        vm.created_at = vm.state_since;

        Self::publish_stats(&inner, self.target_size);
        Ok(())
    }

    /// Abort a creation. Unknown names are a no-op.
    pub async fn cancel_creating(&self, name: &str) -> RunnerResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.vms.get(name).map(|vm| vm.state) {
            None => {
                debug!(vm = %name, "Cancel for untracked VM ignored");
                Ok(())
            }
            Some(PoolVmState::Creating) => {
                inner.vms.remove(name);
                Self::publish_stats(&inner, self.target_size);
                Ok(())
            }
            Some(state) => Err(RunnerError::InvalidTransition {
                name: name.to_string(),
                from: state.to_string(),
                to: "removed".to_string(),
            }),
        }
    }

    /// True while `available + creating` is below the target size
    pub async fn needs_replenishment(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.count(PoolVmState::Available) + inner.count(PoolVmState::Creating) < self.target_size
    }

    /// Next unused pool name. The index never goes backwards.
    pub async fn generate_vm_name(&self) -> String {
        let mut inner = self.inner.lock().await;
        loop {
            let index = inner.next_index;
            inner.next_index = index.saturating_add(1);
            let name = format_vm_name(&self.name_prefix, index);
            if !inner.vms.contains_key(&name) {
                return name;
            }
        }
    }

    /// Make sure future names start after `index`
    pub async fn advance_name_index(&self, index: u64) {
        let mut inner = self.inner.lock().await;
        inner.next_index = inner.next_index.max(index.saturating_add(1));
    }

    /// Index of `name` when it follows this pool's naming convention
    pub fn parse_name_index(&self, name: &str) -> Option<u64> {
        parse_vm_name(&self.name_prefix, name)
    }

    /// Drop VMs stuck in `Creating` for longer than `max_age` and return them
    /// so the caller can destroy their domains.
    pub async fn reap_stale_creating(&self, max_age: Duration) -> Vec<PoolVm> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };

        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .vms
            .values()
            .filter(|vm| vm.state == PoolVmState::Creating && vm.state_since <= cutoff)
            .map(|vm| vm.name.clone())
            .collect();

        let reaped: Vec<PoolVm> = stale
            .iter()
            .filter_map(|name| inner.vms.remove(name))
            .collect();
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped stale creating VMs");
            Self::publish_stats(&inner, self.target_size);
        }
        reaped
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        Self::publish_stats(&inner, self.target_size)
    }

    fn publish_stats(inner: &PoolInner, target_size: usize) -> PoolStats {
        let stats = PoolStats {
            available: inner.count(PoolVmState::Available),
            claimed: inner.count(PoolVmState::Claimed),
            creating: inner.count(PoolVmState::Creating),
            target_size,
        };
        metrics::record_pool_stats(&stats);
        stats
    }
}

pub fn format_vm_name(prefix: &str, index: u64) -> String {
    format!("{prefix}{index:0width$}", width = NAME_INDEX_WIDTH)
}

/// Inverse of [`format_vm_name`]: `prefix` followed by at least seven digits
pub fn parse_vm_name(prefix: &str, name: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.len() < NAME_INDEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{DomainState, InMemoryHypervisor};

    fn pool_with(hv: &Arc<InMemoryHypervisor>, target: usize) -> VmPool {
        VmPool::new(Arc::clone(hv) as Arc<dyn Hypervisor>, target, "pool-vm-")
    }

    #[test]
    fn test_name_format() {
        assert_eq!(format_vm_name("pool-vm-", 1), "pool-vm-0000001");
        assert_eq!(parse_vm_name("pool-vm-", "pool-vm-0000042"), Some(42));
        assert_eq!(parse_vm_name("pool-vm-", "pool-vm-42"), None);
        assert_eq!(parse_vm_name("pool-vm-", "sndbx-abc"), None);
        assert_eq!(parse_vm_name("pool-vm-", "pool-vm-00000x1"), None);
    }

    #[test]
    fn test_transitions() {
        use PoolVmState::{Available, Claimed, Creating};
        assert!(Creating.can_transition_to(Available));
        assert!(Available.can_transition_to(Claimed));
        assert!(Available.can_transition_to(Creating));
        assert!(!Claimed.can_transition_to(Available));
        assert!(!Creating.can_transition_to(Claimed));
        assert!(!Claimed.can_transition_to(Creating));
    }

    #[tokio::test]
    async fn test_creation_handshake() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 2);

        let name = pool.generate_vm_name().await;
        pool.mark_creating(&name).await.unwrap();
        assert!(matches!(
            pool.mark_creating(&name).await,
            Err(RunnerError::DuplicateVm(_))
        ));
        assert_eq!(pool.stats().await.creating, 1);

        pool.finish_creating(&name, &name, "uuid-1", "10.0.0.2", "52:54:00:00:00:01")
            .await
            .unwrap();
        let stats = pool.stats().await;
        assert_eq!((stats.available, stats.creating), (1, 0));

        // A second finish is not a legal transition
        assert!(matches!(
            pool.finish_creating(&name, &name, "", "", "").await,
            Err(RunnerError::InvalidTransition { .. })
        ));
        assert!(pool.cancel_creating(&name).await.is_err());
    }

    #[tokio::test]
    async fn test_generated_names_skip_tracked() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 1);

        pool.add(PoolVm::new("pool-vm-0000001", "pool-vm-0000001", "", "", ""))
            .await
            .unwrap();
        assert_eq!(pool.generate_vm_name().await, "pool-vm-0000002");

        pool.advance_name_index(10).await;
        assert_eq!(pool.generate_vm_name().await, "pool-vm-0000011");

        // Never moves backwards
        pool.advance_name_index(3).await;
        assert_eq!(pool.generate_vm_name().await, "pool-vm-0000012");
    }

    #[tokio::test]
    async fn test_claim_oldest_first() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 2);
        for name in ["pool-vm-0000001", "pool-vm-0000002"] {
            hv.insert_domain(name, DomainState::Paused, None);
            pool.add(PoolVm::new(name, name, "", "", "")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let vm = pool.claim("sbx-1").await.unwrap().unwrap();
        assert_eq!(vm.name, "pool-vm-0000001");
        assert_eq!(vm.state, PoolVmState::Claimed);
        assert_eq!(vm.sandbox_id, "sbx-1");
        assert!(vm.claimed_at.is_some());
        assert_eq!(hv.domain_state("pool-vm-0000001"), Some(DomainState::Running));
        assert_eq!(hv.metadata("pool-vm-0000001").as_deref(), Some("sbx-1"));
    }

    #[tokio::test]
    async fn test_claim_empty_sandbox_id_rejected() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 1);
        assert!(matches!(
            pool.claim("").await,
            Err(RunnerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_failure_moves_to_creating() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 2);
        for name in ["pool-vm-0000001", "pool-vm-0000002"] {
            hv.insert_domain(name, DomainState::Paused, None);
            pool.add(PoolVm::new(name, name, "", "", "")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        hv.fail_resume("pool-vm-0000001");

        let vm = pool.claim("sbx-1").await.unwrap().unwrap();
        assert_eq!(vm.name, "pool-vm-0000002");

        let broken = pool.get("pool-vm-0000001").await.unwrap();
        assert_eq!(broken.state, PoolVmState::Creating);

        let reaped = pool.reap_stale_creating(Duration::ZERO).await;
        assert_eq!(reaped.len(), 1);
        assert!(pool.get("pool-vm-0000001").await.is_none());
    }

    #[tokio::test]
    async fn test_tag_failure_does_not_fail_claim() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 1);
        hv.insert_domain("pool-vm-0000001", DomainState::Paused, None);
        pool.add(PoolVm::new("pool-vm-0000001", "pool-vm-0000001", "", "", ""))
            .await
            .unwrap();
        hv.fail_metadata(true);

        let vm = pool.claim("sbx-1").await.unwrap();
        assert!(vm.is_some());
        assert_eq!(pool.stats().await.claimed, 1);
    }

    #[tokio::test]
    async fn test_release_removes_vm() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 1);
        hv.insert_domain("pool-vm-0000001", DomainState::Paused, None);
        pool.add(PoolVm::new("pool-vm-0000001", "pool-vm-0000001", "", "", ""))
            .await
            .unwrap();
        pool.claim("sbx-1").await.unwrap();

        assert!(pool.release("sbx-unknown").await.is_none());
        let released = pool.release("sbx-1").await.unwrap();
        assert_eq!(released.name, "pool-vm-0000001");
        assert_eq!(pool.stats().await, PoolStats { target_size: 1, ..PoolStats::default() });
    }

    #[tokio::test]
    async fn test_needs_replenishment() {
        let hv = Arc::new(InMemoryHypervisor::new());
        let pool = pool_with(&hv, 2);
        assert!(pool.needs_replenishment().await);

        pool.mark_creating("pool-vm-0000001").await.unwrap();
        pool.add(PoolVm::new("pool-vm-0000002", "pool-vm-0000002", "", "", ""))
            .await
            .unwrap();
        assert!(!pool.needs_replenishment().await);

        pool.cancel_creating("pool-vm-0000001").await.unwrap();
        assert!(pool.needs_replenishment().await);
    }
}
