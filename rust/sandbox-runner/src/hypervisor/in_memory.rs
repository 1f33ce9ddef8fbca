//! In-memory hypervisor for tests and local development.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DefinedDomain, DomainFilter, DomainInfo, DomainSpec, DomainState, Hypervisor};
use crate::error::{HypervisorError, HypervisorResult};
use crate::memory::VmMemoryStats;

#[derive(Debug, Clone)]
struct FakeDomain {
    uuid: String,
    state: DomainState,
    metadata: Option<String>,
    ip: String,
    mac: String,
    stats: VmMemoryStats,
}

#[derive(Debug, Default)]
struct State {
    domains: HashMap<String, FakeDomain>,
    next_id: u64,
    define_errors: VecDeque<HypervisorError>,
    failing_pause: HashSet<String>,
    failing_resume: HashSet<String>,
    failing_stats: HashSet<String>,
    metadata_fails: bool,
    daemon_ready: bool,
    set_memory_calls: Vec<(String, u64)>,
    destroyed: Vec<String>,
    define_calls: u64,
    domain_prefix: String,
}

/// Hypervisor gateway backed by a map, with fault injection hooks.
///
/// Domains defined through [`Hypervisor::define_and_start`] boot straight into
/// `running` with their balloon driver inactive. Tests drive everything else
/// through the `insert_domain`/`set_*`/`fail_*` helpers.
#[derive(Debug)]
pub struct InMemoryHypervisor {
    state: Mutex<State>,
}

impl Default for InMemoryHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                daemon_ready: true,
                next_id: 1,
                ..State::default()
            }),
        }
    }

    /// Register an existing domain, e.g. one left over from a previous runner
    pub fn insert_domain(&self, name: &str, state: DomainState, metadata: Option<&str>) {
        let mut guard = self.state.lock();
        let n = guard.next_id;
        guard.next_id += 1;
        let uuid = format!("00000000-0000-4000-8000-{n:012}");
        let stats = VmMemoryStats {
            domain_name: name.to_string(),
            domain_uuid: uuid.clone(),
            ..VmMemoryStats::default()
        };
        guard.domains.insert(
            name.to_string(),
            FakeDomain {
                uuid,
                state,
                metadata: metadata.map(str::to_string),
                ip: format!("10.0.{}.{}", n / 250, n % 250 + 2),
                mac: format!("52:54:00:00:{:02x}:{:02x}", n / 256, n % 256),
                stats,
            },
        );
    }

    /// Replace the guest-reported memory stats of a domain
    pub fn set_memory_stats(&self, name: &str, stats: VmMemoryStats) {
        if let Some(domain) = self.state.lock().domains.get_mut(name) {
            domain.stats = VmMemoryStats {
                domain_name: name.to_string(),
                domain_uuid: domain.uuid.clone(),
                ..stats
            };
        }
    }

    pub fn set_domain_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = self.state.lock().domains.get_mut(name) {
            domain.state = state;
        }
    }

    /// Queue an error returned by the next `define_and_start` call
    pub fn fail_next_define(&self, err: HypervisorError) {
        self.state.lock().define_errors.push_back(err);
    }

    pub fn fail_pause(&self, name: &str) {
        self.state.lock().failing_pause.insert(name.to_string());
    }

    pub fn fail_resume(&self, name: &str) {
        self.state.lock().failing_resume.insert(name.to_string());
    }

    pub fn fail_memory_stats(&self, name: &str) {
        self.state.lock().failing_stats.insert(name.to_string());
    }

    pub fn fail_metadata(&self, fail: bool) {
        self.state.lock().metadata_fails = fail;
    }

    /// Defined domains get `prefix` prepended to the requested name, the way
    /// gateways that assign their own domain names behave
    pub fn set_domain_prefix(&self, prefix: &str) {
        self.state.lock().domain_prefix = prefix.to_string();
    }

    pub fn set_daemon_ready(&self, ready: bool) {
        self.state.lock().daemon_ready = ready;
    }

    pub fn domain_state(&self, name: &str) -> Option<DomainState> {
        self.state.lock().domains.get(name).map(|d| d.state)
    }

    pub fn metadata(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .domains
            .get(name)
            .and_then(|d| d.metadata.clone())
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().domains.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every `set_memory` call that reached the gateway, in order
    pub fn set_memory_calls(&self) -> Vec<(String, u64)> {
        self.state.lock().set_memory_calls.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    pub fn define_calls(&self) -> u64 {
        self.state.lock().define_calls
    }
}

fn not_found(id: &str) -> HypervisorError {
    HypervisorError::NotFound(id.to_string())
}

#[async_trait]
impl Hypervisor for InMemoryHypervisor {
    async fn define_and_start(&self, spec: &DomainSpec) -> HypervisorResult<DefinedDomain> {
        let name = {
            let mut guard = self.state.lock();
            guard.define_calls += 1;
            if let Some(err) = guard.define_errors.pop_front() {
                return Err(err);
            }
            let name = format!("{}{}", guard.domain_prefix, spec.name);
            if guard.domains.contains_key(&name) {
                return Err(HypervisorError::AlreadyDefined(name));
            }
            name
        };

        self.insert_domain(&name, DomainState::Running, None);

        let mut guard = self.state.lock();
        let domain = guard.domains.get_mut(&name).ok_or_else(|| not_found(&name))?;
        let kib = spec.memory_mib * 1024;
        domain.stats.max_memory_kib = kib;
        domain.stats.actual_kib = kib;

        Ok(DefinedDomain {
            uuid: domain.uuid.clone(),
            name,
        })
    }

    async fn pause(&self, id: &str) -> HypervisorResult<()> {
        let mut guard = self.state.lock();
        if guard.failing_pause.contains(id) {
            return Err(HypervisorError::Operation(format!("pause of {id} failed")));
        }
        let domain = guard.domains.get_mut(id).ok_or_else(|| not_found(id))?;
        match domain.state {
            DomainState::Paused => Ok(()),
            DomainState::Running => {
                domain.state = DomainState::Paused;
                Ok(())
            }
            other => Err(HypervisorError::InvalidState {
                id: id.to_string(),
                state: other.to_string(),
                operation: "pause".to_string(),
            }),
        }
    }

    async fn resume(&self, id: &str) -> HypervisorResult<()> {
        let mut guard = self.state.lock();
        if guard.failing_resume.contains(id) {
            return Err(HypervisorError::Operation(format!("resume of {id} failed")));
        }
        let domain = guard.domains.get_mut(id).ok_or_else(|| not_found(id))?;
        match domain.state {
            DomainState::Running => Ok(()),
            DomainState::Paused => {
                domain.state = DomainState::Running;
                Ok(())
            }
            other => Err(HypervisorError::InvalidState {
                id: id.to_string(),
                state: other.to_string(),
                operation: "resume".to_string(),
            }),
        }
    }

    async fn destroy(&self, id: &str) -> HypervisorResult<()> {
        let mut guard = self.state.lock();
        if guard.domains.remove(id).is_some() {
            guard.destroyed.push(id.to_string());
        }
        Ok(())
    }

    async fn state(&self, id: &str) -> HypervisorResult<DomainState> {
        self.domain_state(id).ok_or_else(|| not_found(id))
    }

    async fn list_domains(&self, filter: DomainFilter) -> HypervisorResult<Vec<DomainInfo>> {
        let guard = self.state.lock();
        let mut domains: Vec<DomainInfo> = guard
            .domains
            .iter()
            .filter(|(_, d)| filter.matches(d.state))
            .map(|(name, d)| DomainInfo {
                name: name.clone(),
                uuid: d.uuid.clone(),
                state: d.state,
            })
            .collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(domains)
    }

    async fn memory_stats(&self, id: &str) -> HypervisorResult<VmMemoryStats> {
        let guard = self.state.lock();
        if guard.failing_stats.contains(id) {
            return Err(HypervisorError::Operation(format!(
                "memory stats of {id} unavailable"
            )));
        }
        guard
            .domains
            .get(id)
            .map(|d| d.stats.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn set_memory(&self, id: &str, kib: u64) -> HypervisorResult<()> {
        let mut guard = self.state.lock();
        let domain = guard.domains.get_mut(id).ok_or_else(|| not_found(id))?;
        if kib > domain.stats.max_memory_kib {
            return Err(HypervisorError::MemoryAboveMaximum {
                requested_kib: kib,
                max_kib: domain.stats.max_memory_kib,
            });
        }
        domain.stats.actual_kib = kib;
        guard.set_memory_calls.push((id.to_string(), kib));
        Ok(())
    }

    async fn ip_address(&self, id: &str) -> HypervisorResult<String> {
        let guard = self.state.lock();
        guard
            .domains
            .get(id)
            .map(|d| d.ip.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn mac_address(&self, id: &str) -> HypervisorResult<String> {
        let guard = self.state.lock();
        guard
            .domains
            .get(id)
            .map(|d| d.mac.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn daemon_ready(&self, id: &str) -> HypervisorResult<bool> {
        let guard = self.state.lock();
        let domain = guard.domains.get(id).ok_or_else(|| not_found(id))?;
        Ok(guard.daemon_ready && domain.state == DomainState::Running)
    }

    async fn set_sandbox_metadata(&self, id: &str, sandbox_id: &str) -> HypervisorResult<()> {
        let mut guard = self.state.lock();
        if guard.metadata_fails {
            return Err(HypervisorError::Operation(format!(
                "metadata write on {id} failed"
            )));
        }
        let domain = guard.domains.get_mut(id).ok_or_else(|| not_found(id))?;
        domain.metadata = Some(sandbox_id.to_string());
        Ok(())
    }

    async fn sandbox_metadata(&self, id: &str) -> HypervisorResult<Option<String>> {
        let guard = self.state.lock();
        if guard.metadata_fails {
            return Err(HypervisorError::Operation(format!(
                "metadata read on {id} failed"
            )));
        }
        guard
            .domains
            .get(id)
            .map(|d| d.metadata.clone())
            .ok_or_else(|| not_found(id))
    }
}
