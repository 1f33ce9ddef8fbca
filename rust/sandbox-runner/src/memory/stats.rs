//! Guest memory statistics and their collection from running domains.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::HypervisorResult;
use crate::hypervisor::{DomainFilter, Hypervisor};

/// Point-in-time memory measurement for one running VM. All sizes in KiB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMemoryStats {
    pub domain_name: String,
    pub domain_uuid: String,
    /// Configured maximum
    pub max_memory_kib: u64,
    /// Current balloon allocation
    pub actual_kib: u64,
    /// Guest-reported free memory
    pub unused_kib: u64,
    /// Resident set size on the host
    pub rss_kib: u64,
    /// Guest balloon driver heartbeat (unix seconds), 0 when the driver never reported
    pub last_update: i64,
}

impl VmMemoryStats {
    /// Allocation minus unused, floored at zero
    pub fn used_kib(&self) -> u64 {
        self.actual_kib.saturating_sub(self.unused_kib)
    }

    pub fn is_balloon_driver_active(&self) -> bool {
        self.last_update != 0
    }
}

/// Fetch memory stats for every running domain, keyed by domain name.
///
/// Paused and stopped domains are skipped. A failure on one domain is logged
/// and leaves that domain out of the result; only a failed listing is an error.
pub async fn collect_running_stats(
    hypervisor: &dyn Hypervisor,
) -> HypervisorResult<HashMap<String, VmMemoryStats>> {
    let domains = hypervisor.list_domains(DomainFilter::Running).await?;
    let mut stats = HashMap::with_capacity(domains.len());

    for domain in domains {
        match hypervisor.memory_stats(&domain.name).await {
            Ok(mut vm_stats) => {
                if vm_stats.domain_name.is_empty() {
                    vm_stats.domain_name.clone_from(&domain.name);
                }
                if vm_stats.domain_uuid.is_empty() {
                    vm_stats.domain_uuid.clone_from(&domain.uuid);
                }
                stats.insert(domain.name, vm_stats);
            }
            Err(e) if e.is_not_found() => {
                debug!(domain = %domain.name, "Domain disappeared before stats could be read");
            }
            Err(e) => {
                warn!(domain = %domain.name, error = %e, "Failed to read memory stats");
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{DomainState, InMemoryHypervisor};

    #[test]
    fn test_used_memory_floors_at_zero() {
        let stats = VmMemoryStats {
            actual_kib: 1000,
            unused_kib: 4000,
            ..VmMemoryStats::default()
        };
        assert_eq!(stats.used_kib(), 0);

        let stats = VmMemoryStats {
            actual_kib: 8_388_608,
            unused_kib: 6_000_000,
            ..VmMemoryStats::default()
        };
        assert_eq!(stats.used_kib(), 2_388_608);
    }

    #[test]
    fn test_driver_activity() {
        let mut stats = VmMemoryStats::default();
        assert!(!stats.is_balloon_driver_active());
        stats.last_update = 1_700_000_000;
        assert!(stats.is_balloon_driver_active());
    }

    #[tokio::test]
    async fn test_collect_skips_non_running_and_failing() {
        let hv = InMemoryHypervisor::new();
        hv.insert_domain("vm-running", DomainState::Running, None);
        hv.insert_domain("vm-paused", DomainState::Paused, None);
        hv.insert_domain("vm-broken", DomainState::Running, None);
        hv.fail_memory_stats("vm-broken");

        let stats = collect_running_stats(&hv).await.unwrap();

        assert_eq!(stats.len(), 1);
        let vm = &stats["vm-running"];
        assert_eq!(vm.domain_name, "vm-running");
        assert!(!vm.domain_uuid.is_empty());
    }
}
