//! Startup scan that re-adopts paused pool VMs left by a previous runner.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{PoolVm, VmPool};
use crate::error::{RunnerError, RunnerResult};
use crate::hypervisor::{DomainFilter, DomainState};
use crate::metrics;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Names registered as available
    pub recovered: Vec<String>,
    /// Pool-named domains left alone, with the reason
    pub skipped: Vec<(String, String)>,
    /// Largest name index seen, recovered or not
    pub highest_index: Option<u64>,
}

/// Register every paused, unowned domain that follows the pool naming
/// convention as `Available`, and move the name counter past every pool name
/// found so new VMs never collide with leftovers.
pub async fn recover(pool: &VmPool) -> RunnerResult<RecoveryReport> {
    let hypervisor = pool.hypervisor();
    let mut domains = hypervisor.list_domains(DomainFilter::All).await?;
    domains.sort_by(|a, b| a.name.cmp(&b.name));

    let mut report = RecoveryReport::default();

    for domain in domains {
        let Some(index) = pool.parse_name_index(&domain.name) else {
            continue;
        };
        report.highest_index = report.highest_index.max(Some(index));

        if domain.state != DomainState::Paused {
            debug!(vm = %domain.name, state = %domain.state, "Skipping non-paused pool domain");
            report
                .skipped
                .push((domain.name, format!("domain is {}", domain.state)));
            continue;
        }

        match hypervisor.sandbox_metadata(&domain.name).await {
            Ok(Some(owner)) if !owner.is_empty() && owner != domain.name => {
                debug!(vm = %domain.name, sandbox_id = %owner, "Skipping pool domain owned by a sandbox");
                report
                    .skipped
                    .push((domain.name, format!("owned by sandbox {owner}")));
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(vm = %domain.name, error = %e, "Could not read ownership metadata, leaving domain alone");
                report
                    .skipped
                    .push((domain.name, format!("metadata unreadable: {e}")));
                continue;
            }
        }

        let ip = hypervisor.ip_address(&domain.name).await.unwrap_or_else(|e| {
            debug!(vm = %domain.name, error = %e, "IP not resolved during recovery");
            String::new()
        });
        let mac = hypervisor
            .mac_address(&domain.name)
            .await
            .unwrap_or_default();

        let vm = PoolVm::new(&domain.name, &domain.name, &domain.uuid, ip, mac);
        match pool.add(vm).await {
            Ok(()) => report.recovered.push(domain.name),
            Err(RunnerError::DuplicateVm(name)) => {
                report.skipped.push((name, "already tracked".to_string()));
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(index) = report.highest_index {
        pool.advance_name_index(index).await;
    }

    metrics::inc_recovered(report.recovered.len() as u64);
    info!(
        recovered = report.recovered.len(),
        skipped = report.skipped.len(),
        "Pool recovery finished"
    );
    Ok(report)
}
