//! Memory balloon controller.
//!
//! Every cycle the controller measures all running VMs and moves each
//! allocation towards `used + buffer`, where the buffer is the larger of a
//! fixed amount and a fraction of used memory. The result is clamped to
//! `[min_vm_memory, max_memory]` of the VM. VMs whose balloon driver has
//! never reported are left alone: resizing without guest cooperation either
//! does nothing or crashes the guest.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::{collect_running_stats, VmMemoryStats};
use crate::config::BalloonConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::hypervisor::Hypervisor;
use crate::metrics;
use crate::stats_store::StatsStore;

/// Allocation the controller wants for one VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalloonTarget {
    pub used_kib: u64,
    pub buffer_kib: u64,
    pub target_kib: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentDirection {
    /// Memory taken back from the guest
    Reclaim,
    /// Memory handed back to the guest
    Return,
}

impl AdjustmentDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentDirection::Reclaim => "reclaim",
            AdjustmentDirection::Return => "return",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryAdjustment {
    pub domain: String,
    pub from_kib: u64,
    pub to_kib: u64,
    pub direction: AdjustmentDirection,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalloonCycleReport {
    pub measured: usize,
    pub skipped_inactive: usize,
    pub adjustments: Vec<MemoryAdjustment>,
    pub failures: usize,
}

/// Compute the balloon target for one VM.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    reason = "KiB values stay far below 2^52"
)]
pub fn compute_target(stats: &VmMemoryStats, config: &BalloonConfig) -> BalloonTarget {
    let used_kib = stats.used_kib();
    let proportional = (used_kib as f64 * config.safety_buffer_ratio) as u64;
    let buffer_kib = config.safety_buffer_kib().max(proportional);

    let min_kib = config.min_vm_memory_kib();
    let max_kib = stats.max_memory_kib;
    let wanted = used_kib.saturating_add(buffer_kib);

    // The VM maximum wins over the global floor
    let target_kib = if max_kib < min_kib {
        max_kib
    } else {
        wanted.clamp(min_kib, max_kib)
    };

    BalloonTarget {
        used_kib,
        buffer_kib,
        target_kib,
    }
}

/// Periodic measure-and-resize loop over all running VMs
#[derive(Debug)]
pub struct MemoryController {
    hypervisor: Arc<dyn Hypervisor>,
    config: BalloonConfig,
    stats_store: Option<Arc<StatsStore>>,
    last_stats: RwLock<HashMap<String, VmMemoryStats>>,
}

impl MemoryController {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, config: BalloonConfig) -> Self {
        Self {
            hypervisor,
            config,
            stats_store: None,
            last_stats: RwLock::new(HashMap::new()),
        }
    }

    /// Persist every measured batch to `store`
    #[must_use]
    pub fn with_stats_store(mut self, store: Arc<StatsStore>) -> Self {
        self.stats_store = Some(store);
        self
    }

    pub fn config(&self) -> &BalloonConfig {
        &self.config
    }

    /// Stats measured by the most recent cycle
    pub fn last_stats(&self) -> HashMap<String, VmMemoryStats> {
        self.last_stats.read().clone()
    }

    /// Run cycles until `shutdown` fires. A slow cycle delays the next tick
    /// rather than overlapping it.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Memory balloon controller disabled");
            return;
        }

        info!(
            interval_secs = self.config.check_interval_secs,
            min_kib = self.config.min_vm_memory_kib(),
            buffer_kib = self.config.safety_buffer_kib(),
            ratio = self.config.safety_buffer_ratio,
            "Memory balloon controller started"
        );

        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Memory balloon controller shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_cycle().await;
                    debug!(
                        measured = report.measured,
                        adjusted = report.adjustments.len(),
                        skipped_inactive = report.skipped_inactive,
                        failures = report.failures,
                        "Balloon cycle finished"
                    );
                }
            }
        }
    }

    /// One measurement and adjustment pass. Never fails: errors are logged,
    /// counted and left for the next cycle.
    pub async fn run_cycle(&self) -> BalloonCycleReport {
        let mut report = BalloonCycleReport::default();

        let stats = match collect_running_stats(self.hypervisor.as_ref()).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Failed to list running domains for ballooning");
                metrics::inc_balloon_error("list");
                report.failures += 1;
                return report;
            }
        };
        report.measured = stats.len();

        let mut names: Vec<&String> = stats.keys().collect();
        names.sort();

        let mut managed = 0;
        for name in names {
            let vm = &stats[name];
            if !vm.is_balloon_driver_active() {
                debug!(domain = %name, "Balloon driver inactive, skipping");
                report.skipped_inactive += 1;
                continue;
            }
            if vm.max_memory_kib == 0 {
                debug!(domain = %name, "No maximum memory reported, skipping");
                continue;
            }
            managed += 1;

            let target = compute_target(vm, &self.config);
            if target.target_kib == vm.actual_kib {
                continue;
            }

            match self.hypervisor.set_memory(name, target.target_kib).await {
                Ok(()) => {
                    let direction = if target.target_kib < vm.actual_kib {
                        AdjustmentDirection::Reclaim
                    } else {
                        AdjustmentDirection::Return
                    };
                    info!(
                        domain = %name,
                        from_kib = vm.actual_kib,
                        to_kib = target.target_kib,
                        used_kib = target.used_kib,
                        buffer_kib = target.buffer_kib,
                        direction = direction.as_str(),
                        "Adjusted VM memory"
                    );
                    metrics::inc_balloon_adjustment(direction.as_str());
                    report.adjustments.push(MemoryAdjustment {
                        domain: name.clone(),
                        from_kib: vm.actual_kib,
                        to_kib: target.target_kib,
                        direction,
                    });
                }
                Err(e) => {
                    warn!(domain = %name, target_kib = target.target_kib, error = %e, "Failed to set VM memory");
                    metrics::inc_balloon_error("set_memory");
                    report.failures += 1;
                }
            }
        }
        metrics::set_balloon_managed(managed);

        if let Some(store) = &self.stats_store {
            store.record_batch(stats.values());
        }
        *self.last_stats.write() = stats;

        report
    }

    /// Resize one VM by hand. Values outside `[min_vm_memory, max_memory]` are
    /// rejected before the gateway is called.
    pub async fn set_vm_memory(&self, domain: &str, kib: u64) -> RunnerResult<()> {
        let stats = self.hypervisor.memory_stats(domain).await?;
        let min_kib = self.config.min_vm_memory_kib();
        let max_kib = stats.max_memory_kib;

        if kib < min_kib || kib > max_kib {
            return Err(RunnerError::MemoryOutOfBounds {
                requested_kib: kib,
                min_kib,
                max_kib,
            });
        }

        self.hypervisor.set_memory(domain, kib).await?;
        info!(domain = %domain, from_kib = stats.actual_kib, to_kib = kib, "Set VM memory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BalloonConfig {
        BalloonConfig {
            enabled: true,
            check_interval_secs: 30,
            min_vm_memory_gb: 1.0,
            safety_buffer_gb: 2.0,
            safety_buffer_ratio: 0.25,
        }
    }

    fn stats(actual: u64, unused: u64, max: u64) -> VmMemoryStats {
        VmMemoryStats {
            domain_name: "vm".to_string(),
            max_memory_kib: max,
            actual_kib: actual,
            unused_kib: unused,
            last_update: 1_700_000_000,
            ..VmMemoryStats::default()
        }
    }

    #[test]
    fn test_target_uses_fixed_buffer_when_larger() {
        let target = compute_target(&stats(8_388_608, 6_000_000, 8_388_608), &config());
        assert_eq!(target.used_kib, 2_388_608);
        assert_eq!(target.buffer_kib, 2_097_152);
        assert_eq!(target.target_kib, 4_485_760);
    }

    #[test]
    fn test_target_uses_ratio_when_larger() {
        // used = 12 GiB, 25% = 3 GiB > 2 GiB fixed
        let gib = 1_048_576;
        let target = compute_target(&stats(16 * gib, 4 * gib, 16 * gib), &config());
        assert_eq!(target.used_kib, 12 * gib);
        assert_eq!(target.buffer_kib, 3 * gib);
        assert_eq!(target.target_kib, 15 * gib);
    }

    #[test]
    fn test_target_clamped_to_bounds() {
        let gib = 1_048_576;
        // Idle VM: used + buffer would be ~2 GiB, but max is 4 GiB and min 1 GiB
        let idle = compute_target(&stats(4 * gib, 4 * gib, 4 * gib), &config());
        assert_eq!(idle.target_kib, 2 * gib);

        // Busy VM: used + buffer exceeds max
        let busy = compute_target(&stats(4 * gib, 0, 4 * gib), &config());
        assert_eq!(busy.target_kib, 4 * gib);

        // Max below the global floor
        let tiny = compute_target(&stats(gib / 2, 0, gib / 2), &config());
        assert_eq!(tiny.target_kib, gib / 2);
    }

    #[test]
    fn test_min_floor_applies() {
        let mut cfg = config();
        cfg.safety_buffer_gb = 0.0;
        cfg.safety_buffer_ratio = 0.0;
        let gib = 1_048_576;
        let target = compute_target(&stats(4 * gib, 4 * gib - 100, 4 * gib), &cfg);
        assert_eq!(target.target_kib, gib);
    }
}
