//! Background replenishment of the warm pool.
//!
//! Creation is strictly one VM at a time, guarded by a lock separate from the
//! pool's state lock so slow boots never block `claim`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{recover, VmPool};
use crate::config::PoolConfig;
use crate::error::{HypervisorError, RunnerError, RunnerResult};
use crate::hypervisor::DomainSpec;
use crate::logging::OpTimer;
use crate::metrics;

/// Name collisions tolerated in one cycle before giving up until the next tick
const MAX_COLLISIONS_PER_CYCLE: usize = 64;

/// Outcome of one replenishment cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatcherReport {
    pub created: usize,
    pub failed: usize,
    pub collisions: usize,
    pub reaped: usize,
}

#[derive(Debug)]
pub struct PoolWatcher {
    pool: Arc<VmPool>,
    config: PoolConfig,
    creation_lock: Mutex<()>,
}

impl PoolWatcher {
    pub fn new(pool: Arc<VmPool>, config: PoolConfig) -> Self {
        Self {
            pool,
            config,
            creation_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Arc<VmPool> {
        &self.pool
    }

    /// Recover leftovers, then replenish once immediately and on every tick
    /// until `shutdown` fires. Does nothing when the target size is zero.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if self.pool.target_size() == 0 {
            info!("Pool target size is 0, watcher disabled");
            return;
        }

        match recover(&self.pool).await {
            Ok(report) => debug!(recovered = ?report.recovered, "Recovered pool VMs"),
            Err(e) => warn!(error = %e, "Pool recovery failed, starting with an empty pool"),
        }

        info!(
            target_size = self.pool.target_size(),
            interval_secs = self.config.watch_interval_secs,
            "Pool watcher started"
        );

        let mut interval = tokio::time::interval(self.config.watch_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Pool watcher shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_cycle(&shutdown).await;
                    if report != WatcherReport::default() {
                        info!(
                            created = report.created,
                            failed = report.failed,
                            collisions = report.collisions,
                            reaped = report.reaped,
                            "Pool replenishment cycle finished"
                        );
                    }
                }
            }
        }
    }

    /// Reap stuck VMs, then create VMs one by one until the pool is full,
    /// `max_attempts_per_cycle` creations have failed, or shutdown is requested.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> WatcherReport {
        let _creating = self.creation_lock.lock().await;
        let mut report = WatcherReport::default();

        let stale = self
            .pool
            .reap_stale_creating(self.config.stale_creating_after())
            .await;
        for vm in stale {
            self.destroy_quietly(&vm.domain_name).await;
            report.reaped += 1;
        }

        let max_failures = self.config.max_attempts_per_cycle as usize;
        while !shutdown.is_cancelled() && self.pool.needs_replenishment().await {
            if report.failed >= max_failures {
                warn!(failed = report.failed, "Too many failed creations, waiting for next cycle");
                break;
            }
            if report.collisions >= MAX_COLLISIONS_PER_CYCLE {
                warn!(collisions = report.collisions, "Too many name collisions, waiting for next cycle");
                break;
            }

            match self.create_one(shutdown).await {
                Ok(name) => {
                    metrics::inc_creation("success");
                    info!(vm = %name, "Pool VM ready");
                    report.created += 1;
                }
                Err(e) if e.is_already_defined() => {
                    // The next generated name is always different
                    metrics::inc_creation("collision");
                    debug!(error = %e, "Pool VM name already defined, retrying");
                    report.collisions += 1;
                }
                Err(RunnerError::Cancelled(_)) => break,
                Err(e) => {
                    metrics::inc_creation("failure");
                    warn!(error = %e, "Failed to create pool VM");
                    report.failed += 1;

                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.retry_backoff()) => {}
                    }
                }
            }
        }

        report
    }

    async fn create_one(&self, shutdown: &CancellationToken) -> RunnerResult<String> {
        let name = self.pool.generate_vm_name().await;
        self.pool.mark_creating(&name).await?;

        let timer = OpTimer::new("pool_watcher", "create_vm");
        let mut domain = None;
        let result = self.provision(&name, &mut domain, shutdown).await;
        timer.finish_with_result(result.as_ref());

        if let Err(e) = result {
            match domain {
                Some(domain) => self.destroy_quietly(&domain).await,
                // A collision means the domain belongs to someone else
                None if !e.is_already_defined() => self.destroy_quietly(&name).await,
                None => {}
            }
            if let Err(cancel_err) = self.pool.cancel_creating(&name).await {
                warn!(vm = %name, error = %cancel_err, "Failed to cancel pool VM creation");
            }
            return Err(e);
        }
        Ok(name)
    }

    /// Define, boot and pause the domain for `name`. `domain` is set to the
    /// gateway-assigned name as soon as the domain exists, so the caller can
    /// destroy it when a later step fails.
    async fn provision(
        &self,
        name: &str,
        domain: &mut Option<String>,
        shutdown: &CancellationToken,
    ) -> RunnerResult<()> {
        let hypervisor = self.pool.hypervisor();
        let spec = DomainSpec {
            name: name.to_string(),
            vcpus: self.config.vm_vcpus,
            memory_mib: self.config.vm_memory_mib,
            disk_gb: self.config.vm_disk_gb,
        };

        let defined = hypervisor.define_and_start(&spec).await?;
        *domain = Some(defined.name.clone());
        if defined.name != name {
            debug!(vm = %name, domain = %defined.name, "Gateway assigned a different domain name");
        }

        self.wait_ready(&defined.name, shutdown).await?;
        hypervisor.pause(&defined.name).await?;

        let ip = hypervisor.ip_address(&defined.name).await.unwrap_or_else(|e| {
            debug!(vm = %name, error = %e, "IP not resolved yet");
            String::new()
        });
        let mac = hypervisor
            .mac_address(&defined.name)
            .await
            .unwrap_or_default();

        self.pool
            .finish_creating(name, &defined.name, &defined.uuid, &ip, &mac)
            .await
    }

    /// Poll the guest daemon until it answers, the deadline passes, or shutdown
    async fn wait_ready(&self, domain: &str, shutdown: &CancellationToken) -> RunnerResult<()> {
        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;
        let hypervisor = self.pool.hypervisor();

        loop {
            match hypervisor.daemon_ready(domain).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if e.is_not_found() => return Err(e.into()),
                Err(e) => debug!(vm = %domain, error = %e, "Readiness probe failed"),
            }

            if Instant::now() >= deadline {
                return Err(HypervisorError::Operation(format!(
                    "guest daemon on {domain} not ready after {}s",
                    timeout.as_secs()
                ))
                .into());
            }

            tokio::select! {
                () = shutdown.cancelled() => {
                    return Err(RunnerError::Cancelled(format!("creation of {domain}")));
                }
                () = tokio::time::sleep(self.config.ready_poll_interval()) => {}
            }
        }
    }

    async fn destroy_quietly(&self, domain: &str) {
        if let Err(e) = self.pool.hypervisor().destroy(domain).await {
            warn!(vm = %domain, error = %e, "Failed to destroy pool domain");
        }
    }
}
