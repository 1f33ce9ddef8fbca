//! Wiring of the pool, balloon controller and stats store into one service.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{RunnerError, RunnerResult};
use crate::hypervisor::Hypervisor;
use crate::memory::MemoryController;
use crate::metrics;
use crate::pool::{PoolWatcher, VmPool};
use crate::stats_store::StatsStore;

/// Owns every background task of a runner and their shared shutdown signal
#[derive(Debug)]
pub struct SandboxRunner {
    config: Config,
    pool: Arc<VmPool>,
    watcher: Arc<PoolWatcher>,
    memory: Arc<MemoryController>,
    stats_store: Arc<StatsStore>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SandboxRunner {
    pub async fn new(config: Config, hypervisor: Arc<dyn Hypervisor>) -> RunnerResult<Self> {
        config.validate()?;
        if let Err(e) = metrics::init_metrics() {
            warn!(error = %e, "Metrics unavailable");
        }

        let stats_store = Arc::new(StatsStore::open(config.stats.clone()).await?);
        let pool = Arc::new(VmPool::new(
            Arc::clone(&hypervisor),
            config.pool.target_size,
            config.pool.name_prefix.clone(),
        ));
        let watcher = Arc::new(PoolWatcher::new(Arc::clone(&pool), config.pool.clone()));
        let memory = Arc::new(
            MemoryController::new(hypervisor, config.balloon.clone())
                .with_stats_store(Arc::clone(&stats_store)),
        );

        Ok(Self {
            config,
            pool,
            watcher,
            memory,
            stats_store,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<VmPool> {
        &self.pool
    }

    pub fn watcher(&self) -> &Arc<PoolWatcher> {
        &self.watcher
    }

    pub fn memory_controller(&self) -> &Arc<MemoryController> {
        &self.memory
    }

    pub fn stats_store(&self) -> &Arc<StatsStore> {
        &self.stats_store
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the watcher, the balloon loop and the stats store tasks
    pub fn start(&mut self) -> RunnerResult<()> {
        if !self.tasks.is_empty() {
            return Err(RunnerError::InvalidArgument("runner already started".into()));
        }

        self.tasks
            .extend(self.stats_store.start(self.shutdown.clone())?);
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.watcher).run(self.shutdown.clone()),
        ));
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.memory).run(self.shutdown.clone()),
        ));

        info!(
            target_size = self.config.pool.target_size,
            balloon_enabled = self.config.balloon.enabled,
            "Sandbox runner started"
        );
        Ok(())
    }

    /// Signal every task to stop and wait until they have
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.stats_store.close();

        for result in join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Sandbox runner stopped");
    }
}
