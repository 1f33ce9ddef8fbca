//! `SQLite` store for memory samples.
//!
//! Samples are queued through a bounded channel and written in batches by a
//! background task, so the balloon loop never waits on disk. When the queue is
//! full the sample is dropped. A second task deletes records older than the
//! retention window.
//!
//! ```rust,ignore
//! let store = Arc::new(StatsStore::open(config.stats.clone()).await?);
//! let tasks = store.start(shutdown.clone())?;
//! store.record(&vm_stats);
//! let last_day = store.query(Some("pool-vm-0000001"), from, to).await?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StatsConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::memory::VmMemoryStats;
use crate::metrics;

const SELECT_COLUMNS: &str = "id, timestamp_ms, vm_name, vm_uuid, max_memory_kib, actual_kib, \
                              used_kib, unused_kib, rss_kib, balloon_active";

/// One persisted memory sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatsRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub vm_name: String,
    pub vm_uuid: String,
    pub max_memory_kib: u64,
    pub actual_kib: u64,
    pub used_kib: u64,
    pub unused_kib: u64,
    pub rss_kib: u64,
    pub balloon_active: bool,
}

/// A sample waiting to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStatsRecordInput {
    pub timestamp: DateTime<Utc>,
    pub vm_name: String,
    pub vm_uuid: String,
    pub max_memory_kib: u64,
    pub actual_kib: u64,
    pub used_kib: u64,
    pub unused_kib: u64,
    pub rss_kib: u64,
    pub balloon_active: bool,
}

impl From<&VmMemoryStats> for MemoryStatsRecordInput {
    fn from(stats: &VmMemoryStats) -> Self {
        Self {
            timestamp: Utc::now(),
            vm_name: stats.domain_name.clone(),
            vm_uuid: stats.domain_uuid.clone(),
            max_memory_kib: stats.max_memory_kib,
            actual_kib: stats.actual_kib,
            used_kib: stats.used_kib(),
            unused_kib: stats.unused_kib,
            rss_kib: stats.rss_kib,
            balloon_active: stats.is_balloon_driver_active(),
        }
    }
}

/// Buffered, retention-bounded memory stats log
#[derive(Debug)]
pub struct StatsStore {
    config: StatsConfig,
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    sender: mpsc::Sender<MemoryStatsRecordInput>,
    receiver: Mutex<Option<mpsc::Receiver<MemoryStatsRecordInput>>>,
    closed: AtomicBool,
}

impl StatsStore {
    /// Open (or create) `memory_stats.db` under `config.data_path` and migrate the schema
    pub async fn open(config: StatsConfig) -> RunnerResult<Self> {
        tokio::fs::create_dir_all(&config.data_path).await?;
        let db_path = config.db_path();

        let path = db_path.clone();
        let conn = task::spawn_blocking(move || -> RunnerResult<Connection> {
            let conn = Connection::open(&path)?;
            migrate_schema(&conn)?;
            Ok(conn)
        })
        .await??;

        let (sender, receiver) = mpsc::channel(config.write_buffer_size.max(1));

        Ok(Self {
            config,
            db_path,
            conn: Arc::new(Mutex::new(conn)),
            sender,
            receiver: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Spawn the batch writer and the retention sweeper.
    ///
    /// On shutdown the writer drains whatever is still queued before exiting.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> RunnerResult<Vec<JoinHandle<()>>> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| RunnerError::InvalidArgument("stats store already started".into()))?;

        let writer = tokio::spawn(Arc::clone(self).write_loop(receiver, shutdown.clone()));
        let cleanup = tokio::spawn(Arc::clone(self).cleanup_loop(shutdown));

        info!(
            path = %self.db_path.display(),
            retention_days = self.config.retention_days,
            "Stats store started"
        );
        Ok(vec![writer, cleanup])
    }

    /// Queue one sample. Never blocks; drops the sample when the buffer is full.
    pub fn record(&self, stats: &VmMemoryStats) {
        self.record_input(MemoryStatsRecordInput::from(stats));
    }

    pub fn record_batch<'a, I>(&self, stats: I)
    where
        I: IntoIterator<Item = &'a VmMemoryStats>,
    {
        for vm_stats in stats {
            self.record(vm_stats);
        }
    }

    fn record_input(&self, input: MemoryStatsRecordInput) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        match self.sender.try_send(input) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Stats write buffer full, dropping record");
                metrics::inc_stats_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Stop accepting samples. Already queued samples are still written.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn write_loop(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<MemoryStatsRecordInput>,
        shutdown: CancellationToken,
    ) {
        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut flush = tokio::time::interval(self.config.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    while let Ok(input) = receiver.try_recv() {
                        batch.push(input);
                    }
                    self.flush_batch(&mut batch).await;
                    debug!("Stats writer stopped");
                    break;
                }
                received = receiver.recv() => {
                    let Some(input) = received else {
                        self.flush_batch(&mut batch).await;
                        break;
                    };
                    batch.push(input);
                    if batch.len() >= batch_size {
                        self.flush_batch(&mut batch).await;
                    }
                }
                _ = flush.tick() => {
                    self.flush_batch(&mut batch).await;
                }
            }
        }
    }

    async fn flush_batch(&self, batch: &mut Vec<MemoryStatsRecordInput>) {
        if batch.is_empty() {
            return;
        }
        let records = std::mem::take(batch);
        let count = records.len();
        if let Err(e) = self.append(records).await {
            warn!(error = %e, count, "Failed to persist memory stats");
        }
    }

    async fn cleanup_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup().await {
                        warn!(error = %e, "Stats retention sweep failed");
                    }
                }
            }
        }
    }

    /// Delete records outside the retention window
    pub async fn cleanup(&self) -> RunnerResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.config.retention_days));
        let removed = self.purge_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Cleaned up old stats records");
        }
        Ok(removed)
    }

    /// Write records immediately, bypassing the queue
    pub async fn append(&self, records: Vec<MemoryStatsRecordInput>) -> RunnerResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO memory_stats (timestamp_ms, vm_name, vm_uuid, max_memory_kib, \
                     actual_kib, used_kib, unused_kib, rss_kib, balloon_active) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for r in &records {
                    stmt.execute(params![
                        r.timestamp.timestamp_millis(),
                        r.vm_name,
                        r.vm_uuid,
                        to_sql_int(r.max_memory_kib),
                        to_sql_int(r.actual_kib),
                        to_sql_int(r.used_kib),
                        to_sql_int(r.unused_kib),
                        to_sql_int(r.rss_kib),
                        r.balloon_active,
                    ])?;
                }
            }
            tx.commit()
        })
        .await
    }

    /// Records in `[from, to]`, optionally for a single VM, oldest first
    pub async fn query(
        &self,
        vm_name: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RunnerResult<Vec<MemoryStatsRecord>> {
        let vm_name = vm_name.filter(|n| !n.is_empty()).map(str::to_string);
        let (from_ms, to_ms) = (from.timestamp_millis(), to.timestamp_millis());

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM memory_stats \
                 WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2 \
                 AND (?3 IS NULL OR vm_name = ?3) ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![from_ms, to_ms, vm_name], row_to_record)?;
            rows.collect()
        })
        .await
    }

    pub async fn vm_names(&self) -> RunnerResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT vm_name FROM memory_stats ORDER BY vm_name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    /// Most recent record of every VM
    pub async fn latest_per_vm(&self) -> RunnerResult<HashMap<String, MemoryStatsRecord>> {
        let records = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM memory_stats \
                     WHERE id IN (SELECT MAX(id) FROM memory_stats GROUP BY vm_name)"
                ))?;
                let rows = stmt.query_map([], row_to_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        Ok(records
            .into_iter()
            .map(|r| (r.vm_name.clone(), r))
            .collect())
    }

    pub async fn count(&self) -> RunnerResult<u64> {
        let count: i64 = self
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM memory_stats", [], |row| row.get(0)))
            .await?;
        Ok(from_sql_int(count))
    }

    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> RunnerResult<u64> {
        let cutoff_ms = cutoff.timestamp_millis();
        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM memory_stats WHERE timestamp_ms < ?1",
                    params![cutoff_ms],
                )
            })
            .await?;
        Ok(removed as u64)
    }

    async fn with_conn<F, T>(&self, f: F) -> RunnerResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?;
        Ok(result?)
    }
}

fn migrate_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS memory_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_ms INTEGER NOT NULL,
            vm_name TEXT NOT NULL,
            vm_uuid TEXT NOT NULL,
            max_memory_kib INTEGER NOT NULL,
            actual_kib INTEGER NOT NULL,
            used_kib INTEGER NOT NULL,
            unused_kib INTEGER NOT NULL,
            rss_kib INTEGER NOT NULL,
            balloon_active INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memory_stats_vm_time
            ON memory_stats(vm_name, timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_memory_stats_time
            ON memory_stats(timestamp_ms);
        ",
    )
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryStatsRecord> {
    let timestamp_ms: i64 = row.get(1)?;
    Ok(MemoryStatsRecord {
        id: row.get(0)?,
        timestamp: DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default(),
        vm_name: row.get(2)?,
        vm_uuid: row.get(3)?,
        max_memory_kib: from_sql_int(row.get(4)?),
        actual_kib: from_sql_int(row.get(5)?),
        used_kib: from_sql_int(row.get(6)?),
        unused_kib: from_sql_int(row.get(7)?),
        rss_kib: from_sql_int(row.get(8)?),
        balloon_active: row.get(9)?,
    })
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_int(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(dir: &Path) -> StatsStore {
        StatsStore::open(StatsConfig {
            data_path: dir.to_path_buf(),
            ..StatsConfig::default()
        })
        .await
        .unwrap()
    }

    fn input(vm: &str, timestamp: DateTime<Utc>, actual: u64) -> MemoryStatsRecordInput {
        MemoryStatsRecordInput {
            timestamp,
            vm_name: vm.to_string(),
            vm_uuid: format!("uuid-{vm}"),
            max_memory_kib: 8_388_608,
            actual_kib: actual,
            used_kib: actual / 2,
            unused_kib: actual / 2,
            rss_kib: actual,
            balloon_active: true,
        }
    }

    #[tokio::test]
    async fn test_retention_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let now = Utc::now();

        store
            .append(vec![
                input("vm-a", now - ChronoDuration::days(10), 1024),
                input("vm-a", now - ChronoDuration::days(1), 2048),
                input("vm-b", now, 4096),
            ])
            .await
            .unwrap();

        let removed = store.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let now = Utc::now();

        store.append(vec![input("vm-a", now, 1)]).await.unwrap();
        store.append(vec![input("vm-a", now, 2), input("vm-b", now, 3)]).await.unwrap();

        let records = store
            .query(None, now - ChronoDuration::minutes(1), now + ChronoDuration::minutes(1))
            .await
            .unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_closed_store_ignores_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.close();
        store.record(&VmMemoryStats::default());
        assert!(store.is_closed());
        assert_eq!(store.receiver.lock().as_mut().unwrap().try_recv().ok(), None);
    }
}
