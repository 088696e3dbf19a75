//! Store handle
//!
//! Owns every component and exposes the client API. Each client call first
//! passes admission control, then goes to the transaction manager. Writes
//! take their key lock before admission, so a writer queued behind a lock
//! holder never occupies a slot the holder needs to commit.
//!
//! # On-disk layout
//!
//! ```text
//! {data_dir}/
//!   data/       containers under the directory hash
//!   journal/    write-ahead journal segments
//!   index.ckpt  last index checkpoint
//!   tx.seq      transaction id sequence
//! ```

use crate::index::{write_checkpoint, BLinkTree, Checkpoint, IndexStats};
use crate::query::KeyMatcher;
use crate::storage::allocator::SequenceGenerator;
use crate::storage::container::{ContainerSet, ContainerStats};
use crate::storage::dirhash::DirHash;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::journal::{Journal, JournalOp, JournalOptions, JournalStats};
use crate::storage::types::{Blob, Event, Key, Lsn, Record, TimeSeries, TxId, Vote, Xid};
use crate::throttle::{Throttle, ThrottleConfig, ThrottleStats};
use crate::txn::{
    recover, InDoubt, LockStats, Mutation, RecoveryReport, TransactionInfo, TransactionManager,
    TxnConfig, TxnStats, XFiles,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Runtime configuration of a store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Expected number of keys; sizes the directory hash
    pub capacity: u64,
    pub max_entries_per_dir: u64,
    pub dir_fan_out: u32,
    pub max_open_files: usize,
    /// LZ4-compress record payloads
    pub compress: bool,
    pub index_fanout: usize,
    pub journal: JournalOptions,
    pub txn: TxnConfig,
    pub throttle: ThrottleConfig,
    /// Journal sync and bitmap flush period
    pub flush_interval: Duration,
    /// Periodic index checkpoint; None checkpoints only on close
    pub checkpoint_interval: Option<Duration>,
    /// Transaction ids reserved per sequence file write
    pub id_chunk: u64,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tsvault_data"),
            capacity: 1_000_000,
            max_entries_per_dir: 1000,
            dir_fan_out: 64,
            max_open_files: 256,
            compress: true,
            index_fanout: 64,
            journal: JournalOptions::default(),
            txn: TxnConfig::default(),
            throttle: ThrottleConfig::default(),
            flush_interval: Duration::from_millis(200),
            checkpoint_interval: Some(Duration::from_secs(300)),
            id_chunk: 1024,
        }
    }
}

/// Everything a store reports about itself
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub index: IndexStats,
    pub journal: JournalStats,
    pub containers: ContainerStats,
    pub transactions: TxnStats,
    pub locks: LockStats,
    pub throttle: ThrottleStats,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Keys: {}, Height: {}, Next LSN: {}, Active tx: {}, In doubt: {}, Locks: {}, Used: {:.2} MB",
            self.index.entries,
            self.index.height,
            self.journal.next_lsn,
            self.transactions.active,
            self.transactions.in_doubt,
            self.locks.held,
            (self.containers.used_blocks * crate::storage::format::BLOCK_SIZE as u64) as f64
                / (1024.0 * 1024.0)
        )
    }
}

/// Result of a full consistency check
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub keys: usize,
    pub height: u32,
    pub leaves: usize,
    /// Keys whose record failed to read or verify
    pub damaged: Vec<(Key, String)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.damaged.is_empty()
    }
}

/// Writes checkpoints; one at a time
struct Checkpointer {
    txns: Arc<TransactionManager>,
    journal: Arc<Journal>,
    containers: Arc<ContainerSet>,
    path: PathBuf,
    running: Mutex<()>,
}

impl Checkpointer {
    async fn run(&self) -> StoreResult<Lsn> {
        let _running = self.running.lock().await;
        let image = self.txns.index_image().await;
        self.containers.flush_bitmaps()?;
        let entries = image.entries.len();
        write_checkpoint(
            &self.path,
            &Checkpoint {
                lsn: image.lsn,
                entries: image.entries,
            },
        )?;
        self.journal
            .append_durable(TxId(0), &JournalOp::Checkpoint { lsn: image.lsn })?;
        self.journal.rotate()?;
        self.journal.truncate_before(image.horizon)?;
        tracing::info!("Checkpoint at LSN {} ({} keys)", image.lsn, entries);
        Ok(image.lsn)
    }
}

pub struct Store {
    config: StoreConfig,
    index: Arc<BLinkTree>,
    journal: Arc<Journal>,
    files: Arc<XFiles>,
    txns: Arc<TransactionManager>,
    throttle: Throttle,
    checkpointer: Arc<Checkpointer>,
    recovery: RecoveryReport,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Store {
    /// Open (or create) a store, running recovery first
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let root = config.data_dir.clone();
        std::fs::create_dir_all(&root)?;

        let dirhash = DirHash::open(
            root.join("data"),
            config.capacity,
            config.max_entries_per_dir,
            config.dir_fan_out,
        )?;
        let containers = Arc::new(ContainerSet::new(dirhash, config.max_open_files));
        let (journal, scan) = Journal::open(root.join("journal"), config.journal.clone())?;
        if scan.truncated_bytes > 0 {
            tracing::warn!(
                "Journal had a torn tail; dropped {} bytes",
                scan.truncated_bytes
            );
        }
        let journal = Arc::new(journal);
        let ids = SequenceGenerator::open(root.join("tx.seq"), config.id_chunk)?;
        let checkpoint_path = root.join("index.ckpt");

        let state = recover(
            &journal,
            &containers,
            &checkpoint_path,
            &ids,
            config.index_fanout,
        )?;
        let index = Arc::new(state.index);
        let files = Arc::new(XFiles::new(containers.clone(), config.compress));
        let txns = Arc::new(TransactionManager::new(
            config.txn.clone(),
            index.clone(),
            journal.clone(),
            files.clone(),
            ids,
            state.visible,
        ));
        txns.adopt_in_doubt(state.in_doubt).await?;

        let checkpointer = Arc::new(Checkpointer {
            txns: txns.clone(),
            journal: journal.clone(),
            containers,
            path: checkpoint_path,
            running: Mutex::new(()),
        });

        let store = Self {
            throttle: Throttle::new(config.throttle.clone()),
            tasks: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            recovery: state.report,
            config,
            index,
            journal,
            files,
            txns,
            checkpointer,
        };
        store.start_background_tasks();

        tracing::info!(
            "Opened store at {:?} ({} keys, visible LSN {})",
            root,
            store.index.len(),
            store.txns.visible_lsn()
        );
        Ok(store)
    }

    fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.txns.start_reaper());
        tasks.push(start_background_flush(
            Arc::downgrade(&self.checkpointer),
            self.config.flush_interval,
        ));
        if let Some(period) = self.config.checkpoint_interval {
            tasks.push(start_periodic_checkpoint(
                Arc::downgrade(&self.checkpointer),
                period,
            ));
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// What recovery did when this store was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub async fn begin(&self) -> StoreResult<TxId> {
        self.ensure_open()?;
        let _permit = self.throttle.admit().await?;
        self.txns.begin()
    }

    pub async fn begin_xa(&self, xid: Xid) -> StoreResult<TxId> {
        self.ensure_open()?;
        let _permit = self.throttle.admit().await?;
        self.txns.begin_xa(xid)
    }

    /// Commit and return the commit LSN
    pub async fn commit(&self, tx: TxId) -> StoreResult<Lsn> {
        let _permit = self.throttle.admit().await?;
        self.txns.commit(tx).await
    }

    pub async fn rollback(&self, tx: TxId) -> StoreResult<()> {
        let _permit = self.throttle.admit().await?;
        self.txns.rollback(tx).await
    }

    pub async fn prepare(&self, tx: TxId) -> StoreResult<Vote> {
        let _permit = self.throttle.admit().await?;
        self.txns.prepare(tx).await
    }

    /// Replace `[series.start, series.end()]` of the stored series, with
    /// the written valid ranges attributed to `origin`
    pub async fn write_time_series(
        &self,
        tx: TxId,
        key: &Key,
        series: TimeSeries,
        origin: u64,
    ) -> StoreResult<()> {
        if series.samples.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "empty series written to {}",
                key
            )));
        }
        series.check_window()?;
        self.txns.lock_key(tx, key).await?;
        let _permit = self.throttle.admit().await?;
        self.txns
            .write(tx, key, Mutation::TimeSeries { series, origin })
            .await
    }

    /// Read a time series, optionally cut to the inclusive index range
    pub async fn read_time_series(
        &self,
        tx: TxId,
        key: &Key,
        range: Option<(i64, i64)>,
    ) -> StoreResult<TimeSeries> {
        let _permit = self.throttle.admit().await?;
        match self.txns.read(tx, key).await? {
            Record::TimeSeries(series) => match range {
                Some((start, end)) => series.window(start, end),
                None => Ok(series),
            },
            other => Err(wrong_type(key, "time series", &other)),
        }
    }

    pub async fn write_blob(
        &self,
        tx: TxId,
        key: &Key,
        data: impl Into<Vec<u8>>,
        origin: u64,
    ) -> StoreResult<()> {
        self.txns.lock_key(tx, key).await?;
        let _permit = self.throttle.admit().await?;
        self.txns
            .write(
                tx,
                key,
                Mutation::Blob {
                    data: data.into(),
                    origin,
                },
            )
            .await
    }

    pub async fn read_blob(&self, tx: TxId, key: &Key) -> StoreResult<Blob> {
        let _permit = self.throttle.admit().await?;
        match self.txns.read(tx, key).await? {
            Record::Blob(blob) => Ok(blob),
            other => Err(wrong_type(key, "blob", &other)),
        }
    }

    /// Replace every event with `start <= time <= end`
    pub async fn write_events(
        &self,
        tx: TxId,
        key: &Key,
        start: f64,
        end: f64,
        events: Vec<Event>,
    ) -> StoreResult<()> {
        self.txns.lock_key(tx, key).await?;
        let _permit = self.throttle.admit().await?;
        self.txns
            .write(tx, key, Mutation::Events { start, end, events })
            .await
    }

    pub async fn read_events(
        &self,
        tx: TxId,
        key: &Key,
        start: f64,
        end: f64,
    ) -> StoreResult<Vec<Event>> {
        let _permit = self.throttle.admit().await?;
        match self.txns.read(tx, key).await? {
            Record::Events(series) => Ok(series.window(start, end)),
            other => Err(wrong_type(key, "event series", &other)),
        }
    }

    pub async fn delete(&self, tx: TxId, key: &Key) -> StoreResult<()> {
        self.txns.lock_key(tx, key).await?;
        let _permit = self.throttle.admit().await?;
        self.txns.delete(tx, key).await
    }

    pub async fn exists(&self, tx: TxId, key: &Key) -> StoreResult<bool> {
        let _permit = self.throttle.admit().await?;
        self.txns.exists(tx, key).await
    }

    /// Committed keys matching a pattern, in key order
    pub async fn match_keys(&self, pattern: &str) -> StoreResult<Vec<Key>> {
        self.ensure_open()?;
        let matcher = KeyMatcher::new(pattern)?;
        let _permit = self.throttle.admit().await?;
        Ok(self
            .index
            .range_scan(matcher.scan_prefix())
            .filter(|(key, entry)| matcher.accepts(key, entry))
            .map(|(key, _)| key)
            .collect())
    }

    /// Persist the index and drop journal segments it covers
    pub async fn checkpoint(&self) -> StoreResult<Lsn> {
        self.ensure_open()?;
        self.checkpointer.run().await
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats {
            index: self.index.stats(),
            journal: self.journal.stats(),
            containers: self.files.containers().stats(),
            transactions: self.txns.stats(),
            locks: self.txns.lock_stats().await?,
            throttle: self.throttle.stats(),
        })
    }

    pub fn transactions(&self) -> Vec<TransactionInfo> {
        self.txns.transactions()
    }

    /// Prepared transactions recovered without an outcome
    pub fn in_doubt(&self) -> Vec<InDoubt> {
        self.txns.in_doubt()
    }

    pub fn find_by_xid(&self, xid: &Xid) -> Option<TxId> {
        self.txns.find_by_xid(xid)
    }

    /// Decide an in-doubt transaction
    pub async fn resolve(&self, tx: TxId, commit: bool) -> StoreResult<()> {
        self.ensure_open()?;
        if !self.in_doubt().iter().any(|d| d.tx == tx) {
            return Err(StoreError::InvalidState(format!("{} is not in doubt", tx)));
        }
        if commit {
            let lsn = self.txns.commit(tx).await?;
            tracing::info!("Resolved {} by commit at LSN {}", tx, lsn);
        } else {
            self.txns.force_rollback(tx).await?;
            tracing::info!("Resolved {} by rollback", tx);
        }
        Ok(())
    }

    pub async fn force_rollback(&self, tx: TxId) -> StoreResult<()> {
        self.ensure_open()?;
        self.txns.force_rollback(tx).await
    }

    /// Check index structure and re-read every record
    pub async fn verify(&self) -> StoreResult<VerifyReport> {
        self.ensure_open()?;
        let shape = self.index.check_invariants()?;
        let mut report = VerifyReport {
            keys: shape.entries,
            height: shape.height,
            leaves: shape.leaves,
            damaged: Vec::new(),
        };
        for (key, entry) in self.index.scan() {
            if let Err(e) = self.files.read(&key, &entry) {
                tracing::warn!("Verify: {} is damaged: {}", key, e);
                report.damaged.push((key, e.to_string()));
            }
        }
        Ok(report)
    }

    /// Roll back open transactions, checkpoint and stop background work.
    /// Prepared transactions survive as in-doubt.
    pub async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.txns.close().await;
        self.throttle.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.checkpointer.run().await?;
        self.journal.sync()?;
        tracing::info!("Store at {:?} closed", self.config.data_dir);
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn wrong_type(key: &Key, wanted: &str, found: &Record) -> StoreError {
    StoreError::InvalidArgument(format!(
        "{} holds {}, not a {}",
        key,
        found.data_type(),
        wanted
    ))
}

/// Sync the journal and persist allocation bitmaps on a timer
fn start_background_flush(checkpointer: Weak<Checkpointer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let Some(c) = checkpointer.upgrade() else {
                break;
            };
            if let Err(e) = c.journal.sync() {
                tracing::error!("Background journal sync failed: {}", e);
            }
            if let Err(e) = c.containers.flush_bitmaps() {
                tracing::error!("Background bitmap flush failed: {}", e);
            }
        }
    })
}

fn start_periodic_checkpoint(checkpointer: Weak<Checkpointer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // The first tick fires immediately; recovery just checkpointed
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(c) = checkpointer.upgrade() else {
                break;
            };
            if let Err(e) = c.run().await {
                tracing::error!("Periodic checkpoint failed: {}", e);
            }
        }
    })
}
