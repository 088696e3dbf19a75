//! Transaction manager
//!
//! Coordinates begin / write / prepare / commit / rollback over the index,
//! the journal and the container files.
//!
//! # Commit path
//!
//! ```text
//! write:   lock key → merge with latest committed → new blocks → journal Write
//! commit:  sync containers → [gate: durable Commit → retain old versions →
//!          index → publish visible LSN] → release locks → free dead versions
//! ```
//!
//! Readers see the index as of their snapshot (the visible LSN at begin)
//! plus their own pending writes. Entries committed after the snapshot are
//! skipped in favour of the retained version that was current at it.

use crate::index::{BLinkTree, IndexEntry};
use crate::storage::allocator::SequenceGenerator;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::journal::{Journal, JournalOp};
use crate::storage::types::{Key, Lsn, Record, TxId, Vote, Xid};
use crate::txn::locks::{LockPolicy, LockStats, LockTable};
use crate::txn::retention::VersionRetention;
use crate::txn::xfile::{Mutation, XFiles};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::interval;

/// Transaction manager settings
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Active transactions older than this are rolled back
    pub timeout: Duration,
    pub lock_policy: LockPolicy,
    /// How often the reaper looks for expired transactions
    pub reaper_interval: Duration,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            lock_policy: LockPolicy::Wait(Duration::from_secs(30)),
            reaper_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committed,
    Aborted,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Active => "active",
            TxState::Preparing => "preparing",
            TxState::Prepared => "prepared",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// A buffered change, applied to the index at commit
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Write(IndexEntry),
    Delete,
}

struct Transaction {
    id: TxId,
    xid: Option<Xid>,
    state: TxState,
    snapshot: Lsn,
    started: Instant,
    started_at: DateTime<Utc>,
    /// None for recovered prepared transactions
    deadline: Option<Instant>,
    /// LSN of the Begin record, once the first change is journaled
    first_lsn: Option<Lsn>,
    pending: BTreeMap<Key, PendingOp>,
    dirty_files: BTreeSet<u64>,
}

/// A prepared transaction rebuilt from the journal
#[derive(Debug, Clone)]
pub struct RecoveredTx {
    pub id: TxId,
    pub xid: Option<Xid>,
    pub first_lsn: Lsn,
    pub pending: BTreeMap<Key, PendingOp>,
}

/// Prepared transaction awaiting an outcome from its coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InDoubt {
    pub tx: TxId,
    pub xid: Option<Xid>,
    pub keys: usize,
}

/// Monitoring view of a live transaction
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: TxId,
    pub xid: Option<Xid>,
    /// None while an operation is running on the transaction
    pub state: Option<TxState>,
    pub snapshot: Lsn,
    pub started_at: Option<DateTime<Utc>>,
    pub age_ms: u64,
    pub pending: usize,
    pub in_doubt: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TxnStats {
    pub active: usize,
    pub in_doubt: usize,
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub timed_out: u64,
    pub retained_versions: usize,
    pub visible_lsn: Lsn,
}

/// Checkpointable view of the index
#[derive(Debug, Clone)]
pub struct IndexImage {
    /// Every commit up to here is reflected in `entries`
    pub lsn: Lsn,
    pub entries: Vec<(Key, IndexEntry)>,
    /// Journal records below this LSN are no longer needed
    pub horizon: Lsn,
}

#[derive(Default)]
struct Registry {
    live: HashMap<TxId, Arc<Mutex<Transaction>>>,
    /// Snapshot LSN → number of live transactions holding it
    snapshots: BTreeMap<Lsn, usize>,
    xids: HashMap<Xid, TxId>,
    first_lsns: HashMap<TxId, Lsn>,
    /// Recovered prepared transactions; fixed until resolved
    in_doubt: HashMap<TxId, InDoubt>,
}

pub struct TransactionManager {
    config: TxnConfig,
    index: Arc<BLinkTree>,
    journal: Arc<Journal>,
    files: Arc<XFiles>,
    locks: LockTable,
    retention: VersionRetention,
    ids: SequenceGenerator,
    registry: parking_lot::Mutex<Registry>,
    visible: AtomicU64,
    /// Serializes commit marker, index apply and publish
    commit_gate: Mutex<()>,
    timed_out: parking_lot::Mutex<HashSet<TxId>>,
    closed: AtomicBool,
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    timeouts: AtomicU64,
}

impl TransactionManager {
    /// Must be called inside a tokio runtime (the lock table is a task)
    pub fn new(
        config: TxnConfig,
        index: Arc<BLinkTree>,
        journal: Arc<Journal>,
        files: Arc<XFiles>,
        ids: SequenceGenerator,
        visible: Lsn,
    ) -> Self {
        Self {
            config,
            index,
            journal,
            files,
            locks: LockTable::spawn(),
            retention: VersionRetention::new(),
            ids,
            registry: parking_lot::Mutex::new(Registry::default()),
            visible: AtomicU64::new(visible.0),
            commit_gate: Mutex::new(()),
            timed_out: parking_lot::Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Highest LSN whose commit is visible to new snapshots
    pub fn visible_lsn(&self) -> Lsn {
        Lsn(self.visible.load(Ordering::Acquire))
    }

    pub fn begin(&self) -> StoreResult<TxId> {
        self.begin_inner(None)
    }

    /// Begin a transaction branch coordinated by an external manager
    pub fn begin_xa(&self, xid: Xid) -> StoreResult<TxId> {
        self.begin_inner(Some(xid))
    }

    fn begin_inner(&self, xid: Option<Xid>) -> StoreResult<TxId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let id = TxId(self.ids.next_id()?);
        let now = Instant::now();

        let mut registry = self.registry.lock();
        if let Some(xid) = &xid {
            if let Some(owner) = registry.xids.get(xid) {
                return Err(StoreError::InvalidState(format!(
                    "xid {} already belongs to {}",
                    xid, owner
                )));
            }
            registry.xids.insert(xid.clone(), id);
        }
        // Taken under the registry lock so garbage collection sees it
        let snapshot = self.visible_lsn();
        *registry.snapshots.entry(snapshot).or_default() += 1;
        registry.live.insert(
            id,
            Arc::new(Mutex::new(Transaction {
                id,
                xid,
                state: TxState::Active,
                snapshot,
                started: now,
                started_at: Utc::now(),
                deadline: Some(now + self.config.timeout),
                first_lsn: None,
                pending: BTreeMap::new(),
                dirty_files: BTreeSet::new(),
            })),
        );
        drop(registry);

        self.begun.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Began {} at snapshot {}", id, snapshot);
        Ok(id)
    }

    fn handle(&self, tx: TxId) -> StoreResult<Arc<Mutex<Transaction>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if let Some(handle) = self.registry.lock().live.get(&tx) {
            return Ok(handle.clone());
        }
        Err(self.gone(tx))
    }

    /// Error for a transaction that no longer exists. A timeout is reported
    /// once.
    fn gone(&self, tx: TxId) -> StoreError {
        if self.timed_out.lock().remove(&tx) {
            StoreError::Timeout(tx)
        } else {
            StoreError::UnknownTransaction(tx)
        }
    }

    /// Fail unless the transaction may still change; rolls it back if it
    /// has outlived its deadline.
    async fn ensure_active(&self, t: &mut Transaction) -> StoreResult<()> {
        match t.state {
            TxState::Active => {
                if t.deadline.is_some_and(|d| Instant::now() >= d) {
                    self.expire(t).await;
                    return Err(self.gone(t.id));
                }
                Ok(())
            }
            TxState::Preparing | TxState::Prepared => Err(StoreError::InvalidState(format!(
                "{} is {} and can no longer change",
                t.id, t.state
            ))),
            TxState::Committed | TxState::Aborted => Err(self.gone(t.id)),
        }
    }

    fn ensure_readable(&self, t: &Transaction) -> StoreResult<()> {
        match t.state {
            TxState::Committed | TxState::Aborted => Err(self.gone(t.id)),
            _ => Ok(()),
        }
    }

    /// Journal the Begin record on the first change
    fn ensure_begun(&self, t: &mut Transaction) -> StoreResult<()> {
        if t.first_lsn.is_none() {
            let lsn = self
                .journal
                .append(t.id, &JournalOp::Begin { xid: t.xid.clone() })?;
            t.first_lsn = Some(lsn);
            self.registry.lock().first_lsns.insert(t.id, lsn);
        }
        Ok(())
    }

    /// Latest committed entry or this transaction's own pending change
    fn latest_entry(&self, t: &Transaction, key: &Key) -> StoreResult<Option<IndexEntry>> {
        match t.pending.get(key) {
            Some(PendingOp::Write(entry)) => Ok(Some(entry.clone())),
            Some(PendingOp::Delete) => Ok(None),
            None => self.index.lookup(key),
        }
    }

    /// Entry visible to the transaction's snapshot, own writes first
    fn visible_entry(&self, t: &Transaction, key: &Key) -> StoreResult<Option<IndexEntry>> {
        match t.pending.get(key) {
            Some(PendingOp::Write(entry)) => return Ok(Some(entry.clone())),
            Some(PendingOp::Delete) => return Ok(None),
            None => {}
        }
        match self.index.lookup(key)? {
            Some(entry) if entry.visible_at(t.snapshot) => Ok(Some(entry)),
            _ => Ok(self.retention.version_at(key, t.snapshot)),
        }
    }

    /// Take the write lock on `key` ahead of a write or delete. A lock
    /// taken here and never used is released with the transaction.
    pub async fn lock_key(&self, tx: TxId, key: &Key) -> StoreResult<()> {
        let handle = self.handle(tx)?;
        let mut t = handle.lock().await;
        self.ensure_active(&mut t).await?;
        self.locks.acquire(tx, key, self.config.lock_policy).await
    }

    /// Buffer a write to `key`, merged with its latest committed value
    pub async fn write(&self, tx: TxId, key: &Key, mutation: Mutation) -> StoreResult<()> {
        let handle = self.handle(tx)?;
        let mut t = handle.lock().await;
        self.ensure_active(&mut t).await?;
        self.locks.acquire(tx, key, self.config.lock_policy).await?;
        self.ensure_active(&mut t).await?;

        let base = match self.latest_entry(&t, key)? {
            Some(entry) => Some(self.files.read(key, &entry)?),
            None => None,
        };
        let record = mutation.apply(base)?;
        let entry = self.files.write(key, &record, tx)?;

        let journaled = self.ensure_begun(&mut t).and_then(|_| {
            self.journal.append(
                tx,
                &JournalOp::Write {
                    key: key.clone(),
                    entry: entry.clone(),
                },
            )
        });
        if let Err(e) = journaled {
            self.files.free(&entry.extent());
            return Err(e);
        }

        t.dirty_files.insert(entry.file_id);
        if let Some(PendingOp::Write(previous)) =
            t.pending.insert(key.clone(), PendingOp::Write(entry))
        {
            // Never visible outside this transaction
            self.files.free(&previous.extent());
        }
        tracing::debug!("{} wrote {}", tx, key);
        Ok(())
    }

    pub async fn delete(&self, tx: TxId, key: &Key) -> StoreResult<()> {
        let handle = self.handle(tx)?;
        let mut t = handle.lock().await;
        self.ensure_active(&mut t).await?;
        self.locks.acquire(tx, key, self.config.lock_policy).await?;
        self.ensure_active(&mut t).await?;

        if self.latest_entry(&t, key)?.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.ensure_begun(&mut t)?;
        self.journal
            .append(tx, &JournalOp::Delete { key: key.clone() })?;
        if let Some(PendingOp::Write(previous)) = t.pending.insert(key.clone(), PendingOp::Delete) {
            self.files.free(&previous.extent());
        }
        tracing::debug!("{} deleted {}", tx, key);
        Ok(())
    }

    /// Record as of the snapshot, or this transaction's own pending value
    pub async fn read(&self, tx: TxId, key: &Key) -> StoreResult<Record> {
        let handle = self.handle(tx)?;
        let mut t = handle.lock().await;
        if t.state == TxState::Active {
            self.ensure_active(&mut t).await?;
        }
        self.ensure_readable(&t)?;
        match self.visible_entry(&t, key)? {
            Some(entry) => self.files.read(key, &entry),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    pub async fn exists(&self, tx: TxId, key: &Key) -> StoreResult<bool> {
        let handle = self.handle(tx)?;
        let t = handle.lock().await;
        self.ensure_readable(&t)?;
        Ok(self.visible_entry(&t, key)?.is_some())
    }

    /// First phase of two-phase commit. Any failure (including a timeout)
    /// rolls the transaction back and votes to abort.
    pub async fn prepare(&self, tx: TxId) -> StoreResult<Vote> {
        let handle = match self.handle(tx) {
            Ok(handle) => handle,
            Err(StoreError::Timeout(_)) => return Ok(Vote::Abort),
            Err(e) => return Err(e),
        };
        let mut t = handle.lock().await;
        match t.state {
            TxState::Active => {}
            TxState::Prepared => return Ok(Vote::Commit),
            TxState::Preparing => {
                return Err(StoreError::InvalidState(format!("{} is already preparing", tx)))
            }
            TxState::Committed | TxState::Aborted => {
                return match self.gone(tx) {
                    StoreError::Timeout(_) => Ok(Vote::Abort),
                    e => Err(e),
                }
            }
        }
        if t.deadline.is_some_and(|d| Instant::now() >= d) {
            self.expire(&mut t).await;
            return Ok(Vote::Abort);
        }

        t.state = TxState::Preparing;
        let prepared = self.sync_files(&t).and_then(|_| {
            self.ensure_begun(&mut t)?;
            self.journal.append_durable(tx, &JournalOp::Prepare)
        });
        match prepared {
            Ok(lsn) => {
                t.state = TxState::Prepared;
                t.deadline = None;
                tracing::debug!("Prepared {} at LSN {}", tx, lsn);
                Ok(Vote::Commit)
            }
            Err(e) => {
                tracing::warn!("Prepare of {} failed, voting abort: {}", tx, e);
                self.abort_locked(&mut t).await;
                Ok(Vote::Abort)
            }
        }
    }

    fn sync_files(&self, t: &Transaction) -> StoreResult<()> {
        for file_id in &t.dirty_files {
            self.files.sync(*file_id)?;
        }
        Ok(())
    }

    /// Commit (one-phase from Active, or second phase from Prepared).
    /// Returns the commit LSN.
    pub async fn commit(&self, tx: TxId) -> StoreResult<Lsn> {
        let handle = self.handle(tx)?;
        let mut t = handle.lock().await;
        match t.state {
            TxState::Prepared => {}
            _ => self.ensure_active(&mut t).await?,
        }

        // Read-only: nothing journaled, nothing to publish
        if t.first_lsn.is_none() {
            t.state = TxState::Committed;
            self.finish(&mut t).await;
            self.committed.fetch_add(1, Ordering::Relaxed);
            return Ok(self.visible_lsn());
        }

        if let Err(e) = self.sync_files(&t) {
            tracing::warn!("Commit of {} failed before the marker: {}", tx, e);
            self.abort_locked(&mut t).await;
            return Err(e);
        }

        let outcome = {
            let _gate = self.commit_gate.lock().await;
            match self.journal.append_durable(tx, &JournalOp::Commit) {
                Ok(lsn) => {
                    let applied = self.apply(&t, lsn);
                    self.visible.store(lsn.0, Ordering::Release);
                    Ok((lsn, applied))
                }
                Err(e) => Err(e),
            }
        };

        let (lsn, applied) = match outcome {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!("Commit marker for {} not written: {}", tx, e);
                self.abort_locked(&mut t).await;
                return Err(e);
            }
        };

        t.state = TxState::Committed;
        t.pending.clear();
        self.finish(&mut t).await;
        self.committed.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = applied {
            // Durable in the journal; the next open replays it
            tracing::error!("{} committed at LSN {} but index apply failed: {}", tx, lsn, e);
            return Err(e);
        }
        tracing::debug!("Committed {} at LSN {}", tx, lsn);
        Ok(lsn)
    }

    /// Move pending changes into the index. Old versions are retained
    /// before the new entry becomes reachable.
    fn apply(&self, t: &Transaction, lsn: Lsn) -> StoreResult<()> {
        for (key, op) in &t.pending {
            if let Some(old) = self.index.lookup(key)? {
                self.retention.retain(key.clone(), old, lsn);
            }
            match op {
                PendingOp::Write(entry) => {
                    let mut entry = entry.clone();
                    entry.commit_lsn = lsn;
                    self.index.insert(key.clone(), entry)?;
                }
                PendingOp::Delete => {
                    self.index.delete(key)?;
                }
            }
        }
        Ok(())
    }

    pub async fn rollback(&self, tx: TxId) -> StoreResult<()> {
        let handle = self.handle(tx)?;
        let mut t = handle.lock().await;
        self.ensure_readable(&t)?;
        self.abort_locked(&mut t).await;
        tracing::debug!("Rolled back {}", tx);
        Ok(())
    }

    /// Operator rollback, including recovered in-doubt transactions
    pub async fn force_rollback(&self, tx: TxId) -> StoreResult<()> {
        let handle = self.handle(tx)?;
        let mut t = handle.lock().await;
        self.ensure_readable(&t)?;
        tracing::warn!(
            "Forcing rollback of {} ({}, {} pending changes)",
            tx,
            t.state,
            t.pending.len()
        );
        self.abort_locked(&mut t).await;
        Ok(())
    }

    async fn expire(&self, t: &mut Transaction) {
        tracing::warn!(
            "Rolling back {} after {:?} without commit",
            t.id,
            t.started.elapsed()
        );
        self.timed_out.lock().insert(t.id);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.abort_locked(t).await;
    }

    /// Discard pending work, journal the abort and release everything
    async fn abort_locked(&self, t: &mut Transaction) {
        for op in t.pending.values() {
            if let PendingOp::Write(entry) = op {
                self.files.free(&entry.extent());
            }
        }
        t.pending.clear();

        if t.first_lsn.is_some() {
            // A prepared transaction must not come back as in-doubt
            let journaled = if matches!(t.state, TxState::Prepared | TxState::Preparing) {
                self.journal.append_durable(t.id, &JournalOp::Abort)
            } else {
                self.journal.append(t.id, &JournalOp::Abort)
            };
            if let Err(e) = journaled {
                tracing::error!("Could not journal abort of {}: {}", t.id, e);
            }
        }

        t.state = TxState::Aborted;
        self.finish(t).await;
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Release locks, forget the transaction and collect dead versions
    async fn finish(&self, t: &mut Transaction) {
        if let Err(e) = self.locks.release_all(t.id).await {
            tracing::error!("Could not release locks of {}: {}", t.id, e);
        }

        {
            let mut registry = self.registry.lock();
            registry.live.remove(&t.id);
            registry.first_lsns.remove(&t.id);
            registry.in_doubt.remove(&t.id);
            if let Some(xid) = &t.xid {
                registry.xids.remove(xid);
            }
            if let Some(count) = registry.snapshots.get_mut(&t.snapshot) {
                *count -= 1;
                if *count == 0 {
                    registry.snapshots.remove(&t.snapshot);
                }
            }
        }
        self.collect_garbage();
    }

    /// Free retained versions no live snapshot can reach
    pub fn collect_garbage(&self) -> usize {
        let oldest = {
            let registry = self.registry.lock();
            let visible = self.visible_lsn();
            registry
                .snapshots
                .keys()
                .next()
                .map_or(visible, |oldest| (*oldest).min(visible))
        };
        let freed = self.retention.release(oldest);
        for extent in &freed {
            self.files.free(extent);
        }
        freed.len()
    }

    /// Reinstate prepared transactions found by recovery. Their keys are
    /// locked again until an operator or coordinator resolves them.
    pub async fn adopt_in_doubt(&self, recovered: Vec<RecoveredTx>) -> StoreResult<()> {
        for rtx in recovered {
            for key in rtx.pending.keys() {
                self.locks
                    .acquire(rtx.id, key, LockPolicy::NoWait)
                    .await
                    .map_err(|e| {
                        StoreError::Recovery(format!("relocking {} for {}: {}", key, rtx.id, e))
                    })?;
            }
            let dirty_files = rtx
                .pending
                .values()
                .filter_map(|op| match op {
                    PendingOp::Write(entry) => Some(entry.file_id),
                    PendingOp::Delete => None,
                })
                .collect();

            let mut registry = self.registry.lock();
            let snapshot = self.visible_lsn();
            *registry.snapshots.entry(snapshot).or_default() += 1;
            if let Some(xid) = &rtx.xid {
                registry.xids.insert(xid.clone(), rtx.id);
            }
            registry.first_lsns.insert(rtx.id, rtx.first_lsn);
            registry.in_doubt.insert(
                rtx.id,
                InDoubt {
                    tx: rtx.id,
                    xid: rtx.xid.clone(),
                    keys: rtx.pending.len(),
                },
            );
            tracing::warn!(
                "{} is in doubt ({} keys locked until resolved)",
                rtx.id,
                rtx.pending.len()
            );
            registry.live.insert(
                rtx.id,
                Arc::new(Mutex::new(Transaction {
                    id: rtx.id,
                    xid: rtx.xid,
                    state: TxState::Prepared,
                    snapshot,
                    started: Instant::now(),
                    started_at: Utc::now(),
                    deadline: None,
                    first_lsn: Some(rtx.first_lsn),
                    pending: rtx.pending,
                    dirty_files,
                })),
            );
        }
        Ok(())
    }

    /// Recovered prepared transactions still awaiting an outcome
    pub fn in_doubt(&self) -> Vec<InDoubt> {
        let mut found: Vec<InDoubt> = self.registry.lock().in_doubt.values().cloned().collect();
        found.sort_by_key(|d| d.tx);
        found
    }

    pub fn find_by_xid(&self, xid: &Xid) -> Option<TxId> {
        self.registry.lock().xids.get(xid).copied()
    }

    /// Snapshot of every live transaction
    pub fn transactions(&self) -> Vec<TransactionInfo> {
        let registry = self.registry.lock();
        let mut infos: Vec<TransactionInfo> = registry
            .live
            .iter()
            .map(|(id, handle)| {
                let in_doubt = registry.in_doubt.contains_key(id);
                match handle.try_lock() {
                    Ok(t) => TransactionInfo {
                        id: *id,
                        xid: t.xid.clone(),
                        state: Some(t.state),
                        snapshot: t.snapshot,
                        started_at: Some(t.started_at),
                        age_ms: t.started.elapsed().as_millis() as u64,
                        pending: t.pending.len(),
                        in_doubt,
                    },
                    Err(_) => TransactionInfo {
                        id: *id,
                        xid: None,
                        state: None,
                        snapshot: Lsn::ZERO,
                        started_at: None,
                        age_ms: 0,
                        pending: 0,
                        in_doubt,
                    },
                }
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Roll back every active transaction past its deadline
    pub async fn reap_expired(&self) -> usize {
        let handles: Vec<Arc<Mutex<Transaction>>> =
            self.registry.lock().live.values().cloned().collect();
        let now = Instant::now();
        let mut reaped = 0;
        for handle in handles {
            // Busy transactions check their own deadline
            let Ok(mut t) = handle.try_lock() else {
                continue;
            };
            if t.state == TxState::Active && t.deadline.is_some_and(|d| now >= d) {
                self.expire(&mut t).await;
                reaped += 1;
            }
        }
        reaped
    }

    /// Start the background timeout reaper. It stops when the manager is
    /// closed or dropped.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.closed.load(Ordering::Acquire) {
                    break;
                }
                let reaped = manager.reap_expired().await;
                if reaped > 0 {
                    tracing::info!("Reaper rolled back {} expired transactions", reaped);
                }
            }
        })
    }

    /// Index contents as of the last commit, taken between commits
    pub async fn index_image(&self) -> IndexImage {
        let _gate = self.commit_gate.lock().await;
        let lsn = self.visible_lsn();
        let horizon = self
            .oldest_live_lsn()
            .map_or(lsn.next(), |oldest| oldest.min(lsn.next()));
        IndexImage {
            lsn,
            entries: self.index.scan().collect(),
            horizon,
        }
    }

    /// Oldest Begin LSN among live transactions
    pub fn oldest_live_lsn(&self) -> Option<Lsn> {
        self.registry.lock().first_lsns.values().min().copied()
    }

    pub async fn lock_stats(&self) -> StoreResult<LockStats> {
        self.locks.stats().await
    }

    pub fn stats(&self) -> TxnStats {
        let registry = self.registry.lock();
        TxnStats {
            active: registry.live.len() - registry.in_doubt.len(),
            in_doubt: registry.in_doubt.len(),
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            timed_out: self.timeouts.load(Ordering::Relaxed),
            retained_versions: self.retention.len(),
            visible_lsn: self.visible_lsn(),
        }
    }

    /// Roll back active transactions and refuse new work. Prepared ones are
    /// left for recovery to report as in doubt.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<Arc<Mutex<Transaction>>> =
            self.registry.lock().live.values().cloned().collect();
        let mut rolled_back = 0;
        for handle in handles {
            let mut t = handle.lock().await;
            if matches!(t.state, TxState::Active | TxState::Preparing) {
                self.abort_locked(&mut t).await;
                rolled_back += 1;
            }
        }
        if rolled_back > 0 {
            tracing::info!("Rolled back {} open transactions on close", rolled_back);
        }
    }
}
