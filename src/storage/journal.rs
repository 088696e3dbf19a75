//! Write-ahead journal
//!
//! Every mutation is journaled before it can become visible. Records carry a
//! monotonic LSN and live in segment files `journal/{first_lsn:020}.log`.
//!
//! Format per record:
//! - lsn: u64
//! - tx: u64
//! - kind: u8
//! - payload_len: u32
//! - crc: u32 (CRC32 of the 21 header bytes before it + payload)
//! - payload: [u8; payload_len] (bincode `JournalOp`)
//!
//! On open, a damaged record at the tail of the last segment is treated as a
//! torn write and truncated away. Damage anywhere else, or damage followed by
//! further valid records, refuses the open.

use crate::index::IndexEntry;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::{Key, Lsn, TxId, Xid};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 8 + 8 + 1 + 4 + 4;
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Sync strategy for non-durable appends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalSyncMode {
    /// Fsync after every write (safest, slowest)
    EveryWrite,
    /// Fsync once enough bytes accumulate, and on the background flush tick
    #[default]
    Batched,
    /// Only durable appends fsync
    None,
}

/// Journal tuning
#[derive(Debug, Clone)]
pub struct JournalOptions {
    pub sync_mode: JournalSyncMode,
    /// Rotate to a new segment once the current one exceeds this size
    pub segment_size: u64,
    /// Batched mode syncs after this many unsynced bytes
    pub batch_bytes: usize,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            sync_mode: JournalSyncMode::Batched,
            segment_size: 16 * 1024 * 1024,
            batch_bytes: 64 * 1024,
        }
    }
}

/// Journaled operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// First mutation of a transaction
    Begin { xid: Option<Xid> },
    /// Key now points at a freshly written record (commit LSN filled in on apply)
    Write { key: Key, entry: IndexEntry },
    Delete { key: Key },
    Prepare,
    Commit,
    Abort,
    /// Index checkpoint covering every commit up to `lsn`
    Checkpoint { lsn: Lsn },
}

impl JournalOp {
    pub fn kind(&self) -> u8 {
        match self {
            JournalOp::Begin { .. } => 1,
            JournalOp::Write { .. } => 2,
            JournalOp::Delete { .. } => 3,
            JournalOp::Prepare => 4,
            JournalOp::Commit => 5,
            JournalOp::Abort => 6,
            JournalOp::Checkpoint { .. } => 7,
        }
    }
}

/// One decoded journal record
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub lsn: Lsn,
    pub tx: TxId,
    pub op: JournalOp,
}

fn encode_record(lsn: Lsn, tx: TxId, op: &JournalOp) -> StoreResult<Vec<u8>> {
    let payload = bincode::serialize(op)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&lsn.0.to_le_bytes());
    buf.extend_from_slice(&tx.0.to_le_bytes());
    buf.push(op.kind());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    hasher.update(&payload);
    let crc = hasher.finalize();

    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Result of parsing at one offset of a segment
enum Frame {
    Record(JournalRecord, usize),
    End,
    Damaged(String),
}

fn parse_frame(buf: &[u8], offset: usize) -> Frame {
    let rest = &buf[offset.min(buf.len())..];
    if rest.is_empty() {
        return Frame::End;
    }
    if rest.len() < HEADER_LEN {
        return Frame::Damaged(format!("{} byte partial header", rest.len()));
    }

    let u64_at = |i: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&rest[i..i + 8]);
        u64::from_le_bytes(b)
    };
    let lsn = Lsn(u64_at(0));
    let tx = TxId(u64_at(8));
    let kind = rest[16];
    let len = u32::from_le_bytes([rest[17], rest[18], rest[19], rest[20]]) as usize;
    let stored_crc = u32::from_le_bytes([rest[21], rest[22], rest[23], rest[24]]);

    if len > MAX_PAYLOAD {
        return Frame::Damaged(format!("payload length too large: {}", len));
    }
    if rest.len() < HEADER_LEN + len {
        return Frame::Damaged(format!(
            "record {} truncated: {} of {} payload bytes",
            lsn,
            rest.len() - HEADER_LEN,
            len
        ));
    }
    let payload = &rest[HEADER_LEN..HEADER_LEN + len];

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&rest[..21]);
    hasher.update(payload);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Frame::Damaged(format!(
            "CRC mismatch: stored={}, computed={}",
            stored_crc, computed_crc
        ));
    }

    let op: JournalOp = match bincode::deserialize(payload) {
        Ok(op) => op,
        Err(e) => return Frame::Damaged(format!("undecodable payload: {}", e)),
    };
    if op.kind() != kind {
        return Frame::Damaged(format!(
            "kind byte {} does not match payload kind {}",
            kind,
            op.kind()
        ));
    }
    Frame::Record(JournalRecord { lsn, tx, op }, HEADER_LEN + len)
}

fn segment_path(dir: &Path, first_lsn: Lsn) -> PathBuf {
    dir.join(format!("{:020}.log", first_lsn.0))
}

fn list_segments(dir: &Path) -> StoreResult<Vec<Lsn>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        if let Some(lsn) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            segments.push(Lsn(lsn));
        }
    }
    segments.sort();
    Ok(segments)
}

/// Summary of the scan performed on open
#[derive(Debug, Clone, Default)]
pub struct JournalScan {
    pub records: u64,
    pub segments: usize,
    pub first_lsn: Option<Lsn>,
    pub last_lsn: Option<Lsn>,
    /// Bytes cut from a torn tail
    pub truncated_bytes: u64,
}

struct JournalWriter {
    writer: BufWriter<File>,
    segments: Vec<Lsn>,
    segment_bytes: u64,
    next_lsn: Lsn,
    bytes_since_sync: usize,
    appended: u64,
    syncs: u64,
}

/// Segmented write-ahead journal
pub struct Journal {
    dir: PathBuf,
    options: JournalOptions,
    inner: Mutex<JournalWriter>,
}

impl Journal {
    /// Open (or create) the journal in `dir`, validating every segment
    pub fn open(dir: impl AsRef<Path>, options: JournalOptions) -> StoreResult<(Self, JournalScan)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let mut scan = JournalScan {
            segments: segments.len(),
            ..Default::default()
        };

        let mut prev: Option<Lsn> = None;
        for (i, first) in segments.iter().enumerate() {
            let path = segment_path(&dir, *first);
            let buf = fs::read(&path)?;
            let is_last = i + 1 == segments.len();
            let mut offset = 0;

            loop {
                match parse_frame(&buf, offset) {
                    Frame::Record(record, len) => {
                        let expected = match prev {
                            Some(p) => p.next(),
                            None => *first,
                        };
                        if record.lsn != expected || (offset == 0 && record.lsn != *first) {
                            return Err(StoreError::Corruption(format!(
                                "{:?}: LSN {} where {} was expected",
                                path, record.lsn, expected
                            )));
                        }
                        prev = Some(record.lsn);
                        scan.first_lsn.get_or_insert(record.lsn);
                        scan.records += 1;
                        offset += len;
                    }
                    Frame::End => break,
                    Frame::Damaged(reason) => {
                        if !is_last {
                            return Err(StoreError::Corruption(format!(
                                "{:?} damaged at offset {} before the last segment: {}",
                                path, offset, reason
                            )));
                        }
                        let last_good = prev.unwrap_or(Lsn(first.0.saturating_sub(1)));
                        if let Some(lsn) = valid_record_after(&buf, offset, last_good) {
                            return Err(StoreError::Corruption(format!(
                                "{:?} damaged at offset {} but record {} follows: {}",
                                path, offset, lsn, reason
                            )));
                        }
                        tracing::warn!(
                            "Truncating torn journal tail in {:?} at offset {} ({} bytes): {}",
                            path,
                            offset,
                            buf.len() - offset,
                            reason
                        );
                        let file = OpenOptions::new().write(true).open(&path)?;
                        file.set_len(offset as u64)?;
                        file.sync_all()?;
                        scan.truncated_bytes = (buf.len() - offset) as u64;
                        break;
                    }
                }
            }
        }
        scan.last_lsn = prev;

        let next_lsn = match (prev, segments.last()) {
            (Some(last), _) => last.next(),
            (None, Some(first)) => *first,
            (None, None) => Lsn(1),
        };

        let mut segments = segments;
        let active = match segments.last() {
            Some(first) => *first,
            None => {
                segments.push(next_lsn);
                next_lsn
            }
        };
        let active_path = segment_path(&dir, active);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let segment_bytes = file.metadata()?.len();

        tracing::info!(
            "Journal opened: {} records in {} segments, next LSN {}",
            scan.records,
            segments.len(),
            next_lsn
        );

        Ok((
            Self {
                dir,
                options,
                inner: Mutex::new(JournalWriter {
                    writer: BufWriter::new(file),
                    segments,
                    segment_bytes,
                    next_lsn,
                    bytes_since_sync: 0,
                    appended: 0,
                    syncs: 0,
                }),
            },
            scan,
        ))
    }

    /// Append a record; durable according to the sync mode
    pub fn append(&self, tx: TxId, op: &JournalOp) -> StoreResult<Lsn> {
        self.append_inner(tx, op, false)
    }

    /// Append a record and fsync before returning
    pub fn append_durable(&self, tx: TxId, op: &JournalOp) -> StoreResult<Lsn> {
        self.append_inner(tx, op, true)
    }

    fn append_inner(&self, tx: TxId, op: &JournalOp, durable: bool) -> StoreResult<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        let bytes = encode_record(lsn, tx, op)?;

        inner.writer.write_all(&bytes)?;
        inner.next_lsn = lsn.next();
        inner.segment_bytes += bytes.len() as u64;
        inner.bytes_since_sync += bytes.len();
        inner.appended += 1;

        if durable {
            Self::sync_locked(&mut inner)?;
        } else {
            self.maybe_sync(&mut inner)?;
        }

        if inner.segment_bytes >= self.options.segment_size {
            self.rotate_locked(&mut inner)?;
        }
        Ok(lsn)
    }

    fn maybe_sync(&self, inner: &mut JournalWriter) -> StoreResult<()> {
        match self.options.sync_mode {
            JournalSyncMode::EveryWrite => Self::sync_locked(inner)?,
            JournalSyncMode::Batched => {
                if inner.bytes_since_sync >= self.options.batch_bytes {
                    Self::sync_locked(inner)?;
                }
            }
            JournalSyncMode::None => {
                inner.writer.flush()?;
            }
        }
        Ok(())
    }

    fn sync_locked(inner: &mut JournalWriter) -> StoreResult<()> {
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        inner.bytes_since_sync = 0;
        inner.syncs += 1;
        Ok(())
    }

    /// Force everything appended so far to stable storage
    pub fn sync(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.bytes_since_sync == 0 {
            return Ok(());
        }
        Self::sync_locked(&mut inner)
    }

    fn rotate_locked(&self, inner: &mut JournalWriter) -> StoreResult<()> {
        Self::sync_locked(inner)?;
        let first = inner.next_lsn;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, first))?;
        inner.writer = BufWriter::new(file);
        inner.segments.push(first);
        inner.segment_bytes = 0;
        tracing::debug!("Journal rotated to segment {}", first);
        Ok(())
    }

    /// Start a new segment (if the current one holds anything)
    pub fn rotate(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.segment_bytes == 0 {
            return Ok(());
        }
        self.rotate_locked(&mut inner)
    }

    /// Delete whole segments whose records all precede `horizon`. The active
    /// segment is never removed.
    pub fn truncate_before(&self, horizon: Lsn) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        while inner.segments.len() > 1 && inner.segments[1] <= horizon {
            let first = inner.segments.remove(0);
            fs::remove_file(segment_path(&self.dir, first))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(
                "Removed {} journal segments below LSN {}",
                removed,
                horizon
            );
        }
        Ok(removed)
    }

    /// Lazily replay every record with `lsn >= from`
    pub fn read_from(&self, from: Lsn) -> StoreResult<JournalIterator> {
        let segments = {
            let mut inner = self.inner.lock();
            inner.writer.flush()?;
            inner.segments.clone()
        };
        // Skip segments that end before `from`
        let start = segments
            .iter()
            .rposition(|first| *first <= from)
            .unwrap_or(0);
        Ok(JournalIterator {
            dir: self.dir.clone(),
            segments: segments[start..].to_vec(),
            current: None,
            from,
        })
    }

    /// LSN the next append will receive
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn stats(&self) -> JournalStats {
        let inner = self.inner.lock();
        JournalStats {
            next_lsn: inner.next_lsn,
            segments: inner.segments.len(),
            oldest_segment: inner.segments.first().copied(),
            appended: inner.appended,
            syncs: inner.syncs,
            unsynced_bytes: inner.bytes_since_sync,
        }
    }
}

/// Scan for a valid record beyond a damaged spot
fn valid_record_after(buf: &[u8], damaged_at: usize, last_good: Lsn) -> Option<Lsn> {
    (damaged_at + 1..buf.len().saturating_sub(HEADER_LEN - 1)).find_map(|offset| {
        match parse_frame(buf, offset) {
            Frame::Record(record, _) if record.lsn > last_good => Some(record.lsn),
            _ => None,
        }
    })
}

/// Journal counters
#[derive(Debug, Clone)]
pub struct JournalStats {
    pub next_lsn: Lsn,
    pub segments: usize,
    pub oldest_segment: Option<Lsn>,
    pub appended: u64,
    pub syncs: u64,
    pub unsynced_bytes: usize,
}

/// Streaming replay over journal segments
pub struct JournalIterator {
    dir: PathBuf,
    segments: Vec<Lsn>,
    current: Option<(Vec<u8>, usize, PathBuf)>,
    from: Lsn,
}

impl Iterator for JournalIterator {
    type Item = StoreResult<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                if self.segments.is_empty() {
                    return None;
                }
                let first = self.segments.remove(0);
                let path = segment_path(&self.dir, first);
                match fs::read(&path) {
                    Ok(buf) => self.current = Some((buf, 0, path)),
                    Err(e) => {
                        self.segments.clear();
                        return Some(Err(e.into()));
                    }
                }
            }

            let (buf, offset, path) = self.current.as_mut()?;
            match parse_frame(buf, *offset) {
                Frame::Record(record, len) => {
                    *offset += len;
                    if record.lsn >= self.from {
                        return Some(Ok(record));
                    }
                }
                Frame::End => self.current = None,
                Frame::Damaged(reason) => {
                    let err = StoreError::Corruption(format!(
                        "{:?} damaged at offset {}: {}",
                        path, offset, reason
                    ));
                    self.current = None;
                    self.segments.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}
