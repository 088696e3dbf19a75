//! Block allocation
//!
//! Each container file is carved into fixed-size blocks. A [`BlockAllocator`]
//! tracks which blocks are live with a bitset that is persisted next to the
//! container as `blocks.bitmap`. Block 0 always holds the container header and
//! is never handed out.
//!
//! The persisted bitmap is only advisory between checkpoints: recovery
//! rebuilds the exact picture from the recovered index with
//! [`BlockAllocator::reconcile`].
//!
//! [`SequenceGenerator`] hands out persistent monotonic ids (transaction ids)
//! in reserved chunks so that only one fsync is paid per chunk.

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::format::{checksum, Cursor, FORMAT_VERSION};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const BITMAP_MAGIC: [u8; 4] = *b"TSVB";
const SEQUENCE_MAGIC: [u8; 4] = *b"TSVS";

/// A run of contiguous blocks inside one container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub file_id: u64,
    pub block: u64,
    pub blocks: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.block + self.blocks
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.file_id == other.file_id && self.block < other.end() && other.block < self.end()
    }
}

/// Outcome of reconciling a bitmap against the blocks actually referenced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Marked used but referenced by nothing
    pub reclaimed: u64,
    /// Referenced but marked free
    pub restored: u64,
}

/// Free-block bitset for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocator {
    words: Vec<u64>,
    total_blocks: u64,
    used_blocks: u64,
    /// No free block exists below this index
    hint: u64,
    dirty: bool,
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAllocator {
    /// Fresh allocator with only the header block in use
    pub fn new() -> Self {
        let mut alloc = Self {
            words: Vec::new(),
            total_blocks: 0,
            used_blocks: 0,
            hint: 0,
            dirty: true,
        };
        alloc.grow_to(1);
        alloc.set_range(0, 1, true);
        alloc
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_used(&self, block: u64) -> bool {
        if block >= self.total_blocks {
            return false;
        }
        self.words[(block / 64) as usize] & (1 << (block % 64)) != 0
    }

    /// First-fit allocation of `blocks` contiguous blocks. The tracked region
    /// grows when no free run is long enough.
    pub fn allocate(&mut self, blocks: u64) -> StoreResult<u64> {
        if blocks == 0 {
            return Err(StoreError::InvalidArgument(
                "cannot allocate zero blocks".to_string(),
            ));
        }

        let mut run_start = self.hint;
        let mut run_len = 0;
        let mut block = self.hint;
        while block < self.total_blocks {
            // Skip whole used words
            if block % 64 == 0 && self.words[(block / 64) as usize] == u64::MAX {
                block += 64;
                run_len = 0;
                run_start = block;
                continue;
            }
            if self.is_used(block) {
                run_len = 0;
                run_start = block + 1;
            } else {
                run_len += 1;
                if run_len == blocks {
                    break;
                }
            }
            block += 1;
        }

        if run_len < blocks {
            // Extend the tail free run (possibly empty) past the end
            let start = if run_len > 0 { run_start } else { self.total_blocks };
            self.grow_to(start + blocks);
            run_start = start;
        }

        self.set_range(run_start, blocks, true);
        if run_start == self.hint {
            self.hint = run_start + blocks;
        }
        Ok(run_start)
    }

    /// Release blocks. Freeing a block that is not in use is an error, which
    /// catches double frees before they corrupt the bitmap.
    pub fn free(&mut self, block: u64, blocks: u64) -> StoreResult<()> {
        if block == 0 || block + blocks > self.total_blocks {
            return Err(StoreError::InvalidArgument(format!(
                "extent [{}, {}) outside allocatable range 1..{}",
                block,
                block + blocks,
                self.total_blocks
            )));
        }
        if let Some(b) = (block..block + blocks).find(|&b| !self.is_used(b)) {
            return Err(StoreError::InvalidState(format!(
                "double free of block {}",
                b
            )));
        }
        self.set_range(block, blocks, false);
        self.hint = self.hint.min(block);
        Ok(())
    }

    /// Mark blocks used regardless of their current state
    pub fn mark_used(&mut self, block: u64, blocks: u64) {
        self.grow_to(block + blocks);
        for b in block..block + blocks {
            if !self.is_used(b) {
                self.set_range(b, 1, true);
            }
        }
    }

    /// Make the bitmap match exactly the given referenced extents (block 0
    /// stays reserved).
    pub fn reconcile<'a>(&mut self, referenced: impl IntoIterator<Item = &'a Extent>) -> ReconcileReport {
        let mut fresh = BlockAllocator::new();
        fresh.grow_to(self.total_blocks);
        for extent in referenced {
            fresh.mark_used(extent.block, extent.blocks);
        }

        let mut report = ReconcileReport::default();
        for b in 0..fresh.total_blocks.max(self.total_blocks) {
            match (self.is_used(b), fresh.is_used(b)) {
                (true, false) => report.reclaimed += 1,
                (false, true) => report.restored += 1,
                _ => {}
            }
        }

        fresh.hint = 1;
        fresh.dirty = true;
        *self = fresh;
        report
    }

    fn grow_to(&mut self, total_blocks: u64) {
        if total_blocks <= self.total_blocks {
            return;
        }
        let words = total_blocks.div_ceil(64) as usize;
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
        self.total_blocks = total_blocks;
        self.dirty = true;
    }

    fn set_range(&mut self, start: u64, len: u64, used: bool) {
        for b in start..start + len {
            let word = &mut self.words[(b / 64) as usize];
            let mask = 1u64 << (b % 64);
            if used {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
        if used {
            self.used_blocks += len;
        } else {
            self.used_blocks -= len;
        }
        self.dirty = true;
    }

    /// Serialize: magic | version u8 | total u64 | used u64 | words | crc32
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 1 + 16 + self.words.len() * 8 + 4);
        buf.extend_from_slice(&BITMAP_MAGIC);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(&self.total_blocks.to_le_bytes());
        buf.extend_from_slice(&self.used_blocks.to_le_bytes());
        for word in &self.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        let crc = checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < 4 + 1 + 16 + 4 {
            return Err(StoreError::Corruption("bitmap file too short".to_string()));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = checksum(body);
        if stored != computed {
            return Err(StoreError::Corruption(format!(
                "Bitmap checksum mismatch: stored={}, computed={}",
                stored, computed
            )));
        }

        let mut cursor = Cursor::new(body);
        if cursor.take(4)? != BITMAP_MAGIC {
            return Err(StoreError::Corruption("Invalid bitmap magic".to_string()));
        }
        let version = cursor.u8()?;
        if version != FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "Unsupported bitmap version: {}",
                version
            )));
        }
        let total_blocks = cursor.u64()?;
        let used_blocks = cursor.u64()?;
        let mut words = Vec::with_capacity(cursor.remaining() / 8);
        while !cursor.is_empty() {
            words.push(cursor.u64()?);
        }
        if words.len() as u64 != total_blocks.div_ceil(64) {
            return Err(StoreError::Corruption(format!(
                "bitmap holds {} words for {} blocks",
                words.len(),
                total_blocks
            )));
        }
        let counted: u64 = words.iter().map(|w| w.count_ones() as u64).sum();
        if counted != used_blocks {
            return Err(StoreError::Corruption(format!(
                "bitmap claims {} used blocks but has {}",
                used_blocks, counted
            )));
        }

        let mut alloc = Self {
            words,
            total_blocks,
            used_blocks,
            hint: 0,
            dirty: false,
        };
        alloc.hint = (0..alloc.total_blocks)
            .find(|&b| !alloc.is_used(b))
            .unwrap_or(alloc.total_blocks);
        Ok(alloc)
    }

    /// Load from `path`, or start fresh if the file does not exist
    pub fn load(path: &Path) -> StoreResult<Self> {
        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist atomically (write temp file, fsync, rename)
    pub fn save(&mut self, path: &Path) -> StoreResult<()> {
        write_atomic(path, &self.to_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

/// Replace `path` with `bytes` via a synced temp file and rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    // The rename is durable only once the directory is synced
    File::open(parent)?.sync_all()?;
    Ok(())
}

/// Persistent monotonic id source
///
/// The file stores the upper bound of the current reservation. After a
/// restart numbering resumes from that bound, so ids are never reused even
/// if the process died halfway through a chunk.
pub struct SequenceGenerator {
    path: PathBuf,
    chunk: u64,
    state: Mutex<SequenceState>,
}

#[derive(Debug)]
struct SequenceState {
    next: u64,
    reserved: u64,
}

impl SequenceGenerator {
    pub fn open(path: impl AsRef<Path>, chunk: u64) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let reserved = match fs::read(&path) {
            Ok(bytes) => Self::decode(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            chunk: chunk.max(1),
            state: Mutex::new(SequenceState {
                next: reserved,
                reserved,
            }),
        })
    }

    fn decode(bytes: &[u8]) -> StoreResult<u64> {
        if bytes.len() != 16 || bytes[0..4] != SEQUENCE_MAGIC {
            return Err(StoreError::Corruption("Invalid sequence file".to_string()));
        }
        let value = u64::from_le_bytes(bytes[4..12].try_into().map_err(|_| {
            StoreError::Corruption("Invalid sequence file".to_string())
        })?);
        let stored = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        if stored != checksum(&bytes[0..12]) {
            return Err(StoreError::Corruption(
                "Sequence file checksum mismatch".to_string(),
            ));
        }
        Ok(value)
    }

    fn persist(&self, reserved: u64) -> StoreResult<()> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&SEQUENCE_MAGIC);
        buf.extend_from_slice(&reserved.to_le_bytes());
        let crc = checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        write_atomic(&self.path, &buf)
    }

    /// Next id, reserving a new chunk on disk when the current one runs out
    pub fn next_id(&self) -> StoreResult<u64> {
        let mut state = self.state.lock();
        if state.next >= state.reserved {
            let reserved = state.next + self.chunk;
            self.persist(reserved)?;
            state.reserved = reserved;
        }
        let id = state.next;
        state.next += 1;
        Ok(id)
    }

    /// Ensure every future id is greater than `seen`
    pub fn bump_past(&self, seen: u64) {
        let mut state = self.state.lock();
        if seen >= state.next {
            state.next = seen + 1;
        }
    }

    /// Id the next call would return
    pub fn peek(&self) -> u64 {
        self.state.lock().next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    #[test]
    fn test_header_block_reserved() {
        let mut alloc = BlockAllocator::new();
        assert!(alloc.is_used(0));
        assert_eq!(alloc.allocate(1).unwrap(), 1);
        assert_eq!(alloc.allocate(3).unwrap(), 2);
        assert!(alloc.free(0, 1).is_err());
    }

    #[test]
    fn test_first_fit_reuses_holes() {
        let mut alloc = BlockAllocator::new();
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(2).unwrap();
        let c = alloc.allocate(4).unwrap();
        assert_eq!((a, b, c), (1, 5, 7));

        alloc.free(a, 4).unwrap();
        // Too big for the hole: goes to the end
        assert_eq!(alloc.allocate(5).unwrap(), 11);
        // Fits the hole
        assert_eq!(alloc.allocate(3).unwrap(), 1);
        assert_eq!(alloc.allocate(1).unwrap(), 4);
        assert_eq!(alloc.used_blocks(), 1 + 4 + 2 + 4 + 5);
    }

    #[test]
    fn test_double_free_detected() {
        let mut alloc = BlockAllocator::new();
        let a = alloc.allocate(2).unwrap();
        alloc.free(a, 2).unwrap();
        assert!(matches!(alloc.free(a, 2), Err(StoreError::InvalidState(_))));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.bitmap");

        let mut alloc = BlockAllocator::new();
        for _ in 0..100 {
            alloc.allocate(3).unwrap();
        }
        alloc.free(10, 3).unwrap();
        alloc.save(&path).unwrap();
        assert!(!alloc.is_dirty());

        let loaded = BlockAllocator::load(&path).unwrap();
        assert_eq!(loaded.used_blocks(), alloc.used_blocks());
        assert_eq!(loaded.total_blocks(), alloc.total_blocks());
        assert!(!loaded.is_used(10));
        assert!(loaded.is_used(13));
    }

    #[test]
    fn test_damaged_bitmap_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.bitmap");
        let mut alloc = BlockAllocator::new();
        alloc.allocate(10).unwrap();
        alloc.save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[22] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            BlockAllocator::load(&path),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn test_reconcile_reclaims_and_restores() {
        let mut alloc = BlockAllocator::new();
        let leaked = alloc.allocate(5).unwrap();
        let kept = alloc.allocate(2).unwrap();
        let referenced = vec![
            Extent {
                file_id: 0,
                block: kept,
                blocks: 2,
            },
            // Referenced by the index but never recorded in the bitmap
            Extent {
                file_id: 0,
                block: 20,
                blocks: 1,
            },
        ];

        let report = alloc.reconcile(&referenced);
        assert_eq!(report.reclaimed, 5);
        assert_eq!(report.restored, 1);
        assert!(!alloc.is_used(leaked));
        assert!(alloc.is_used(kept) && alloc.is_used(20));
        assert_eq!(alloc.allocate(5).unwrap(), leaked);
    }

    /// Allocate, write, delete and reallocate many times against a model
    #[test]
    fn test_allocation_churn_never_double_allocates() {
        let mut rng = StdRng::seed_from_u64(0xb10c);
        let mut alloc = BlockAllocator::new();
        let mut live: Vec<(u64, u64)> = Vec::new();

        for _ in 0..10_000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let blocks = rng.gen_range(1..8);
                let start = alloc.allocate(blocks).unwrap();
                for &(s, n) in &live {
                    assert!(
                        start + blocks <= s || s + n <= start,
                        "[{}, {}) overlaps live [{}, {})",
                        start,
                        start + blocks,
                        s,
                        s + n
                    );
                }
                live.push((start, blocks));
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                alloc.free(victim.0, victim.1).unwrap();
            }

            let referenced: u64 = live.iter().map(|&(_, n)| n).sum();
            assert_eq!(alloc.used_blocks(), referenced + 1);
        }

        for &(s, n) in &live {
            assert!((s..s + n).all(|b| alloc.is_used(b)));
        }
    }

    #[test]
    fn test_write_atomic_replaces_and_syncs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.bitmap");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());

        // A missing directory is an error, not a silent skip
        let orphan = dir.path().join("missing").join("blocks.bitmap");
        assert!(matches!(write_atomic(&orphan, b"x"), Err(StoreError::Io(_))));
    }

    #[test]
    fn test_sequence_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sequence");

        let first: Vec<u64> = {
            let seq = SequenceGenerator::open(&path, 10).unwrap();
            (0..15).map(|_| seq.next_id().unwrap()).collect()
        };
        assert_eq!(first, (1..16).collect::<Vec<_>>());

        // Restart skips the rest of the reserved chunk
        let seq = SequenceGenerator::open(&path, 10).unwrap();
        let next = seq.next_id().unwrap();
        assert_eq!(next, 21);

        seq.bump_past(100);
        assert_eq!(seq.next_id().unwrap(), 101);
    }
}
