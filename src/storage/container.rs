//! Container files
//!
//! A container is a block-addressed payload file (`blocks.dat`) living in one
//! directory-hash bucket, with its allocation bitmap (`blocks.bitmap`) beside
//! it. The bucket number doubles as the container's file id.
//!
//! Layout:
//! ```text
//! block 0: header
//!   magic: [u8; 4] = "TSVC"
//!   version: u8
//!   file_id: u64
//!   block_size: u32
//!   checksum: u32 (CRC32 of the preceding bytes)
//!   zero padding to BLOCK_SIZE
//! block 1..: record data, addressed by Extent
//! ```
//!
//! Allocators for every known container stay in memory; file handles are
//! kept in a small LRU cache bounded by `max_open_files`.

use crate::storage::allocator::{BlockAllocator, Extent, ReconcileReport};
use crate::storage::dirhash::DirHash;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::format::{checksum, BLOCK_SIZE, FORMAT_VERSION};
use crate::storage::types::Key;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CONTAINER_MAGIC: [u8; 4] = *b"TSVC";
const HEADER_LEN: usize = 4 + 1 + 8 + 4 + 4;
const DATA_FILE: &str = "blocks.dat";
const BITMAP_FILE: &str = "blocks.bitmap";

/// Container header stored in block 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub file_id: u64,
    pub block_size: u32,
}

impl ContainerHeader {
    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&CONTAINER_MAGIC);
        buf[4] = FORMAT_VERSION;
        buf[5..13].copy_from_slice(&self.file_id.to_le_bytes());
        buf[13..17].copy_from_slice(&self.block_size.to_le_bytes());
        let crc = checksum(&buf[0..17]);
        buf[17..HEADER_LEN].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> StoreResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(StoreError::Corruption("Container header truncated".to_string()));
        }
        let stored = u32::from_le_bytes([buf[17], buf[18], buf[19], buf[20]]);
        let computed = checksum(&buf[0..17]);
        if stored != computed {
            return Err(StoreError::Corruption(format!(
                "Container header checksum mismatch: stored={}, computed={}",
                stored, computed
            )));
        }
        if buf[0..4] != CONTAINER_MAGIC {
            return Err(StoreError::Corruption(format!(
                "Invalid container magic: {:?}",
                &buf[0..4]
            )));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "Unsupported container version: {}",
                buf[4]
            )));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[5..13]);
        let header = Self {
            file_id: u64::from_le_bytes(id),
            block_size: u32::from_le_bytes([buf[13], buf[14], buf[15], buf[16]]),
        };
        if header.block_size as usize != BLOCK_SIZE {
            return Err(StoreError::Corruption(format!(
                "Container block size {} does not match {}",
                header.block_size, BLOCK_SIZE
            )));
        }
        Ok(header)
    }
}

/// Number of blocks needed for `len` bytes (at least one)
pub fn blocks_for(len: usize) -> u64 {
    (len.max(1) as u64).div_ceil(BLOCK_SIZE as u64)
}

struct CachedHandle {
    file: Arc<Mutex<File>>,
    last_used: u64,
}

/// Bounded LRU cache of open container files
struct HandleCache {
    capacity: usize,
    tick: u64,
    handles: HashMap<u64, CachedHandle>,
    evictions: u64,
}

impl HandleCache {
    fn get(&mut self, file_id: u64) -> Option<Arc<Mutex<File>>> {
        self.tick += 1;
        let tick = self.tick;
        self.handles.get_mut(&file_id).map(|h| {
            h.last_used = tick;
            h.file.clone()
        })
    }

    fn insert(&mut self, file_id: u64, file: Arc<Mutex<File>>) {
        while self.handles.len() >= self.capacity {
            let victim = self
                .handles
                .iter()
                .min_by_key(|(_, h)| h.last_used)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    // Dropping the last Arc closes the file
                    self.handles.remove(&id);
                    self.evictions += 1;
                }
                None => break,
            }
        }
        self.tick += 1;
        self.handles.insert(
            file_id,
            CachedHandle {
                file,
                last_used: self.tick,
            },
        );
    }
}

/// Container statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub containers: usize,
    pub open_files: usize,
    pub evictions: u64,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

/// All containers of a store
pub struct ContainerSet {
    dirhash: DirHash,
    handles: Mutex<HandleCache>,
    allocators: Mutex<HashMap<u64, Arc<Mutex<BlockAllocator>>>>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl ContainerSet {
    pub fn new(dirhash: DirHash, max_open_files: usize) -> Self {
        Self {
            dirhash,
            handles: Mutex::new(HandleCache {
                capacity: max_open_files.max(1),
                tick: 0,
                handles: HashMap::new(),
                evictions: 0,
            }),
            allocators: Mutex::new(HashMap::new()),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn dirhash(&self) -> &DirHash {
        &self.dirhash
    }

    /// Container that stores a key's records
    pub fn file_id_for(&self, key: &Key) -> u64 {
        self.dirhash.bucket(key)
    }

    fn container_dir(&self, file_id: u64) -> PathBuf {
        self.dirhash.bucket_path(file_id)
    }

    fn bitmap_path(&self, file_id: u64) -> PathBuf {
        self.container_dir(file_id).join(BITMAP_FILE)
    }

    fn allocator(&self, file_id: u64) -> StoreResult<Arc<Mutex<BlockAllocator>>> {
        let mut allocators = self.allocators.lock();
        if let Some(alloc) = allocators.get(&file_id) {
            return Ok(alloc.clone());
        }
        let alloc = match BlockAllocator::load(&self.bitmap_path(file_id)) {
            Ok(alloc) => alloc,
            Err(StoreError::Corruption(msg)) => {
                // Rebuilt from the index during recovery
                tracing::warn!(
                    "Discarding unreadable bitmap for container {}: {}",
                    file_id,
                    msg
                );
                BlockAllocator::new()
            }
            Err(e) => return Err(e),
        };
        let alloc = Arc::new(Mutex::new(alloc));
        allocators.insert(file_id, alloc.clone());
        Ok(alloc)
    }

    fn handle(&self, file_id: u64) -> StoreResult<Arc<Mutex<File>>> {
        if let Some(file) = self.handles.lock().get(file_id) {
            return Ok(file);
        }
        let file = Arc::new(Mutex::new(self.open_container(file_id)?));
        self.handles.lock().insert(file_id, file.clone());
        Ok(file)
    }

    fn open_container(&self, file_id: u64) -> StoreResult<File> {
        let dir = self.container_dir(file_id);
        let path = dir.join(DATA_FILE);
        if !path.exists() {
            std::fs::create_dir_all(&dir)?;
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            let header = ContainerHeader {
                file_id,
                block_size: BLOCK_SIZE as u32,
            };
            file.write_all(&header.to_bytes())?;
            file.sync_all()?;
            tracing::debug!("Created container {} at {:?}", file_id, path);
            return Ok(file);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)?;
        let header = ContainerHeader::from_bytes(&buf)?;
        if header.file_id != file_id {
            return Err(StoreError::Corruption(format!(
                "{:?} claims file id {}, expected {}",
                path, header.file_id, file_id
            )));
        }
        Ok(file)
    }

    /// Reserve space for `len` bytes in a container
    pub fn allocate(&self, file_id: u64, len: usize) -> StoreResult<Extent> {
        let alloc = self.allocator(file_id)?;
        let blocks = blocks_for(len);
        let block = alloc.lock().allocate(blocks)?;
        Ok(Extent {
            file_id,
            block,
            blocks,
        })
    }

    /// Release an extent back to its container's allocator
    pub fn free(&self, extent: &Extent) -> StoreResult<()> {
        self.allocator(extent.file_id)?
            .lock()
            .free(extent.block, extent.blocks)
    }

    pub fn write(&self, extent: &Extent, bytes: &[u8]) -> StoreResult<()> {
        if blocks_for(bytes.len()) > extent.blocks {
            return Err(StoreError::InvalidArgument(format!(
                "{} bytes do not fit in {} blocks",
                bytes.len(),
                extent.blocks
            )));
        }
        let handle = self.handle(extent.file_id)?;
        let mut file = handle.lock();
        file.seek(SeekFrom::Start(extent.block * BLOCK_SIZE as u64))?;
        file.write_all(bytes)?;
        self.bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Read the first `len` bytes of an extent
    pub fn read(&self, extent: &Extent, len: usize) -> StoreResult<Vec<u8>> {
        let handle = self.handle(extent.file_id)?;
        let mut buf = vec![0u8; len];
        {
            let mut file = handle.lock();
            file.seek(SeekFrom::Start(extent.block * BLOCK_SIZE as u64))?;
            file.read_exact(&mut buf).map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => StoreError::Corruption(format!(
                    "container {} ends inside extent at block {}",
                    extent.file_id, extent.block
                )),
                _ => StoreError::Io(e),
            })?;
        }
        self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
        Ok(buf)
    }

    /// Flush container data to stable storage
    pub fn sync(&self, file_id: u64) -> StoreResult<()> {
        let handle = self.handle(file_id)?;
        let file = handle.lock();
        file.sync_data()?;
        Ok(())
    }

    /// Persist every dirty bitmap
    pub fn flush_bitmaps(&self) -> StoreResult<usize> {
        let allocators: Vec<(u64, Arc<Mutex<BlockAllocator>>)> = self
            .allocators
            .lock()
            .iter()
            .map(|(id, a)| (*id, a.clone()))
            .collect();
        let mut flushed = 0;
        for (file_id, alloc) in allocators {
            let mut alloc = alloc.lock();
            if alloc.is_dirty() {
                std::fs::create_dir_all(self.container_dir(file_id))?;
                alloc.save(&self.bitmap_path(file_id))?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// File ids of every container present on disk
    pub fn discover(&self) -> StoreResult<Vec<u64>> {
        let mut found = Vec::new();
        let mut stack = vec![self.dirhash.root().to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    stack.push(path);
                } else if path.file_name().and_then(|n| n.to_str()) == Some(DATA_FILE) {
                    if let Some(id) = self.dirhash.bucket_of_path(&dir) {
                        found.push(id);
                    }
                }
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    /// Make every container's bitmap match exactly the referenced extents
    pub fn reconcile(&self, referenced: &HashMap<u64, Vec<Extent>>) -> StoreResult<ReconcileReport> {
        let mut ids = self.discover()?;
        ids.extend(referenced.keys().copied());
        ids.sort_unstable();
        ids.dedup();

        let mut total = ReconcileReport::default();
        for file_id in ids {
            let alloc = self.allocator(file_id)?;
            let extents = referenced.get(&file_id).map(Vec::as_slice).unwrap_or(&[]);
            let report = alloc.lock().reconcile(extents);
            if report.reclaimed > 0 || report.restored > 0 {
                tracing::warn!(
                    "Container {}: reclaimed {} leaked blocks, restored {} referenced blocks",
                    file_id,
                    report.reclaimed,
                    report.restored
                );
            }
            total.reclaimed += report.reclaimed;
            total.restored += report.restored;
        }
        Ok(total)
    }

    pub fn stats(&self) -> ContainerStats {
        let (open_files, evictions) = {
            let handles = self.handles.lock();
            (handles.handles.len(), handles.evictions)
        };
        let allocators = self.allocators.lock();
        let mut stats = ContainerStats {
            containers: allocators.len(),
            open_files,
            evictions,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            ..Default::default()
        };
        for alloc in allocators.values() {
            let alloc = alloc.lock();
            stats.total_blocks += alloc.total_blocks();
            stats.used_blocks += alloc.used_blocks();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn containers(root: &Path, max_open: usize) -> ContainerSet {
        let hash = DirHash::open(root, 10_000, 100, 16).unwrap();
        ContainerSet::new(hash, max_open)
    }

    #[test]
    fn test_write_read_extent() {
        let dir = tempdir().unwrap();
        let set = containers(dir.path(), 4);
        let key = Key::new("/a/b").unwrap();
        let file_id = set.file_id_for(&key);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let extent = set.allocate(file_id, payload.len()).unwrap();
        assert_eq!(extent.blocks, 3);
        assert_eq!(extent.block, 1);
        set.write(&extent, &payload).unwrap();
        set.sync(file_id).unwrap();

        assert_eq!(set.read(&extent, payload.len()).unwrap(), payload);
    }

    #[test]
    fn test_free_returns_blocks_to_their_container() {
        let dir = tempdir().unwrap();
        let set = containers(dir.path(), 4);
        let file_id = set.file_id_for(&Key::new("/freed").unwrap());

        let extent = set.allocate(file_id, 10_000).unwrap();
        let used = set.stats().used_blocks;
        set.free(&extent).unwrap();
        assert_eq!(set.stats().used_blocks, used - extent.blocks);
        assert!(matches!(set.free(&extent), Err(StoreError::InvalidState(_))));

        // The freed run is handed out again
        assert_eq!(set.allocate(file_id, 10_000).unwrap(), extent);
    }

    #[test]
    fn test_header_written_and_verified() {
        let dir = tempdir().unwrap();
        let set = containers(dir.path(), 4);
        let extent = set.allocate(5, 10).unwrap();
        set.write(&extent, b"0123456789").unwrap();

        let path = set.container_dir(5).join(DATA_FILE);
        let bytes = std::fs::read(&path).unwrap();
        let header = ContainerHeader::from_bytes(&bytes[..BLOCK_SIZE]).unwrap();
        assert_eq!(header.file_id, 5);

        // A fresh set reopens and validates the header
        let reopened = containers(dir.path(), 4);
        assert_eq!(reopened.read(&extent, 10).unwrap(), b"0123456789");
        assert_eq!(reopened.discover().unwrap(), vec![5]);
    }

    #[test]
    fn test_open_file_cache_is_bounded() {
        let dir = tempdir().unwrap();
        let set = containers(dir.path(), 3);
        let mut extents = Vec::new();
        for file_id in 0..10 {
            let extent = set.allocate(file_id, 4).unwrap();
            set.write(&extent, &(file_id as u32).to_le_bytes()).unwrap();
            extents.push(extent);
            assert!(set.stats().open_files <= 3);
        }
        assert!(set.stats().evictions >= 7);

        // Evicted containers reopen transparently
        for (file_id, extent) in extents.iter().enumerate() {
            assert_eq!(
                set.read(extent, 4).unwrap(),
                (file_id as u32).to_le_bytes().to_vec()
            );
        }
    }

    #[test]
    fn test_bitmaps_flush_and_reconcile() {
        let dir = tempdir().unwrap();
        let set = containers(dir.path(), 4);
        let kept = set.allocate(2, 100).unwrap();
        set.write(&kept, &[1u8; 100]).unwrap();
        let leaked = set.allocate(2, 5000).unwrap();
        set.write(&leaked, &[2u8; 5000]).unwrap();
        assert_eq!(set.flush_bitmaps().unwrap(), 1);

        let reopened = containers(dir.path(), 4);
        let mut referenced = HashMap::new();
        referenced.insert(2, vec![kept]);
        let report = reopened.reconcile(&referenced).unwrap();
        assert_eq!(report.reclaimed, leaked.blocks);
        assert_eq!(report.restored, 0);
        assert_eq!(reopened.stats().used_blocks, 1 + kept.blocks);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let dir = tempdir().unwrap();
        let set = containers(dir.path(), 4);
        let extent = set.allocate(0, 10).unwrap();
        assert!(matches!(
            set.write(&extent, &vec![0u8; BLOCK_SIZE + 1]),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
