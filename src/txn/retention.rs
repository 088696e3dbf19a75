//! Superseded version retention
//!
//! When a commit replaces or deletes an index entry, the old entry stays
//! readable for snapshots taken before that commit. Each retained version is
//! valid for snapshots in `[from, to)`. Once the oldest live snapshot is at or
//! past `to` nobody can see the version and its blocks may be freed.

use crate::index::IndexEntry;
use crate::storage::allocator::Extent;
use crate::storage::types::{Key, Lsn};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct RetainedVersion {
    pub entry: IndexEntry,
    pub from: Lsn,
    pub to: Lsn,
}

#[derive(Default)]
pub struct VersionRetention {
    versions: Mutex<HashMap<Key, Vec<RetainedVersion>>>,
}

impl VersionRetention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `entry` readable for snapshots below `superseded_at`
    pub fn retain(&self, key: Key, entry: IndexEntry, superseded_at: Lsn) {
        let version = RetainedVersion {
            from: entry.commit_lsn,
            to: superseded_at,
            entry,
        };
        self.versions.lock().entry(key).or_default().push(version);
    }

    /// Version of `key` a reader with `snapshot` should see, if retained
    pub fn version_at(&self, key: &Key, snapshot: Lsn) -> Option<IndexEntry> {
        self.versions.lock().get(key).and_then(|versions| {
            versions
                .iter()
                .find(|v| v.from <= snapshot && snapshot < v.to)
                .map(|v| v.entry.clone())
        })
    }

    /// Drop every version no snapshot at or above `oldest_snapshot` can see.
    /// Returns the extents that are now unreferenced.
    pub fn release(&self, oldest_snapshot: Lsn) -> Vec<Extent> {
        let mut versions = self.versions.lock();
        let mut freed = Vec::new();
        versions.retain(|_, list| {
            list.retain(|v| {
                if v.to <= oldest_snapshot {
                    freed.push(v.entry.extent());
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });
        freed
    }

    pub fn len(&self) -> usize {
        self.versions.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{DataType, TxId};

    fn entry(block: u64, commit: u64) -> IndexEntry {
        IndexEntry {
            file_id: 1,
            offset: block,
            length: 1,
            size: 10,
            data_type: DataType::Blob,
            checksum: 0,
            last_writer: TxId(1),
            commit_lsn: Lsn(commit),
        }
    }

    #[test]
    fn test_version_windows() {
        let retention = VersionRetention::new();
        let key = Key::new("/k").unwrap();
        retention.retain(key.clone(), entry(1, 5), Lsn(10));
        retention.retain(key.clone(), entry(2, 10), Lsn(20));

        assert_eq!(retention.version_at(&key, Lsn(4)), None);
        assert_eq!(retention.version_at(&key, Lsn(5)).unwrap().offset, 1);
        assert_eq!(retention.version_at(&key, Lsn(9)).unwrap().offset, 1);
        assert_eq!(retention.version_at(&key, Lsn(10)).unwrap().offset, 2);
        assert_eq!(retention.version_at(&key, Lsn(20)), None);
    }

    #[test]
    fn test_release_waits_for_oldest_snapshot() {
        let retention = VersionRetention::new();
        let key = Key::new("/k").unwrap();
        retention.retain(key.clone(), entry(1, 5), Lsn(10));
        retention.retain(key.clone(), entry(2, 10), Lsn(20));

        assert!(retention.release(Lsn(9)).is_empty());
        let freed = retention.release(Lsn(15));
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].block, 1);
        assert_eq!(retention.len(), 1);

        assert_eq!(retention.release(Lsn(20)).len(), 1);
        assert!(retention.is_empty());
    }
}
