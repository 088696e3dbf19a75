//! Directory hash
//!
//! Maps a key to a container directory with bounded fan-out. The key is hashed
//! (XXH3, 64-bit) into one of `buckets` buckets and the bucket number, written
//! in base `fan_out`, becomes a fixed-depth path such as `data/1f/03`.
//!
//! `buckets` is sized from the expected store capacity so that, with 2x
//! headroom, no bucket is expected to receive more than `max_entries` keys.
//! The layout is persisted in `hash.toml` and reused on reopen; changing it
//! would orphan every existing container.

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::format::FORMAT_VERSION;
use crate::storage::types::Key;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LAYOUT_FILE: &str = "hash.toml";

/// Persisted hash geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashLayout {
    pub version: u8,
    pub buckets: u64,
    pub fan_out: u32,
    pub levels: u32,
    pub max_entries: u64,
}

impl HashLayout {
    pub fn new(capacity: u64, max_entries: u64, fan_out: u32) -> StoreResult<Self> {
        if max_entries == 0 {
            return Err(StoreError::Config(
                "max_entries_per_dir must be positive".to_string(),
            ));
        }
        if fan_out < 2 || fan_out > 256 || u64::from(fan_out) > max_entries {
            return Err(StoreError::Config(format!(
                "fan_out {} must be in 2..=256 and not exceed max_entries_per_dir {}",
                fan_out, max_entries
            )));
        }

        let buckets = (capacity.saturating_mul(2)).div_ceil(max_entries).max(1);
        let mut levels = 1;
        let mut reach = u64::from(fan_out);
        while reach < buckets {
            reach = reach.saturating_mul(u64::from(fan_out));
            levels += 1;
        }

        Ok(Self {
            version: FORMAT_VERSION,
            buckets,
            fan_out,
            levels,
            max_entries,
        })
    }
}

/// Key → directory mapping rooted at a data directory
#[derive(Debug, Clone)]
pub struct DirHash {
    root: PathBuf,
    layout: HashLayout,
}

impl DirHash {
    /// Open the layout stored under `root`, or create one from the given
    /// geometry if none exists yet.
    pub fn open(
        root: impl AsRef<Path>,
        capacity: u64,
        max_entries: u64,
        fan_out: u32,
    ) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let layout_path = root.join(LAYOUT_FILE);
        let requested = HashLayout::new(capacity, max_entries, fan_out)?;

        let layout = match std::fs::read_to_string(&layout_path) {
            Ok(content) => {
                let stored: HashLayout = toml::from_str(&content).map_err(|e| {
                    StoreError::Corruption(format!("{:?}: {}", layout_path, e))
                })?;
                if stored.version != FORMAT_VERSION {
                    return Err(StoreError::Corruption(format!(
                        "Unsupported hash layout version: {}",
                        stored.version
                    )));
                }
                if stored != requested {
                    tracing::warn!(
                        "Keeping existing directory layout ({} buckets, fan-out {}) over configured one ({} buckets, fan-out {})",
                        stored.buckets,
                        stored.fan_out,
                        requested.buckets,
                        requested.fan_out
                    );
                }
                stored
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let content = toml::to_string(&requested)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                std::fs::write(&layout_path, content)?;
                requested
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self { root, layout })
    }

    pub fn layout(&self) -> &HashLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bucket for a key
    pub fn bucket(&self, key: &Key) -> u64 {
        twox_hash::xxh3::hash64(key.as_str().as_bytes()) % self.layout.buckets
    }

    /// Directory for a bucket, `levels` components deep
    pub fn bucket_path(&self, bucket: u64) -> PathBuf {
        let fan_out = u64::from(self.layout.fan_out);
        let mut digits = Vec::with_capacity(self.layout.levels as usize);
        let mut rest = bucket;
        for _ in 0..self.layout.levels {
            digits.push(rest % fan_out);
            rest /= fan_out;
        }
        let mut path = self.root.clone();
        for digit in digits.iter().rev() {
            path.push(format!("{:02x}", digit));
        }
        path
    }

    /// Directory for a key
    pub fn locate(&self, key: &Key) -> PathBuf {
        self.bucket_path(self.bucket(key))
    }

    /// Parse a bucket directory back into its bucket number
    pub fn bucket_of_path(&self, path: &Path) -> Option<u64> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let fan_out = u64::from(self.layout.fan_out);
        let mut bucket = 0u64;
        let mut depth = 0;
        for component in relative.components() {
            let digit = u64::from_str_radix(component.as_os_str().to_str()?, 16).ok()?;
            if digit >= fan_out {
                return None;
            }
            bucket = bucket * fan_out + digit;
            depth += 1;
        }
        (depth == self.layout.levels && bucket < self.layout.buckets).then_some(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_layout_geometry() {
        let layout = HashLayout::new(100_000, 1000, 64).unwrap();
        assert_eq!(layout.buckets, 200);
        assert_eq!(layout.levels, 2);

        let tiny = HashLayout::new(10, 1000, 64).unwrap();
        assert_eq!(tiny.buckets, 1);
        assert_eq!(tiny.levels, 1);

        assert!(HashLayout::new(1000, 16, 64).is_err());
        assert!(HashLayout::new(1000, 1000, 1).is_err());
    }

    #[test]
    fn test_hundred_thousand_keys_stay_under_bound() {
        let dir = tempdir().unwrap();
        let hash = DirHash::open(dir.path(), 100_000, 1000, 64).unwrap();

        let mut counts: HashMap<PathBuf, u64> = HashMap::new();
        for i in 0..100_000 {
            let key = Key::new(format!("/pa/flux/module{}/target{}", i % 84, i)).unwrap();
            *counts.entry(hash.locate(&key)).or_default() += 1;
        }

        let worst = counts.values().copied().max().unwrap();
        assert!(worst <= 1000, "fullest bucket holds {} keys", worst);
        assert!(counts.len() as u64 <= hash.layout().buckets);
    }

    #[test]
    fn test_locate_is_deterministic_and_invertible() {
        let dir = tempdir().unwrap();
        let hash = DirHash::open(dir.path(), 1_000_000, 500, 16).unwrap();
        let key = Key::new("/cal/2d-black/7").unwrap();

        let path = hash.locate(&key);
        assert_eq!(path, hash.locate(&key));
        assert_eq!(
            path.strip_prefix(dir.path()).unwrap().components().count(),
            hash.layout().levels as usize
        );
        assert_eq!(hash.bucket_of_path(&path), Some(hash.bucket(&key)));
        assert_eq!(hash.bucket_of_path(&dir.path().join("zz")), None);
    }

    #[test]
    fn test_existing_layout_is_reused() {
        let dir = tempdir().unwrap();
        let first = DirHash::open(dir.path(), 100_000, 1000, 64).unwrap();
        let second = DirHash::open(dir.path(), 5_000_000, 2000, 32).unwrap();
        assert_eq!(first.layout(), second.layout());
    }
}
