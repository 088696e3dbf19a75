//! Index checkpoint
//!
//! Format:
//! - magic: [u8; 4] = "TSVI"
//! - version: u8
//! - lsn: u64 (every commit at or below it is reflected)
//! - count: u64
//! - crc: u32 (CRC32 of the body)
//! - body: bincode `Vec<(Key, IndexEntry)>` in key order
//!
//! Written to a temp file and renamed over `index.ckpt`, so a crash leaves
//! either the previous checkpoint or the new one.

use crate::index::IndexEntry;
use crate::storage::allocator::write_atomic;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::format::{checksum, Cursor, FORMAT_VERSION};
use crate::storage::types::{Key, Lsn};
use std::path::Path;

const MAGIC: &[u8; 4] = b"TSVI";
const HEADER_LEN: usize = 4 + 1 + 8 + 8 + 4;

/// Persisted image of the index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    pub lsn: Lsn,
    pub entries: Vec<(Key, IndexEntry)>,
}

pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> StoreResult<()> {
    let body = bincode::serialize(&checkpoint.entries)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(MAGIC);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&checkpoint.lsn.0.to_le_bytes());
    buf.extend_from_slice(&(checkpoint.entries.len() as u64).to_le_bytes());
    buf.extend_from_slice(&checksum(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    write_atomic(path, &buf)?;

    tracing::debug!(
        "Wrote index checkpoint at LSN {} ({} entries)",
        checkpoint.lsn,
        checkpoint.entries.len()
    );
    Ok(())
}

/// Load the checkpoint at `path`; `None` if none was ever written
pub fn load_checkpoint(path: &Path) -> StoreResult<Option<Checkpoint>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let corrupt = |what: &str| StoreError::Corruption(format!("{:?}: {}", path, what));
    let mut cursor = Cursor::new(&bytes);
    if cursor.take(4)? != MAGIC {
        return Err(corrupt("bad checkpoint magic"));
    }
    let version = cursor.u8()?;
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported checkpoint version {}", version)));
    }
    let lsn = Lsn(cursor.u64()?);
    let count = cursor.u64()?;
    let crc = cursor.u32()?;
    let body = cursor.take(cursor.remaining())?;
    if checksum(body) != crc {
        return Err(corrupt("checkpoint checksum mismatch"));
    }

    let entries: Vec<(Key, IndexEntry)> = bincode::deserialize(body)?;
    if entries.len() as u64 != count {
        return Err(corrupt(&format!(
            "checkpoint holds {} entries, header says {}",
            entries.len(),
            count
        )));
    }
    if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(corrupt("checkpoint keys out of order"));
    }

    Ok(Some(Checkpoint { lsn, entries }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{DataType, TxId};
    use tempfile::tempdir;

    fn sample() -> Checkpoint {
        let entries = (0..50u64)
            .map(|n| {
                (
                    Key::new(format!("/ckpt/{:03}", n)).unwrap(),
                    IndexEntry {
                        file_id: n % 3,
                        offset: n + 1,
                        length: 1,
                        size: 64,
                        data_type: DataType::DoubleSeries,
                        checksum: 7,
                        last_writer: TxId(n),
                        commit_lsn: Lsn(n + 10),
                    },
                )
            })
            .collect();
        Checkpoint {
            lsn: Lsn(99),
            entries,
        }
    }

    #[test]
    fn test_checkpoint_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.ckpt");
        assert_eq!(load_checkpoint(&path).unwrap(), None);

        let checkpoint = sample();
        write_checkpoint(&path, &checkpoint).unwrap();
        assert_eq!(load_checkpoint(&path).unwrap(), Some(checkpoint));
    }

    #[test]
    fn test_damaged_checkpoint_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.ckpt");
        write_checkpoint(&path, &sample()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            load_checkpoint(&path),
            Err(StoreError::Corruption(_))
        ));
    }
}
