//! Key index
//!
//! Maps every live key to the location of its latest committed record.
//!
//! - **BLinkTree**: concurrent B-link tree (Lehman-Yao) holding the entries
//! - **checkpoint**: versioned snapshot of the whole index on disk
//!
//! # Concurrency
//!
//! ```text
//! lookup:  root → ... → leaf      one read lock at a time, move right
//!                                 whenever key >= high_key
//! insert:  leaf (write) → split → parent (write) → ...
//!                                 at most parent + child held together
//! delete:  leaf (write); underflow → merge under the exclusive
//!                                 restructure lock
//! ```

mod blink;
mod checkpoint;

pub use blink::{BLinkTree, IndexStats, RangeScan, TreeShape};
pub use checkpoint::{load_checkpoint, write_checkpoint, Checkpoint};

use crate::storage::allocator::Extent;
use crate::storage::types::{DataType, Lsn, TxId};
use serde::{Deserialize, Serialize};

/// Location and metadata of a key's current record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Container holding the record
    pub file_id: u64,
    /// First block of the record
    pub offset: u64,
    /// Blocks reserved for the record
    pub length: u64,
    /// Encoded record size in bytes
    pub size: u64,
    pub data_type: DataType,
    /// CRC32 of the encoded record
    pub checksum: u32,
    pub last_writer: TxId,
    /// LSN of the commit that installed this entry
    pub commit_lsn: Lsn,
}

impl IndexEntry {
    pub fn extent(&self) -> Extent {
        Extent {
            file_id: self.file_id,
            block: self.offset,
            blocks: self.length,
        }
    }

    /// Whether a reader with this snapshot may see the entry
    pub fn visible_at(&self, snapshot: Lsn) -> bool {
        self.commit_lsn <= snapshot
    }
}
