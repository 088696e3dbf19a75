//! tsvault Storage Layer
//!
//! The persistent building blocks under the index and transactions:
//!
//! - **types**: keys, records and identifiers
//! - **interval**: canonical sets of (tagged) index ranges
//! - **format**: versioned record codec
//! - **allocator**: block bitsets and the id sequence
//! - **dirhash**: key → bounded-fan-out directory
//! - **container**: block-addressed container files
//! - **journal**: write-ahead journal
//! - **error**: error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Record → encode (+LZ4) → allocate blocks → container write
//!          → journal Write record → (commit) journal Commit → index
//!
//! Read Path:
//!   Key → index entry → container read → checksum → decode
//! ```

pub mod allocator;
pub mod container;
pub mod dirhash;
pub mod error;
pub mod format;
pub mod interval;
pub mod journal;
pub mod types;

pub use allocator::{BlockAllocator, Extent, ReconcileReport, SequenceGenerator};
pub use container::{ContainerSet, ContainerStats};
pub use dirhash::{DirHash, HashLayout};
pub use error::{CommitError, StoreError, StoreResult};
pub use format::{decode_record, encode_record, BLOCK_SIZE, FORMAT_VERSION};
pub use interval::{Interval, IntervalSet, Span, TaggedInterval};
pub use journal::{Journal, JournalOp, JournalOptions, JournalRecord, JournalStats, JournalSyncMode};
pub use types::{
    Blob, DataType, Event, EventSeries, Key, Lsn, Record, Samples, TimeSeries, TxId, Vote, Xid,
};
