//! # tsvault
//!
//! Embedded transactional store for sparse time series and blobs.
//!
//! ## Features
//!
//! - **Transactions**: snapshot reads, per-key write locks, two-phase commit
//!   with external (XA) transaction ids
//! - **Durability**: write-ahead journal, checkpoints and crash recovery
//! - **Sparse series**: writes merge into canonical valid/origin interval sets
//! - **Concurrent index**: B-link tree with sibling links
//! - **Key patterns**: select groups of keys by wildcard, numeric range and type
//!
//! ## Modules
//!
//! - [`storage`]: keys, records, containers, allocator and journal
//! - [`index`]: B-link tree index and checkpoints
//! - [`txn`]: transaction manager, lock table and recovery
//! - [`query`]: key pattern language
//! - [`throttle`]: admission control
//! - [`store`]: the store handle tying it together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsvault::{Key, Samples, Store, StoreConfig, TimeSeries};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::open(StoreConfig::new("./data")).await?;
//!
//!     let key = Key::new("/pa/flux/sap/42")?;
//!     let tx = store.begin().await?;
//!     let series = TimeSeries::dense(0, Samples::Float(vec![1.0; 100]));
//!     store.write_time_series(tx, &key, series, 7).await?;
//!     store.commit(tx).await?;
//!
//!     let tx = store.begin().await?;
//!     let window = store.read_time_series(tx, &key, Some((10, 19))).await?;
//!     println!("{} valid points", window.valid.covered_points());
//!     store.commit(tx).await?;
//!
//!     for key in store.match_keys("TimeSeries@/pa/flux/*").await? {
//!         println!("{}", key);
//!     }
//!
//!     store.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod query;
pub mod storage;
pub mod store;
pub mod throttle;
pub mod txn;

pub use storage::{
    Blob, CommitError, DataType, Event, EventSeries, Interval, IntervalSet, Key, Lsn, Record,
    Samples, StoreError, StoreResult, TaggedInterval, TimeSeries, TxId, Vote, Xid,
};

pub use index::{BLinkTree, IndexEntry, IndexStats};

pub use query::{KeyMatcher, KeyPattern, QueryError};

pub use store::{Store, StoreConfig, StoreStats, VerifyReport};

pub use throttle::{Admission, Throttle, ThrottleConfig, ThrottleStats};

pub use txn::{InDoubt, LockPolicy, TransactionInfo, TxState, TxnConfig};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig};
