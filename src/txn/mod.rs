//! Transactions
//!
//! - **locks**: per-key write locks, owned by a message-driven task
//! - **retention**: superseded versions kept for older snapshots
//! - **xfile**: record merge and container I/O for one key
//! - **manager**: transaction lifecycle, two-phase commit, timeouts
//! - **recovery**: journal replay at open

mod locks;
mod manager;
mod recovery;
mod retention;
mod xfile;

pub use locks::{LockPolicy, LockStats, LockTable};
pub use manager::{
    InDoubt, IndexImage, PendingOp, RecoveredTx, TransactionInfo, TransactionManager, TxState,
    TxnConfig, TxnStats,
};
pub use recovery::{recover, RecoveredState, RecoveryReport};
pub use retention::{RetainedVersion, VersionRetention};
pub use xfile::{Mutation, XFiles};
