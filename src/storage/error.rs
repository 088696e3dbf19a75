//! Store error types
//!
//! Every failure the engine can surface to a caller. The variants follow the
//! store's error taxonomy: I/O failures are passed through untouched,
//! corruption is reported with the offending location, lock conflicts and
//! admission rejections are retryable, and timeouts name the transaction that
//! was rolled back.

use crate::storage::types::TxId;
use thiserror::Error;

/// Errors that can occur in the store
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O operation failed (disk full, permission denied, ...)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Requested key does not exist
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Key failed normalization
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Caller supplied an argument the operation cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Another transaction holds the write lock for the key
    #[error("Lock conflict on {key}: held by transaction {holder}")]
    Conflict { key: String, holder: TxId },

    /// The transaction was rolled back because it outlived its timeout
    #[error("Transaction {0} timed out and was rolled back")]
    Timeout(TxId),

    /// Admission control rejected the request
    #[error("Store overloaded: {0}")]
    Overloaded(String),

    /// No live transaction has this id
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxId),

    /// Operation is not allowed in the transaction's current state
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    /// Startup recovery could not produce a consistent state
    #[error("Recovery failed: {0}")]
    Recovery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key pattern could not be parsed
    #[error("Query error: {0}")]
    Query(String),

    /// The store has been closed
    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    /// Whether the caller may simply retry the operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Overloaded(_))
    }

    /// Classify this error the way a commit caller sees it
    pub fn commit_error(&self) -> CommitError {
        match self {
            StoreError::Conflict { .. } | StoreError::Overloaded(_) => CommitError::Conflict,
            StoreError::Timeout(_) => CommitError::Timeout,
            _ => CommitError::IoFailure,
        }
    }
}

/// Coarse outcome of a failed commit, for callers coordinating commit across
/// this store and another resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitError {
    Conflict,
    Timeout,
    IoFailure,
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitError::Conflict => write!(f, "conflict"),
            CommitError::Timeout => write!(f, "timeout"),
            CommitError::IoFailure => write!(f, "io failure"),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
