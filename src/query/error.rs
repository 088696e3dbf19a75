//! Key pattern error types

use crate::storage::error::StoreError;
use thiserror::Error;

/// Errors that can occur while parsing a key pattern
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Pattern text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Numeric range with start after end
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Unrecognized data type before '@'
    #[error("Unknown data type: {0}")]
    UnknownDataType(String),
}

impl From<QueryError> for StoreError {
    fn from(err: QueryError) -> Self {
        StoreError::Query(err.to_string())
    }
}

/// Result type for pattern operations
pub type QueryResult<T> = Result<T, QueryError>;
