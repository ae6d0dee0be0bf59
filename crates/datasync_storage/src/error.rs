//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors are `Clone` so they can be carried inside sync engine events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The storage handle has been closed or torn down.
    #[error("storage is closed")]
    Closed,

    /// A stored record could not be decoded.
    #[error("stored record is corrupted: {0}")]
    Corrupted(String),

    /// A write violated a storage constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The underlying engine reported an error.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Returns true if the store can no longer be used at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StorageError::Closed)
    }
}
