//! Block store error types.

use thiserror::Error;

/// Block store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Whether this error means the block simply is not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for block store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
