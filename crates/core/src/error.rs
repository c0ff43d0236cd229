//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("unsupported codec: 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("unsupported multihash: 0x{0:x}")]
    UnsupportedMultihash(u64),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("malformed dag-pb block: {0}")]
    LinkDecode(String),

    #[error("invalid area name: {0}")]
    InvalidArea(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
