//! Signer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(String),

    #[error("signature verification failed")]
    VerificationFailed,
}

pub type SignerResult<T> = std::result::Result<T, SignerError>;
