//! Ed25519 key types and encodings.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

/// A secret key for signing download tokens.
pub struct SecretKey {
    pub(crate) inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse from base64 of the 32 secret bytes.
    pub fn from_base64(s: &str) -> SignerResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::KeyParsing(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self {
            inner: SigningKey::from_bytes(&secret),
        })
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.inner.to_bytes())
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

/// A public key for verifying download tokens.
#[derive(Clone)]
pub struct PublicKey {
    pub(crate) inner: VerifyingKey,
}

impl PublicKey {
    /// Parse from base64 of the 32 public bytes.
    pub fn from_base64(s: &str) -> SignerResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;
        let public: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::KeyParsing(format!("expected 32 bytes, got {}", bytes.len())))?;
        let inner = VerifyingKey::from_bytes(&public)
            .map_err(|e| SignerError::KeyParsing(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.inner.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_base64()[..8])
    }
}
