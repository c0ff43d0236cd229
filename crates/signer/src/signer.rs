//! Download request signing and verification.
//!
//! The scheduler signs the concatenation `cid || sn || sign_time ||
//! timeout` when it hands a user a download URL; the serving node verifies
//! the hex signature before streaming the block.

use crate::error::{SignerError, SignerResult};
use crate::key::{PublicKey, SecretKey};
use ed25519_dalek::{Signature, Signer as _, Verifier as _};

/// Build the signed payload for a block download.
pub fn download_payload(cid: &str, sn: i64, sign_time: i64, timeout: i64) -> String {
    format!("{cid}{sn}{sign_time}{timeout}")
}

/// Signs download requests on the scheduler side.
pub struct DownloadSigner {
    key: SecretKey,
}

impl DownloadSigner {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }

    /// Generate a signer with a fresh random key.
    pub fn generate() -> Self {
        Self::new(SecretKey::generate())
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    /// Sign a download grant, returning the hex signature carried in the
    /// download URL.
    pub fn sign_download(&self, cid: &str, sn: i64, sign_time: i64, timeout: i64) -> String {
        let payload = download_payload(cid, sn, sign_time, timeout);
        let sig = self.key.inner.sign(payload.as_bytes());
        sig.to_bytes().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Verifies download requests on the node side.
#[derive(Clone)]
pub struct DownloadVerifier {
    key: PublicKey,
}

impl DownloadVerifier {
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }

    /// Verify a hex signature over a download grant.
    pub fn verify_download(
        &self,
        sign_hex: &str,
        cid: &str,
        sn: i64,
        sign_time: i64,
        timeout: i64,
    ) -> SignerResult<()> {
        let bytes = decode_hex(sign_hex)?;
        let sig_bytes: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
            SignerError::SignatureEncoding(format!("expected 64 bytes, got {}", bytes.len()))
        })?;
        let sig = Signature::from_bytes(&sig_bytes);

        let payload = download_payload(cid, sn, sign_time, timeout);
        self.key
            .inner
            .verify(payload.as_bytes(), &sig)
            .map_err(|_| SignerError::VerificationFailed)
    }
}

fn decode_hex(s: &str) -> SignerResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(SignerError::SignatureEncoding("odd hex length".to_string()));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair)
                .map_err(|e| SignerError::SignatureEncoding(e.to_string()))?;
            u8::from_str_radix(pair, 16).map_err(|e| SignerError::SignatureEncoding(e.to_string()))
        })
        .collect()
}
