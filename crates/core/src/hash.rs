//! CID handling: canonical hash keys and block verification.
//!
//! Two CIDs with the same multihash refer to the same bytes, so the
//! lowercase-hex multihash is the primary key everywhere: in the block
//! tables, in the block stores and in the FID index.

use cid::Cid;
use cid::multihash::Multihash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Multicodec for raw blocks.
pub const RAW_CODEC: u64 = 0x55;

/// Multicodec for dag-pb blocks.
pub const DAG_PB_CODEC: u64 = 0x70;

/// Multihash code for sha2-256.
const SHA2_256: u64 = 0x12;

/// Multihash code for the identity hash.
const IDENTITY: u64 = 0x00;

/// The canonical hash of a CID: its multihash bytes, hex encoded.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CidHash(String);

impl CidHash {
    /// Derive the canonical hash from a parsed CID.
    pub fn from_cid(cid: &Cid) -> Self {
        let bytes = cid.hash().to_bytes();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Parse a CID string and derive its canonical hash.
    pub fn from_cid_str(s: &str) -> crate::Result<Self> {
        Ok(Self::from_cid(&parse_cid(s)?))
    }

    /// Wrap an already-derived hash string (e.g. read back from a table).
    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The hex key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CidHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CidHash({})", &self.0[..self.0.len().min(16)])
    }
}

impl fmt::Display for CidHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a CID from its string form (v0 base58 or v1 multibase).
pub fn parse_cid(s: &str) -> crate::Result<Cid> {
    Cid::try_from(s).map_err(|e| crate::Error::InvalidCid(format!("{s}: {e}")))
}

/// Build a CID over `data` with the given codec, hashing with sha2-256.
pub fn cid_from_bytes(codec: u64, data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    let mh = Multihash::wrap(SHA2_256, &digest).expect("sha2-256 digest fits in a multihash");
    Cid::new_v1(codec, mh)
}

/// Verify that `data` matches the digest a CID declares.
///
/// Only sha2-256 and identity multihashes are accepted; anything else is a
/// permanent validation failure for that block.
pub fn verify_block(cid: &Cid, data: &[u8]) -> crate::Result<()> {
    let mh = cid.hash();
    let actual: Vec<u8> = match mh.code() {
        SHA2_256 => Sha256::digest(data).to_vec(),
        IDENTITY => data.to_vec(),
        code => return Err(crate::Error::UnsupportedMultihash(code)),
    };

    if actual != mh.digest() {
        let to_hex = |b: &[u8]| b.iter().map(|b| format!("{b:02x}")).collect::<String>();
        return Err(crate::Error::HashMismatch {
            expected: to_hex(mh.digest()),
            actual: to_hex(&actual),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_across_cid_versions() {
        let data = b"hello courier";
        let v1 = cid_from_bytes(DAG_PB_CODEC, data);
        let v0 = Cid::new_v0(*v1.hash()).unwrap();
        assert_eq!(CidHash::from_cid(&v1), CidHash::from_cid(&v0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cid("not-a-cid").is_err());
        assert!(parse_cid("").is_err());
    }

    #[test]
    fn test_verify_block() {
        let data = b"some block bytes";
        let cid = cid_from_bytes(RAW_CODEC, data);
        verify_block(&cid, data).unwrap();

        let err = verify_block(&cid, b"tampered").unwrap_err();
        assert!(matches!(err, crate::Error::HashMismatch { .. }));
    }

    #[test]
    fn test_round_trip_through_string() {
        let cid = cid_from_bytes(RAW_CODEC, b"abc");
        let parsed = parse_cid(&cid.to_string()).unwrap();
        assert_eq!(cid, parsed);
        assert_eq!(
            CidHash::from_cid_str(&cid.to_string()).unwrap(),
            CidHash::from_cid(&cid)
        );
    }
}
