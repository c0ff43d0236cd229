//! Download-token signing for Courier.
//!
//! The scheduler mints a signing key per node at registration; each node
//! fetches its public half and verifies the grants users present at its
//! download edge.

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{PublicKey, SecretKey};
pub use signer::{DownloadSigner, DownloadVerifier, download_payload};
