//! Core domain types and shared logic for Courier.
//!
//! This crate defines the canonical data model used across all other crates:
//! - CID hashing and verification
//! - Link resolution for raw and dag-pb blocks
//! - Carfile, cache attempt and block records
//! - Node/scheduler RPC wire types
//! - Configuration

pub mod block;
pub mod carfile;
pub mod config;
pub mod error;
pub mod hash;
pub mod links;
pub mod rpc;

pub use block::BlockId;
pub use carfile::{CacheId, CacheStatus};
pub use hash::{CidHash, cid_from_bytes, parse_cid, verify_block};
pub use error::{Error, Result};
pub use links::{BlockLink, build_pb_node, resolve_links};
pub use rpc::NodeType;

/// Number of block placements a node pulls per fetch round.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Total fetch attempts per block before a negative result is posted.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;
