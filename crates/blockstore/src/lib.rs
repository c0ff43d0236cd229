//! Node-local block storage for Courier.
//!
//! A block store maps the canonical hash of a CID to opaque block bytes.
//! Guarantees:
//! - `put` is durable before it returns;
//! - reads are consistent with completed puts;
//! - key iteration may miss concurrently-added keys but never yields
//!   duplicates.

pub mod error;
pub mod filesystem;
pub mod memory;

pub use error::{StoreError, StoreResult};
pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::CidHash;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming block reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// Local key/value store from CID hash to block bytes.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block. Durable before returning.
    async fn put(&self, hash: &CidHash, data: Bytes) -> StoreResult<()>;

    /// Fetch a block's bytes.
    async fn get(&self, hash: &CidHash) -> StoreResult<Bytes>;

    /// Open a streaming reader over a block, with its exact size.
    async fn get_reader(&self, hash: &CidHash) -> StoreResult<(ByteStream, u64)>;

    async fn has(&self, hash: &CidHash) -> StoreResult<bool>;

    async fn delete(&self, hash: &CidHash) -> StoreResult<()>;

    /// Number of blocks currently stored.
    async fn key_count(&self) -> StoreResult<u64>;

    /// Snapshot of all stored keys.
    async fn iter_keys(&self) -> StoreResult<Vec<CidHash>>;

    /// Bytes of disk the store occupies.
    async fn disk_usage(&self) -> StoreResult<u64>;
}
