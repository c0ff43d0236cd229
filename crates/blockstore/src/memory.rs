//! In-memory block store, used by tests and single-process harnesses.

use crate::{BlockStore, ByteStream, StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use courier_core::CidHash;
use futures::stream;
use std::collections::HashMap;
use std::sync::Mutex;

/// Block store holding everything in a map.
#[derive(Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn put(&self, hash: &CidHash, data: Bytes) -> StoreResult<()> {
        self.blocks
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), data);
        Ok(())
    }

    async fn get(&self, hash: &CidHash) -> StoreResult<Bytes> {
        self.blocks
            .lock()
            .unwrap()
            .get(hash.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(hash.to_string()))
    }

    async fn get_reader(&self, hash: &CidHash) -> StoreResult<(ByteStream, u64)> {
        let data = self.get(hash).await?;
        let size = data.len() as u64;
        Ok((Box::pin(stream::iter([Ok(data)])), size))
    }

    async fn has(&self, hash: &CidHash) -> StoreResult<bool> {
        Ok(self.blocks.lock().unwrap().contains_key(hash.as_str()))
    }

    async fn delete(&self, hash: &CidHash) -> StoreResult<()> {
        self.blocks
            .lock()
            .unwrap()
            .remove(hash.as_str())
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(hash.to_string()))
    }

    async fn key_count(&self) -> StoreResult<u64> {
        Ok(self.blocks.lock().unwrap().len() as u64)
    }

    async fn iter_keys(&self) -> StoreResult<Vec<CidHash>> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .keys()
            .map(|k| CidHash::from_hex(k.clone()))
            .collect())
    }

    async fn disk_usage(&self) -> StoreResult<u64> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .values()
            .map(|v| v.len() as u64)
            .sum())
    }
}
