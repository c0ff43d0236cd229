//! Block record repository trait.

use crate::error::MetadataResult;
use crate::models::BlockRow;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// Repository for block records.
#[async_trait]
pub trait BlockRepo: Send + Sync {
    async fn get_block_info(
        &self,
        cache_id: &str,
        cid_hash: &str,
    ) -> MetadataResult<Option<BlockRow>>;

    /// Blocks of a cache not yet successful: `cid -> block id`. Feeds the
    /// restart path of an interrupted attempt.
    async fn get_undone_blocks(&self, cache_id: &str) -> MetadataResult<HashMap<String, String>>;

    /// Every successfully cached instance of a CID across carfiles, keyed
    /// by carfile hash. Seeds copy-from-peer planning.
    async fn get_blocks_with_hash(
        &self,
        cid_hash: &str,
    ) -> MetadataResult<HashMap<String, BlockRow>>;

    async fn get_blocks_with_status(
        &self,
        cache_id: &str,
        status: &str,
    ) -> MetadataResult<Vec<BlockRow>>;

    async fn get_block_count_with_status(
        &self,
        cache_id: &str,
        status: &str,
    ) -> MetadataResult<i64>;

    /// Distinct successful devices of a carfile and of one cache.
    async fn get_nodes_from_data_cache(
        &self,
        carfile_hash: &str,
        cache_id: &str,
    ) -> MetadataResult<(Vec<String>, Vec<String>)>;

    /// Devices holding a block; all records or successful ones only.
    async fn get_nodes_with_block(
        &self,
        cid_hash: &str,
        success_only: bool,
    ) -> MetadataResult<Vec<String>>;

    /// Successful blocks on a device.
    async fn get_device_block_count(&self, device_id: &str) -> MetadataResult<i64>;

    /// FID -> CID for every successful block on a device.
    async fn get_blocks_fid(&self, device_id: &str) -> MetadataResult<BTreeMap<i64, String>>;

    /// FID -> CID for a device's successful blocks within an inclusive
    /// FID range.
    async fn get_blocks_in_fid_range(
        &self,
        device_id: &str,
        start_fid: i64,
        end_fid: i64,
    ) -> MetadataResult<BTreeMap<i64, String>>;

    /// Release block records a device announced it deleted. Records still
    /// backing a successful cache are refused; the returned map carries
    /// the refusal reason per CID hash.
    async fn delete_block_records(
        &self,
        device_id: &str,
        cid_hashes: &[String],
    ) -> MetadataResult<HashMap<String, String>>;
}
