//! Cache attempt repository trait.

use crate::error::MetadataResult;
use crate::models::{BlockRow, CacheRow, CarfileRow};
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;

/// What a quit-node repair touched: the number of affected successful
/// caches and the reliability each parent carfile lost.
#[derive(Debug, Clone, Default)]
pub struct QuitNodeOutcome {
    pub cache_count: usize,
    pub lost_reliability: HashMap<String, i64>,
}

/// Repository for cache attempts and their atomic progress updates.
#[async_trait]
pub trait CacheRepo: Send + Sync {
    /// Atomically insert a cache row together with its root block row.
    async fn create_cache(&self, cache: &CacheRow, root_block: &BlockRow) -> MetadataResult<()>;

    /// Atomic progress update, executed on every positive block result:
    /// refresh carfile totals (`data`), refresh the attempt row (`cache`),
    /// finalize one block (`block_result`) and upsert newly planned block
    /// rows (`create_blocks`).
    async fn save_cacheing_results(
        &self,
        data: Option<&CarfileRow>,
        cache: Option<&CacheRow>,
        block_result: Option<&BlockRow>,
        create_blocks: &[BlockRow],
    ) -> MetadataResult<()>;

    /// Atomic termination: aggregate block sums into the attempt row,
    /// stamp `end_time`, persist the final status, and on timeout stamp
    /// `end_time` on every block that never finished.
    async fn save_cache_end_results(
        &self,
        data: &CarfileRow,
        cache: &CacheRow,
    ) -> MetadataResult<()>;

    async fn get_cache_info(&self, cache_id: &str) -> MetadataResult<Option<CacheRow>>;

    /// Every attempt ever made for a carfile.
    async fn get_caches_of_carfile(&self, carfile_hash: &str) -> MetadataResult<Vec<CacheRow>>;

    /// Caches whose expiry has passed.
    async fn get_expired_caches(&self) -> MetadataResult<Vec<CacheRow>>;

    /// Move a cache's expiry (all caches of the carfile when `cache_id` is
    /// `None`).
    async fn reset_cache_expiry(
        &self,
        carfile_hash: &str,
        cache_id: Option<&str>,
        expired_time: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Push a cache's expiry out by whole hours (all caches of the
    /// carfile when `cache_id` is `None`).
    async fn extend_cache_expiry(
        &self,
        carfile_hash: &str,
        cache_id: Option<&str>,
        hours: i64,
    ) -> MetadataResult<()>;

    /// The soonest expiry across all caches, if any exist.
    async fn get_min_cache_expiry(&self) -> MetadataResult<Option<OffsetDateTime>>;

    /// Repair bookkeeping for a departed device: every successful cache
    /// holding blocks on it flips to restore (as do those blocks), and
    /// each parent carfile's reliability drops by the cache's
    /// contribution.
    async fn update_cache_info_of_quit_node(
        &self,
        device_id: &str,
    ) -> MetadataResult<QuitNodeOutcome>;
}
