//! Carfile repository trait.

use crate::error::MetadataResult;
use crate::models::CarfileRow;
use async_trait::async_trait;

/// Repository for carfile records.
#[async_trait]
pub trait CarfileRepo: Send + Sync {
    /// Insert the carfile row, or update the mutable columns if it exists.
    async fn set_carfile_info(&self, info: &CarfileRow) -> MetadataResult<()>;

    /// Fetch a carfile row by hash.
    async fn get_carfile_info(&self, carfile_hash: &str) -> MetadataResult<Option<CarfileRow>>;

    /// List carfile rows, newest expiry first.
    async fn list_carfiles(&self, limit: u32) -> MetadataResult<Vec<CarfileRow>>;

    /// Drop one cache attempt and its block rows. When `delete_data` is
    /// set the carfile row goes too; otherwise its reliability is lowered
    /// to `reliability`.
    async fn remove_cache_and_update_data(
        &self,
        cache_id: &str,
        carfile_hash: &str,
        delete_data: bool,
        reliability: i64,
    ) -> MetadataResult<()>;
}
