//! End-user download record repository trait.

use crate::error::MetadataResult;
use crate::models::DownloadRow;
use async_trait::async_trait;

/// Repository for end-user block download records.
#[async_trait]
pub trait DownloadRepo: Send + Sync {
    /// Insert a record, or update its outcome columns on replay.
    async fn save_block_download_info(&self, info: &DownloadRow) -> MetadataResult<()>;

    /// Today's downloads served by a device, newest first.
    async fn get_block_download_infos(&self, device_id: &str) -> MetadataResult<Vec<DownloadRow>>;

    async fn get_block_download_info_by_id(&self, id: &str)
    -> MetadataResult<Option<DownloadRow>>;
}
