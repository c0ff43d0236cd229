//! Database models mapping to the per-area schema.

use sqlx::FromRow;
use time::OffsetDateTime;

/// Carfile record: one row per carfile hash (`data_info_<area>`).
#[derive(Debug, Clone, FromRow)]
pub struct CarfileRow {
    pub carfile_hash: String,
    pub carfile_cid: String,
    pub status: String,
    pub need_reliability: i64,
    pub reliability: i64,
    pub total_size: i64,
    pub total_blocks: i64,
    pub cache_count: i64,
    pub nodes: i64,
    pub expired_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
}

/// Cache attempt record (`cache_info_<area>`).
#[derive(Debug, Clone, FromRow)]
pub struct CacheRow {
    pub cache_id: String,
    pub carfile_hash: String,
    pub status: String,
    pub is_root: bool,
    pub done_size: i64,
    pub done_blocks: i64,
    pub total_size: i64,
    pub total_blocks: i64,
    pub reliability: i64,
    pub nodes: i64,
    pub expired_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
}

/// Block record (`block_info_<area>`), unique per `(cache_id, cid_hash)`.
#[derive(Debug, Clone, FromRow)]
pub struct BlockRow {
    pub id: String,
    pub cache_id: String,
    pub carfile_hash: String,
    pub cid: String,
    pub cid_hash: String,
    pub device_id: String,
    pub fid: i64,
    pub size: i64,
    pub reliability: i64,
    /// Device id of the peer the block is fetched from; empty for the
    /// IPFS gateway.
    pub source: String,
    pub status: String,
    pub end_time: Option<OffsetDateTime>,
}

/// Registered node (`node` table, shared across areas of a deployment).
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub device_id: String,
    pub last_time: OffsetDateTime,
    pub geo: String,
    pub node_type: String,
    pub is_online: bool,
    pub address: String,
    pub server_name: String,
    /// Base64 signing key for this node's download grants.
    pub private_key: String,
    pub url: String,
    pub quitted: bool,
}

/// End-user download record (`block_download_info_<area>`).
#[derive(Debug, Clone, FromRow)]
pub struct DownloadRow {
    pub id: String,
    pub device_id: String,
    pub block_cid: String,
    pub carfile_cid: String,
    pub block_size: i64,
    pub speed: i64,
    pub reward: i64,
    pub status: i64,
    pub failed_reason: String,
    pub client_ip: String,
    pub created_time: OffsetDateTime,
    pub complete_time: Option<OffsetDateTime>,
}
