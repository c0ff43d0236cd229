//! Wire types for the node <-> scheduler RPC surface (JSON over HTTP).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use time::OffsetDateTime;

/// The two node classes: candidates act as peers and seed origins, edges
/// only serve end users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Edge,
    Candidate,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Edge => f.write_str("edge"),
            Self::Candidate => f.write_str("candidate"),
        }
    }
}

/// One block placement inside a cache request: which CID to fetch and the
/// FID it must be stored under on the receiving device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub cid: String,
    pub fid: i64,
}

/// A batched cache request for one carfile on one device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheBlocksRequest {
    pub block_infos: Vec<BlockPlacement>,
    /// Upstream to fetch from: a peer node's RPC base URL, or empty to use
    /// the IPFS gateway.
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub download_token: String,
    pub carfile_hash: String,
    pub cache_id: String,
}

/// Snapshot of a node's caching pipeline, returned by `CacheBlocks` and
/// `QueryCacheStat`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheStat {
    pub cache_block_count: u64,
    pub wait_cache_block_num: usize,
    pub doing_cache_block_num: usize,
    pub retry_num: u32,
    /// Per-fetch timeout, seconds.
    pub download_timeout: u64,
    /// Fraction of the device disk in use, 0.0 - 1.0.
    pub disk_usage: f64,
}

impl CacheStat {
    /// Queued plus in-flight placements; the load figure used for
    /// assignment tie-breaking.
    pub fn load(&self) -> usize {
        self.wait_cache_block_num + self.doing_cache_block_num
    }
}

/// The asynchronous result a node posts for one block of one cache attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheResult {
    pub cid: String,
    pub is_ok: bool,
    #[serde(default)]
    pub msg: String,
    /// Child CIDs resolved from the block.
    #[serde(default)]
    pub links: Vec<String>,
    pub block_size: u64,
    /// Sum of the subtree sizes the block declares for its links.
    pub links_size: u64,
    pub carfile_hash: String,
    pub cache_id: String,
}

/// Envelope for `CacheResult` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheResultRequest {
    pub device_id: String,
    pub result: CacheResult,
}

/// Per-CID outcome of a block delete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockOperationResult {
    pub cid: String,
    pub err_msg: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteBlocksRequest {
    pub cids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveWaitCacheBlockRequest {
    pub carfile_cid: String,
}

/// A node announcing it deleted (or will delete) blocks, so the scheduler
/// drops the matching block records. The response maps CIDs the scheduler
/// refused to release to the reason.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteBlockRecordsRequest {
    pub device_id: String,
    pub cids: Vec<String>,
}

pub type DeleteBlockRecordsResponse = HashMap<String, String>;

/// Outcome report for one end-user block download, posted by the serving
/// node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserDownloadResult {
    pub sn: i64,
    /// Hex signature the user presented; ties the report to the record.
    pub sign: String,
    pub block_size: i64,
    /// Bytes per second.
    pub download_speed: i64,
    pub result: bool,
    #[serde(default)]
    pub failed_reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserDownloadResultRequest {
    pub device_id: String,
    pub result: UserDownloadResult,
}

/// A node registering with (or re-announcing to) its scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub device_id: String,
    pub node_type: NodeType,
    /// Base URL of the node's RPC server.
    pub rpc_url: String,
    /// Public URL of the node's user download server.
    pub download_url: String,
    pub disk_usage: f64,
    pub disk_space: f64,
    pub bandwidth_up: i64,
    pub bandwidth_down: i64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub latitude: f64,
}

/// Operator request to replicate a carfile.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheCarfileRequest {
    pub cid: String,
    pub reliability: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expired_at: OffsetDateTime,
}

/// One recorded caching error, kept briefly for debugging.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheErrorInfo {
    pub cid: String,
    pub device_id: String,
    pub msg: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stat_load() {
        let stat = CacheStat {
            wait_cache_block_num: 7,
            doing_cache_block_num: 3,
            ..Default::default()
        };
        assert_eq!(stat.load(), 10);
    }

    #[test]
    fn test_cache_result_omits_defaults_on_parse() {
        let json = r#"{
            "cid": "bafyfoo",
            "is_ok": true,
            "block_size": 12,
            "links_size": 0,
            "carfile_hash": "aa",
            "cache_id": "aa_1"
        }"#;
        let result: CacheResult = serde_json::from_str(json).unwrap();
        assert!(result.links.is_empty());
        assert!(result.msg.is_empty());
    }
}
