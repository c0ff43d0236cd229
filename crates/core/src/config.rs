//! Configuration types shared across crates.

use crate::rpc::NodeType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables of the caching control loop, shared by both daemons.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachingConfig {
    /// Placements a node pulls per fetch round.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Total fetch attempts per block before it is failed.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Per-fetch timeout in seconds.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Deadline for any single scheduler/node RPC, seconds.
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    /// Lease budget per still-pending block of an attempt, seconds.
    #[serde(default = "default_per_block_timeout_secs")]
    pub per_block_timeout_secs: u64,
    /// Concurrent cache attempts across an area.
    #[serde(default = "default_max_running_attempts")]
    pub max_running_attempts: usize,
    /// How long recorded cache errors are kept, hours.
    #[serde(default = "default_cache_error_ttl_hours")]
    pub cache_error_ttl_hours: u64,
}

fn default_batch_size() -> usize {
    crate::DEFAULT_BATCH_SIZE
}

fn default_retry_limit() -> u32 {
    crate::DEFAULT_RETRY_LIMIT
}

fn default_download_timeout_secs() -> u64 {
    15
}

fn default_api_timeout_secs() -> u64 {
    3
}

fn default_per_block_timeout_secs() -> u64 {
    60
}

fn default_max_running_attempts() -> usize {
    10
}

fn default_cache_error_ttl_hours() -> u64 {
    72
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retry_limit: default_retry_limit(),
            download_timeout_secs: default_download_timeout_secs(),
            api_timeout_secs: default_api_timeout_secs(),
            per_block_timeout_secs: default_per_block_timeout_secs(),
            max_running_attempts: default_max_running_attempts(),
            cache_error_ttl_hours: default_cache_error_ttl_hours(),
        }
    }
}

impl CachingConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn per_block_timeout(&self) -> Duration {
        Duration::from_secs(self.per_block_timeout_secs)
    }

    pub fn cache_error_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_error_ttl_hours * 3600)
    }
}

/// Reliability contributed by a successful attempt, by node class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReliabilityWeights {
    #[serde(default = "default_weight")]
    pub edge: i64,
    #[serde(default = "default_weight")]
    pub candidate: i64,
}

fn default_weight() -> i64 {
    1
}

impl Default for ReliabilityWeights {
    fn default() -> Self {
        Self { edge: 1, candidate: 1 }
    }
}

impl ReliabilityWeights {
    pub fn for_node_type(&self, node_type: NodeType) -> i64 {
        match node_type {
            NodeType::Edge => self.edge,
            NodeType::Candidate => self.candidate,
        }
    }
}

/// Scheduler daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bind address (e.g. "0.0.0.0:3456").
    #[serde(default = "default_scheduler_bind")]
    pub bind: String,
    /// Name of this scheduler instance; prefixes live-state keys.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// The area this scheduler serves; suffixes the durable tables.
    pub area: String,
    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(default)]
    pub weights: ReliabilityWeights,
}

fn default_scheduler_bind() -> String {
    "127.0.0.1:3456".to_string()
}

fn default_server_name() -> String {
    "courier".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/courier.db")
}

impl SchedulerConfig {
    /// A config suitable for tests: in-area, short lease budgets.
    pub fn for_testing() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            server_name: "test".to_string(),
            area: "test-area".to_string(),
            database_path: PathBuf::from(":memory:"),
            caching: CachingConfig::default(),
            weights: ReliabilityWeights::default(),
        }
    }
}

/// Node daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bind address for the RPC and download server.
    #[serde(default = "default_node_bind")]
    pub bind: String,
    pub device_id: String,
    pub node_type: NodeType,
    /// Root directory of the local block store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// IPFS HTTP gateway used when a placement has no peer source.
    #[serde(default = "default_ipfs_gateway")]
    pub ipfs_gateway: String,
    /// Base URL of this node's scheduler.
    pub scheduler_url: String,
    /// Publicly reachable base URL of this node.
    pub public_url: String,
    #[serde(default)]
    pub caching: CachingConfig,
    /// Total disk budget for the block store, bytes.
    #[serde(default = "default_disk_space")]
    pub disk_space: f64,
    #[serde(default)]
    pub bandwidth_up: i64,
    #[serde(default)]
    pub bandwidth_down: i64,
}

fn default_node_bind() -> String {
    "127.0.0.1:3457".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/blocks")
}

fn default_ipfs_gateway() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_disk_space() -> f64 {
    64.0 * 1024.0 * 1024.0 * 1024.0
}

impl NodeConfig {
    /// A config suitable for tests; store path is filled in by the caller.
    pub fn for_testing(device_id: &str, node_type: NodeType) -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            device_id: device_id.to_string(),
            node_type,
            store_path: PathBuf::from("./blocks"),
            ipfs_gateway: "http://127.0.0.1:0".to_string(),
            scheduler_url: "http://127.0.0.1:0".to_string(),
            public_url: "http://127.0.0.1:0".to_string(),
            caching: CachingConfig::default(),
            disk_space: default_disk_space(),
            bandwidth_up: 0,
            bandwidth_down: 0,
        }
    }
}
