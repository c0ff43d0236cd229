//! Node registry repository trait.

use crate::error::MetadataResult;
use crate::models::NodeRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Authentication material for a node's download edge.
#[derive(Debug, Clone)]
pub struct NodeAuth {
    pub device_id: String,
    pub url: String,
    pub private_key: String,
}

/// Repository for registered nodes.
#[async_trait]
pub trait NodeRepo: Send + Sync {
    /// Insert or refresh a node row.
    async fn set_node_info(&self, info: &NodeRow) -> MetadataResult<()>;

    async fn get_node(&self, device_id: &str) -> MetadataResult<Option<NodeRow>>;

    async fn set_node_offline(
        &self,
        device_id: &str,
        last_time: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Mark every node of this scheduler offline; run at startup so state
    /// reflects reconnections only.
    async fn set_all_nodes_offline(&self, server_name: &str) -> MetadataResult<()>;

    /// Offline nodes that have not quit, for the departure sweep.
    async fn get_offline_nodes(&self, server_name: &str) -> MetadataResult<Vec<NodeRow>>;

    async fn set_nodes_quit(&self, device_ids: &[String]) -> MetadataResult<()>;

    async fn get_node_auth(&self, device_id: &str) -> MetadataResult<NodeAuth>;
}
