//! Local device identity and stats.

use crate::error::NodeResult;
use courier_blockstore::BlockStore;
use courier_core::config::NodeConfig;
use courier_core::rpc::{NodeRegistration, NodeType};
use std::sync::Arc;

/// The identity and resource envelope this node reports upstream.
pub struct Device {
    pub device_id: String,
    pub node_type: NodeType,
    pub public_url: String,
    pub disk_space: f64,
    pub bandwidth_up: i64,
    pub bandwidth_down: i64,
    store: Arc<dyn BlockStore>,
}

impl Device {
    pub fn new(config: &NodeConfig, store: Arc<dyn BlockStore>) -> Self {
        Self {
            device_id: config.device_id.clone(),
            node_type: config.node_type,
            public_url: config.public_url.clone(),
            disk_space: config.disk_space,
            bandwidth_up: config.bandwidth_up,
            bandwidth_down: config.bandwidth_down,
            store,
        }
    }

    /// Fraction of the configured disk budget in use, 0.0 - 1.0.
    pub async fn disk_usage(&self) -> NodeResult<f64> {
        let used = self.store.disk_usage().await? as f64;
        if self.disk_space <= 0.0 {
            return Ok(0.0);
        }
        Ok((used / self.disk_space).min(1.0))
    }

    /// The registration announcement for the scheduler.
    pub async fn registration(&self) -> NodeResult<NodeRegistration> {
        Ok(NodeRegistration {
            device_id: self.device_id.clone(),
            node_type: self.node_type,
            rpc_url: self.public_url.clone(),
            download_url: format!("{}/block/get", self.public_url.trim_end_matches('/')),
            disk_usage: self.disk_usage().await?,
            disk_space: self.disk_space,
            bandwidth_up: self.bandwidth_up,
            bandwidth_down: self.bandwidth_down,
            longitude: 0.0,
            latitude: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_blockstore::MemoryStore;
    use courier_core::CidHash;

    #[tokio::test]
    async fn test_disk_usage_fraction() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(&CidHash::from_hex("aa"), Bytes::from(vec![0u8; 50]))
            .await
            .unwrap();

        let mut config = NodeConfig::for_testing("e1", NodeType::Edge);
        config.disk_space = 100.0;
        let device = Device::new(&config, store);

        let usage = device.disk_usage().await.unwrap();
        assert!((usage - 0.5).abs() < f64::EPSILON);
    }
}
