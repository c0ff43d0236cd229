//! Outbound node RPC: the dispatcher trait and its HTTP client.
//!
//! The state machine dispatches through [`NodeDispatcher`] so the test
//! harness can stand in for a fleet without sockets.

use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use courier_core::rpc::{
    BlockOperationResult, CacheBlocksRequest, CacheStat, DeleteBlocksRequest,
    RemoveWaitCacheBlockRequest,
};
use std::time::Duration;

/// The slice of the node RPC surface the scheduler calls.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    /// Post a batched cache request; the node answers with its pipeline
    /// stats.
    async fn cache_blocks(
        &self,
        rpc_url: &str,
        reqs: Vec<CacheBlocksRequest>,
    ) -> SchedulerResult<CacheStat>;

    async fn delete_blocks(
        &self,
        rpc_url: &str,
        cids: Vec<String>,
    ) -> SchedulerResult<Vec<BlockOperationResult>>;

    async fn remove_wait_cache_block(
        &self,
        rpc_url: &str,
        carfile_cid: &str,
    ) -> SchedulerResult<()>;
}

/// HTTP client for node RPC.
pub struct NodeClient {
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static options");
        Self { http }
    }

    async fn post_json<B, T>(&self, url: String, body: &B) -> SchedulerResult<T>
    where
        B: serde::Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::NodeRpc(format!("{url}: {status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl NodeDispatcher for NodeClient {
    async fn cache_blocks(
        &self,
        rpc_url: &str,
        reqs: Vec<CacheBlocksRequest>,
    ) -> SchedulerResult<CacheStat> {
        let url = format!("{}/v1/blocks/cache", rpc_url.trim_end_matches('/'));
        self.post_json(url, &reqs).await
    }

    async fn delete_blocks(
        &self,
        rpc_url: &str,
        cids: Vec<String>,
    ) -> SchedulerResult<Vec<BlockOperationResult>> {
        let url = format!("{}/v1/blocks/delete", rpc_url.trim_end_matches('/'));
        self.post_json(url, &DeleteBlocksRequest { cids }).await
    }

    async fn remove_wait_cache_block(
        &self,
        rpc_url: &str,
        carfile_cid: &str,
    ) -> SchedulerResult<()> {
        let url = format!("{}/v1/cache/remove_waiting", rpc_url.trim_end_matches('/'));
        let _: serde_json::Value = self
            .post_json(
                url,
                &RemoveWaitCacheBlockRequest {
                    carfile_cid: carfile_cid.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}
