//! Client for the scheduler RPC surface.
//!
//! The pipeline talks to the scheduler through the [`SchedulerApi`] trait
//! so tests can collect results in-process.

use crate::error::{NodeError, NodeResult};
use async_trait::async_trait;
use courier_core::rpc::{
    CacheResult, CacheResultRequest, DeleteBlockRecordsRequest, DeleteBlockRecordsResponse,
    NodeRegistration, UserDownloadResult, UserDownloadResultRequest,
};
use serde::Deserialize;
use std::time::Duration;

/// The slice of the scheduler RPC a node calls.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Post one asynchronous block cache result.
    async fn cache_result(&self, device_id: &str, result: CacheResult) -> NodeResult<()>;

    /// Announce locally deleted blocks; the response maps refused CIDs to
    /// the reason.
    async fn delete_block_records(
        &self,
        device_id: &str,
        cids: Vec<String>,
    ) -> NodeResult<DeleteBlockRecordsResponse>;

    /// Report the outcome of one end-user download.
    async fn user_download_result(
        &self,
        device_id: &str,
        result: UserDownloadResult,
    ) -> NodeResult<()>;
}

#[derive(Debug, Deserialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
}

/// HTTP client for the scheduler.
pub struct SchedulerClient {
    http: reqwest::Client,
    base_url: String,
}

impl SchedulerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static options");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B: serde::Serialize>(&self, path: &str, body: &B) -> NodeResult<reqwest::Response> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NodeError::Rpc(format!("{path}: {status}: {body}")));
        }
        Ok(response)
    }

    /// Register this node with its scheduler.
    pub async fn register(&self, registration: &NodeRegistration) -> NodeResult<()> {
        self.post_json("/v1/node/register", registration).await?;
        Ok(())
    }

    /// Fetch the scheduler's download-grant verifying key.
    pub async fn get_public_key(&self, device_id: &str) -> NodeResult<String> {
        let url = self.url(&format!("/v1/node/public_key?device_id={device_id}"));
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::Rpc(format!("public_key: {status}")));
        }
        let body: PublicKeyResponse = response.json().await?;
        Ok(body.public_key)
    }
}

#[async_trait]
impl SchedulerApi for SchedulerClient {
    async fn cache_result(&self, device_id: &str, result: CacheResult) -> NodeResult<()> {
        let request = CacheResultRequest {
            device_id: device_id.to_string(),
            result,
        };
        self.post_json("/v1/node/cache_result", &request).await?;
        Ok(())
    }

    async fn delete_block_records(
        &self,
        device_id: &str,
        cids: Vec<String>,
    ) -> NodeResult<DeleteBlockRecordsResponse> {
        let request = DeleteBlockRecordsRequest {
            device_id: device_id.to_string(),
            cids,
        };
        let response = self.post_json("/v1/node/blocks/deleted", &request).await?;
        Ok(response.json().await?)
    }

    async fn user_download_result(
        &self,
        device_id: &str,
        result: UserDownloadResult,
    ) -> NodeResult<()> {
        let request = UserDownloadResultRequest {
            device_id: device_id.to_string(),
            result,
        };
        self.post_json("/v1/node/download_result", &request).await?;
        Ok(())
    }
}
