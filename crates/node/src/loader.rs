//! Block fetch strategies: IPFS gateway or a peer node.
//!
//! A loader takes a round of placements and returns whatever blocks it
//! managed to fetch; the pipeline owns retry accounting for the rest.

use crate::queue::DelayedPlacement;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::time::Duration;

/// A block fetched from upstream, not yet verified.
#[derive(Clone, Debug)]
pub struct FetchedBlock {
    pub cid: String,
    pub data: Bytes,
}

#[async_trait]
pub trait BlockLoader: Send + Sync {
    async fn load_blocks(&self, reqs: &[DelayedPlacement]) -> Vec<FetchedBlock>;
}

/// Fetches raw blocks from an IPFS HTTP gateway.
pub struct GatewayLoader {
    http: reqwest::Client,
    gateway: String,
}

impl GatewayLoader {
    pub fn new(gateway: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static options");
        Self {
            http,
            gateway: gateway.into(),
        }
    }

    async fn fetch_one(&self, cid: &str) -> Option<Bytes> {
        let url = format!("{}/ipfs/{}?format=raw", self.gateway.trim_end_matches('/'), cid);
        let response = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.ipld.raw")
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => resp.bytes().await.ok(),
            Ok(resp) => {
                tracing::debug!(cid = %cid, status = %resp.status(), "gateway fetch refused");
                None
            }
            Err(e) => {
                tracing::debug!(cid = %cid, error = %e, "gateway fetch failed");
                None
            }
        }
    }
}

#[async_trait]
impl BlockLoader for GatewayLoader {
    async fn load_blocks(&self, reqs: &[DelayedPlacement]) -> Vec<FetchedBlock> {
        let fetches = reqs.iter().map(|req| async {
            self.fetch_one(&req.cid).await.map(|data| FetchedBlock {
                cid: req.cid.clone(),
                data,
            })
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }
}

/// Fetches blocks from a peer node's RPC surface, presenting the download
/// token the scheduler attached to the placement.
pub struct PeerLoader {
    http: reqwest::Client,
}

impl PeerLoader {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static options");
        Self { http }
    }

    async fn fetch_one(&self, req: &DelayedPlacement) -> Option<Bytes> {
        let url = format!(
            "{}/v1/blocks/{}",
            req.download_url.trim_end_matches('/'),
            req.cid
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&req.download_token)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => resp.bytes().await.ok(),
            Ok(resp) => {
                tracing::debug!(cid = %req.cid, peer = %req.download_url, status = %resp.status(), "peer fetch refused");
                None
            }
            Err(e) => {
                tracing::debug!(cid = %req.cid, peer = %req.download_url, error = %e, "peer fetch failed");
                None
            }
        }
    }
}

#[async_trait]
impl BlockLoader for PeerLoader {
    async fn load_blocks(&self, reqs: &[DelayedPlacement]) -> Vec<FetchedBlock> {
        let fetches = reqs.iter().map(|req| async {
            self.fetch_one(req).await.map(|data| FetchedBlock {
                cid: req.cid.clone(),
                data,
            })
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn placement(cid: &str, url: &str) -> DelayedPlacement {
        DelayedPlacement {
            cid: cid.to_string(),
            fid: 1,
            retries: 0,
            download_url: url.to_string(),
            download_token: "tok".to_string(),
            carfile_hash: "aa".to_string(),
            cache_id: "aa_1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_gateway_loader_fetches_and_skips_missing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ipfs/bafygood");
                then.status(200).body("blockbytes");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ipfs/bafymissing");
                then.status(404);
            })
            .await;

        let loader = GatewayLoader::new(server.base_url(), Duration::from_secs(2));
        let blocks = loader
            .load_blocks(&[placement("bafygood", ""), placement("bafymissing", "")])
            .await;

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].cid, "bafygood");
        assert_eq!(blocks[0].data, Bytes::from_static(b"blockbytes"));
    }

    #[tokio::test]
    async fn test_peer_loader_presents_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/blocks/bafypeer")
                    .header("authorization", "Bearer tok");
                then.status(200).body("peerbytes");
            })
            .await;

        let loader = PeerLoader::new(Duration::from_secs(2));
        let blocks = loader
            .load_blocks(&[placement("bafypeer", &server.base_url())])
            .await;

        mock.assert_async().await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, Bytes::from_static(b"peerbytes"));
    }
}
