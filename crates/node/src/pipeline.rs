//! The block ingestion pipeline.
//!
//! A single worker drains the carfile queue head to tail, one carfile to
//! completion before the next. Within an entry it pulls placements in
//! batches, short-circuits blocks already stored locally, fetches the
//! rest through a loader, verifies, persists, resolves links and posts a
//! cache result per block back to the scheduler. Retries stay inside the
//! round: the worker never moves past a carfile while a placement still
//! has retries left.

use crate::device::Device;
use crate::index::CidFidIndex;
use crate::loader::BlockLoader;
use crate::queue::{CarfileQueue, DelayedPlacement};
use crate::scheduler_client::SchedulerApi;
use bytes::Bytes;
use courier_blockstore::BlockStore;
use courier_core::config::CachingConfig;
use courier_core::rpc::{CacheBlocksRequest, CacheResult, CacheStat};
use courier_core::{CidHash, parse_cid, resolve_links, verify_block};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub struct Pipeline {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<CarfileQueue>,
    doing: AtomicUsize,
    store: Arc<dyn BlockStore>,
    index: Arc<CidFidIndex>,
    device: Arc<Device>,
    scheduler: Arc<dyn SchedulerApi>,
    gateway: Arc<dyn BlockLoader>,
    peer: Arc<dyn BlockLoader>,
    config: CachingConfig,
    notify: Notify,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BlockStore>,
        index: Arc<CidFidIndex>,
        device: Arc<Device>,
        scheduler: Arc<dyn SchedulerApi>,
        gateway: Arc<dyn BlockLoader>,
        peer: Arc<dyn BlockLoader>,
        config: CachingConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(CarfileQueue::new()),
                doing: AtomicUsize::new(0),
                store,
                index,
                device,
                scheduler,
                gateway,
                peer,
                config,
                notify: Notify::new(),
            }),
        }
    }

    /// Spawn the single pipeline worker.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                shared.notify.notified().await;
                shared.drain().await;
            }
        })
    }

    /// Enqueue cache requests and answer with the current pipeline stats.
    pub async fn cache_blocks(&self, reqs: Vec<CacheBlocksRequest>) -> CacheStat {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            for req in &reqs {
                queue.append(req);
            }
        }
        self.shared.notify.notify_one();
        self.stats().await
    }

    /// Drop the queued entry for a carfile. Bytes already cached stay put;
    /// in-flight fetches finish and their results are discarded upstream.
    pub fn remove_wait(&self, carfile_hash: &str) -> usize {
        self.shared.queue.lock().unwrap().remove(carfile_hash)
    }

    pub async fn stats(&self) -> CacheStat {
        let shared = &self.shared;
        let cache_block_count = shared.store.key_count().await.unwrap_or(0);
        let disk_usage = shared.device.disk_usage().await.unwrap_or(0.0);
        CacheStat {
            cache_block_count,
            wait_cache_block_num: shared.queue.lock().unwrap().waiting_total(),
            doing_cache_block_num: shared.doing.load(Ordering::Relaxed),
            retry_num: shared.config.retry_limit,
            download_timeout: shared.config.download_timeout_secs,
            disk_usage,
        }
    }

    /// Process everything queued right now. Used by tests; the spawned
    /// worker calls the same path.
    pub async fn drain_now(&self) {
        self.shared.drain().await;
    }
}

impl Shared {
    async fn drain(&self) {
        loop {
            let batch = {
                let mut queue = self.queue.lock().unwrap();
                queue.take_batch(self.config.batch_size)
            };
            if batch.is_empty() {
                return;
            }
            self.load_round(batch).await;
        }
    }

    async fn load_round(&self, batch: Vec<DelayedPlacement>) {
        let mut reqs = self.filter_available(batch).await;

        while !reqs.is_empty() {
            self.doing.store(reqs.len(), Ordering::Relaxed);

            let (peer_reqs, gateway_reqs): (Vec<_>, Vec<_>) =
                reqs.iter().cloned().partition(|r| !r.download_url.is_empty());

            let mut fetched: HashMap<String, Bytes> = HashMap::new();
            if !gateway_reqs.is_empty() {
                for block in self.gateway.load_blocks(&gateway_reqs).await {
                    fetched.insert(block.cid, block.data);
                }
            }
            if !peer_reqs.is_empty() {
                for block in self.peer.load_blocks(&peer_reqs).await {
                    fetched.insert(block.cid, block.data);
                }
            }

            let mut unsatisfied = Vec::new();
            for req in reqs {
                match fetched.remove(&req.cid) {
                    Some(data) => self.handle_fetched(&req, data).await,
                    None => unsatisfied.push(req),
                }
            }

            reqs = Vec::new();
            for mut req in unsatisfied {
                req.retries += 1;
                if req.retries >= self.config.retry_limit {
                    tracing::info!(cid = %req.cid, retries = req.retries, "block fetch exhausted retries");
                    self.post_failure(&req, "fetch timed out".to_string()).await;
                } else {
                    reqs.push(req);
                }
            }
        }

        self.doing.store(0, Ordering::Relaxed);
    }

    /// Short-circuit placements whose CID is already stored: post an
    /// immediate positive result, refreshing the FID index if the
    /// assignment moved. Makes `CacheBlocks` idempotent per (carfile, cid).
    async fn filter_available(&self, reqs: Vec<DelayedPlacement>) -> Vec<DelayedPlacement> {
        let mut remaining = Vec::with_capacity(reqs.len());

        for req in reqs {
            let (cid, hash) = match parse_cid(&req.cid) {
                Ok(cid) => {
                    let hash = CidHash::from_cid(&cid);
                    (cid, hash)
                }
                Err(e) => {
                    self.post_failure(&req, e.to_string()).await;
                    continue;
                }
            };

            let data = match self.store.has(&hash).await {
                Ok(true) => match self.store.get(&hash).await {
                    Ok(data) => data,
                    Err(_) => {
                        remaining.push(req);
                        continue;
                    }
                },
                _ => {
                    remaining.push(req);
                    continue;
                }
            };

            let links = match resolve_links(&cid, &data) {
                Ok(links) => links,
                Err(_) => {
                    // stored bytes we cannot re-read links from; refetch
                    remaining.push(req);
                    continue;
                }
            };

            if self.index.get_fid(&hash).await.ok().flatten() != Some(req.fid) {
                if let Err(e) = self.index.set(&req.cid, &hash, req.fid).await {
                    tracing::warn!(cid = %req.cid, error = %e, "fid re-index failed");
                }
            }

            let links_size: u64 = links.iter().map(|l| l.size).sum();
            let link_cids = links.iter().map(|l| l.cid.to_string()).collect();
            self.post_ok(&req, data.len() as u64, link_cids, links_size).await;
        }

        remaining
    }

    async fn handle_fetched(&self, req: &DelayedPlacement, data: Bytes) {
        let cid = match parse_cid(&req.cid) {
            Ok(cid) => cid,
            Err(e) => {
                self.post_failure(req, e.to_string()).await;
                return;
            }
        };

        // The scheduler trusts nothing it cannot recompute by CID; neither
        // does the node trust its upstream.
        if let Err(e) = verify_block(&cid, &data) {
            tracing::warn!(cid = %req.cid, error = %e, "fetched block failed verification");
            self.post_failure(req, e.to_string()).await;
            return;
        }

        let hash = CidHash::from_cid(&cid);
        if let Err(e) = self.store.put(&hash, data.clone()).await {
            tracing::error!(cid = %req.cid, error = %e, "block persist failed");
            self.post_failure(req, e.to_string()).await;
            return;
        }
        if let Err(e) = self.index.set(&req.cid, &hash, req.fid).await {
            tracing::warn!(cid = %req.cid, error = %e, "fid index update failed");
        }

        match resolve_links(&cid, &data) {
            Ok(links) => {
                let links_size: u64 = links.iter().map(|l| l.size).sum();
                let link_cids = links.iter().map(|l| l.cid.to_string()).collect();
                self.post_ok(req, data.len() as u64, link_cids, links_size).await;
            }
            Err(e) => {
                self.post_failure(req, e.to_string()).await;
            }
        }
    }

    async fn post_ok(&self, req: &DelayedPlacement, block_size: u64, links: Vec<String>, links_size: u64) {
        let result = CacheResult {
            cid: req.cid.clone(),
            is_ok: true,
            msg: String::new(),
            links,
            block_size,
            links_size,
            carfile_hash: req.carfile_hash.clone(),
            cache_id: req.cache_id.clone(),
        };
        self.send(result).await;
    }

    async fn post_failure(&self, req: &DelayedPlacement, msg: String) {
        let result = CacheResult {
            cid: req.cid.clone(),
            is_ok: false,
            msg,
            links: Vec::new(),
            block_size: 0,
            links_size: 0,
            carfile_hash: req.carfile_hash.clone(),
            cache_id: req.cache_id.clone(),
        };
        self.send(result).await;
    }

    async fn send(&self, result: CacheResult) {
        if let Err(e) = self
            .scheduler
            .cache_result(&self.device.device_id, result)
            .await
        {
            tracing::error!(error = %e, "posting cache result failed");
        }
    }
}

