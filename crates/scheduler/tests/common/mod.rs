//! Shared harness for scheduler integration tests: a simulated node
//! fleet wired straight into the live store, plus DAG fixtures.

use async_trait::async_trait;
use courier_core::hash::{DAG_PB_CODEC, RAW_CODEC};
use courier_core::config::SchedulerConfig;
use courier_core::rpc::{
    BlockOperationResult, CacheBlocksRequest, CacheResult, CacheResultRequest, CacheStat,
    NodeRegistration, NodeType,
};
use courier_core::{BlockLink, build_pb_node, cid_from_bytes};
use courier_metadata::{MetadataStore as _, SqliteStore};
use courier_scheduler::carfile::{CarfileManager, SchedulerCtx};
use courier_scheduler::dispatcher::NodeDispatcher;
use courier_scheduler::error::SchedulerResult;
use courier_scheduler::{LiveStore, NodeRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One simulated block: its size and declared links.
#[derive(Clone, Debug)]
pub struct SimBlock {
    pub size: u64,
    pub links: Vec<String>,
    pub links_size: u64,
}

/// A fleet simulator standing in for node RPC. Every dispatched
/// placement is answered synchronously through the live result queue.
pub struct SimNode {
    live: Arc<LiveStore>,
    blocks: Mutex<HashMap<String, SimBlock>>,
    failures: Mutex<HashMap<String, u32>>,
    silent: Mutex<HashSet<String>>,
    pub requests: Mutex<Vec<(String, CacheBlocksRequest)>>,
    pub deleted: Mutex<Vec<(String, Vec<String>)>>,
}

impl SimNode {
    pub fn new(live: Arc<LiveStore>) -> Self {
        Self {
            live,
            blocks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            silent: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn insert_block(&self, cid: &str, block: SimBlock) {
        self.blocks.lock().unwrap().insert(cid.to_string(), block);
    }

    /// Make the first `count` dispatches of a CID come back negative.
    pub fn fail_times(&self, cid: &str, count: u32) {
        self.failures.lock().unwrap().insert(cid.to_string(), count);
    }

    /// Never answer for a CID; its placements run into the lease timeout.
    pub fn silence(&self, cid: &str) {
        self.silent.lock().unwrap().insert(cid.to_string());
    }

    pub fn requests_for(&self, device_id: &str) -> Vec<CacheBlocksRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(device, _)| device == device_id)
            .map(|(_, req)| req.clone())
            .collect()
    }
}

fn device_of(rpc_url: &str) -> String {
    rpc_url.trim_start_matches("sim://").to_string()
}

#[async_trait]
impl NodeDispatcher for SimNode {
    async fn cache_blocks(
        &self,
        rpc_url: &str,
        reqs: Vec<CacheBlocksRequest>,
    ) -> SchedulerResult<CacheStat> {
        let device_id = device_of(rpc_url);

        for req in reqs {
            self.requests
                .lock()
                .unwrap()
                .push((device_id.clone(), req.clone()));

            for placement in &req.block_infos {
                if self.silent.lock().unwrap().contains(&placement.cid) {
                    continue;
                }

                let failing = {
                    let mut failures = self.failures.lock().unwrap();
                    match failures.get_mut(&placement.cid) {
                        Some(remaining) if *remaining > 0 => {
                            *remaining -= 1;
                            true
                        }
                        _ => false,
                    }
                };

                let block = self.blocks.lock().unwrap().get(&placement.cid).cloned();
                let result = match (failing, block) {
                    (true, _) => CacheResult {
                        cid: placement.cid.clone(),
                        is_ok: false,
                        msg: "fetch timed out".to_string(),
                        links: Vec::new(),
                        block_size: 0,
                        links_size: 0,
                        carfile_hash: req.carfile_hash.clone(),
                        cache_id: req.cache_id.clone(),
                    },
                    (false, Some(block)) => CacheResult {
                        cid: placement.cid.clone(),
                        is_ok: true,
                        msg: String::new(),
                        links: block.links.clone(),
                        block_size: block.size,
                        links_size: block.links_size,
                        carfile_hash: req.carfile_hash.clone(),
                        cache_id: req.cache_id.clone(),
                    },
                    (false, None) => CacheResult {
                        cid: placement.cid.clone(),
                        is_ok: false,
                        msg: "block not found upstream".to_string(),
                        links: Vec::new(),
                        block_size: 0,
                        links_size: 0,
                        carfile_hash: req.carfile_hash.clone(),
                        cache_id: req.cache_id.clone(),
                    },
                };

                self.live.push_result(CacheResultRequest {
                    device_id: device_id.clone(),
                    result,
                });
            }
        }

        Ok(CacheStat::default())
    }

    async fn delete_blocks(
        &self,
        rpc_url: &str,
        cids: Vec<String>,
    ) -> SchedulerResult<Vec<BlockOperationResult>> {
        self.deleted.lock().unwrap().push((device_of(rpc_url), cids));
        Ok(Vec::new())
    }

    async fn remove_wait_cache_block(
        &self,
        _rpc_url: &str,
        _carfile_cid: &str,
    ) -> SchedulerResult<()> {
        Ok(())
    }
}

/// A DAG fixture registered into the simulator: a dag-pb root over raw
/// children.
pub struct SimDag {
    pub root_cid: String,
    pub root_hash: String,
    pub root_size: u64,
    pub children: Vec<String>,
    pub total_size: u64,
}

pub fn make_dag(sim: &SimNode, tag: &str, child_count: usize) -> SimDag {
    let mut children = Vec::new();
    let mut links = Vec::new();
    let mut links_size = 0u64;
    let mut total_size = 0u64;

    for i in 0..child_count {
        let payload = format!("{tag}-child-{i}");
        let cid = cid_from_bytes(RAW_CODEC, payload.as_bytes());
        let size = payload.len() as u64;

        sim.insert_block(
            &cid.to_string(),
            SimBlock {
                size,
                links: Vec::new(),
                links_size: 0,
            },
        );
        links.push(BlockLink { cid, size });
        children.push(links.last().unwrap().cid.to_string());
        links_size += size;
        total_size += size;
    }

    let root_bytes = build_pb_node(tag.as_bytes(), &links);
    let root_cid = cid_from_bytes(DAG_PB_CODEC, &root_bytes);
    let root_size = root_bytes.len() as u64;
    total_size += root_size;

    sim.insert_block(
        &root_cid.to_string(),
        SimBlock {
            size: root_size,
            links: children.clone(),
            links_size,
        },
    );

    let root_hash = courier_core::CidHash::from_cid(&root_cid);
    SimDag {
        root_cid: root_cid.to_string(),
        root_hash: root_hash.as_str().to_string(),
        root_size,
        children,
        total_size,
    }
}

pub struct Harness {
    pub manager: Arc<CarfileManager>,
    pub ctx: Arc<SchedulerCtx>,
    pub sim: Arc<SimNode>,
    _temp: tempfile::TempDir,
}

pub async fn harness(per_block_timeout_secs: u64) -> Harness {
    let temp = tempfile::tempdir().unwrap();

    let mut config = SchedulerConfig::for_testing();
    config.caching.per_block_timeout_secs = per_block_timeout_secs;

    let metadata: Arc<dyn courier_metadata::MetadataStore> = Arc::new(
        SqliteStore::new(temp.path().join("meta.db"), &config.area)
            .await
            .unwrap(),
    );

    let live = Arc::new(LiveStore::new(config.caching.cache_error_ttl()));
    let sim = Arc::new(SimNode::new(live.clone()));

    let ctx = Arc::new(SchedulerCtx {
        metadata,
        live,
        registry: Arc::new(NodeRegistry::new()),
        dispatcher: sim.clone(),
        config,
    });

    let manager = CarfileManager::new(ctx.clone());
    manager.run();

    Harness {
        manager,
        ctx,
        sim,
        _temp: temp,
    }
}

impl Harness {
    pub fn register_node(&self, device_id: &str, node_type: NodeType, disk_usage: f64) {
        self.ctx.registry.register(&NodeRegistration {
            device_id: device_id.to_string(),
            node_type,
            rpc_url: format!("sim://{device_id}"),
            download_url: format!("sim://{device_id}/block/get"),
            disk_usage,
            disk_space: 1.0,
            bandwidth_up: 0,
            bandwidth_down: 0,
            longitude: 0.0,
            latitude: 0.0,
        });
    }
}

/// Poll until a condition holds, panicking after 20 seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Future expiry for admitted carfiles.
pub fn expiry() -> time::OffsetDateTime {
    time::OffsetDateTime::now_utc() + time::Duration::hours(1)
}

/// Checks the record-keeping invariants for a carfile.
pub async fn assert_record_invariants(ctx: &SchedulerCtx, carfile_hash: &str) {
    let data = ctx
        .metadata
        .get_carfile_info(carfile_hash)
        .await
        .unwrap()
        .expect("carfile row exists");
    let caches = ctx.metadata.get_caches_of_carfile(carfile_hash).await.unwrap();

    // the carfile's reliability is the sum of its successful attempts'
    let success_sum: i64 = caches
        .iter()
        .filter(|c| c.status == "success")
        .map(|c| c.reliability)
        .sum();
    assert_eq!(data.reliability, success_sum, "reliability sum invariant");

    for cache in &caches {
        let blocks = ctx
            .metadata
            .get_blocks_with_status(&cache.cache_id, "success")
            .await
            .unwrap();
        for block in &blocks {
            assert!(block.size > 0, "successful block has positive size");
            assert!(!block.device_id.is_empty(), "successful block has a device");
        }

        // no duplicate (cache_id, cid_hash) rows
        let mut seen = HashSet::new();
        for status in ["pending", "success", "failed", "timeout", "restore"] {
            for block in ctx
                .metadata
                .get_blocks_with_status(&cache.cache_id, status)
                .await
                .unwrap()
            {
                assert!(
                    seen.insert(block.cid_hash.clone()),
                    "duplicate block row for {}",
                    block.cid_hash
                );
            }
        }
    }

}

/// FID ranges handed to a device inside one request are contiguous and,
/// per device, strictly increasing across requests.
pub fn assert_contiguous_fids(sim: &SimNode) {
    let mut last_per_device: HashMap<String, i64> = HashMap::new();
    for (device, req) in sim.requests.lock().unwrap().iter() {
        let mut fids: Vec<i64> = req
            .block_infos
            .iter()
            .map(|b| b.fid)
            .filter(|fid| *fid > 0)
            .collect();
        fids.sort_unstable();
        for pair in fids.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "contiguous fid reservation");
        }
        if let (Some(first), Some(last)) = (fids.first(), fids.last()) {
            let seen = last_per_device.entry(device.clone()).or_insert(0);
            assert!(*first > *seen, "fids strictly increase per device");
            *seen = *last;
        }
    }
}
