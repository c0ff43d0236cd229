//! Shared fixtures for node integration tests.

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::hash::{DAG_PB_CODEC, RAW_CODEC};
use courier_core::rpc::{CacheResult, DeleteBlockRecordsResponse, UserDownloadResult};
use courier_core::{BlockLink, build_pb_node, cid_from_bytes};
use courier_node::loader::{BlockLoader, FetchedBlock};
use courier_node::queue::DelayedPlacement;
use courier_node::scheduler_client::SchedulerApi;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A two-level DAG fixture: a dag-pb root over raw children.
pub struct DagFixture {
    pub root_cid: String,
    pub root_bytes: Bytes,
    pub children: Vec<(String, Bytes)>,
}

pub fn build_dag(children_payloads: &[&[u8]]) -> DagFixture {
    let children: Vec<(String, Bytes)> = children_payloads
        .iter()
        .map(|payload| {
            let cid = cid_from_bytes(RAW_CODEC, payload);
            (cid.to_string(), Bytes::copy_from_slice(payload))
        })
        .collect();

    let links: Vec<BlockLink> = children_payloads
        .iter()
        .zip(&children)
        .map(|(payload, (cid, _))| BlockLink {
            cid: courier_core::parse_cid(cid).unwrap(),
            size: payload.len() as u64,
        })
        .collect();

    let root_bytes = Bytes::from(build_pb_node(b"fixture root", &links));
    let root_cid = cid_from_bytes(DAG_PB_CODEC, &root_bytes).to_string();

    DagFixture {
        root_cid,
        root_bytes,
        children,
    }
}

/// Collects posted cache results instead of a live scheduler.
#[derive(Default)]
pub struct ResultSink {
    pub results: Mutex<Vec<CacheResult>>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<CacheResult> {
        std::mem::take(&mut self.results.lock().unwrap())
    }
}

#[async_trait]
impl SchedulerApi for ResultSink {
    async fn cache_result(
        &self,
        _device_id: &str,
        result: CacheResult,
    ) -> courier_node::NodeResult<()> {
        self.results.lock().unwrap().push(result);
        Ok(())
    }

    async fn delete_block_records(
        &self,
        _device_id: &str,
        _cids: Vec<String>,
    ) -> courier_node::NodeResult<DeleteBlockRecordsResponse> {
        Ok(DeleteBlockRecordsResponse::new())
    }

    async fn user_download_result(
        &self,
        _device_id: &str,
        _result: UserDownloadResult,
    ) -> courier_node::NodeResult<()> {
        Ok(())
    }
}

/// Serves canned blocks, optionally failing the first N rounds per CID.
#[derive(Default)]
pub struct StubLoader {
    blocks: Mutex<HashMap<String, Bytes>>,
    fail_rounds: Mutex<HashMap<String, u32>>,
    pub rounds: AtomicUsize,
}

impl StubLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cid: &str, data: Bytes) {
        self.blocks.lock().unwrap().insert(cid.to_string(), data);
    }

    pub fn insert_dag(&self, dag: &DagFixture) {
        self.insert(&dag.root_cid, dag.root_bytes.clone());
        for (cid, data) in &dag.children {
            self.insert(cid, data.clone());
        }
    }

    pub fn fail_first_rounds(&self, cid: &str, rounds: u32) {
        self.fail_rounds
            .lock()
            .unwrap()
            .insert(cid.to_string(), rounds);
    }

    pub fn rounds_run(&self) -> usize {
        self.rounds.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlockLoader for StubLoader {
    async fn load_blocks(&self, reqs: &[DelayedPlacement]) -> Vec<FetchedBlock> {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        let blocks = self.blocks.lock().unwrap();
        let mut fail_rounds = self.fail_rounds.lock().unwrap();

        reqs.iter()
            .filter_map(|req| {
                if let Some(remaining) = fail_rounds.get_mut(&req.cid)
                    && *remaining > 0
                {
                    *remaining -= 1;
                    return None;
                }
                blocks.get(&req.cid).map(|data| FetchedBlock {
                    cid: req.cid.clone(),
                    data: data.clone(),
                })
            })
            .collect()
    }
}
