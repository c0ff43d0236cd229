//! Cache attempts: one bounded effort to add a unit of replication for a
//! carfile, plus the block planning and dispatch that drives it.

use crate::carfile::SchedulerCtx;
use crate::dispatcher::NodeDispatcher as _;
use crate::error::SchedulerResult;
use courier_core::rpc::{BlockPlacement, CacheBlocksRequest};
use courier_core::{BlockId, CacheStatus, CidHash, parse_cid};
use courier_metadata::MetadataStore as _;
use courier_metadata::models::{BlockRow, CacheRow};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;

/// In-memory mirror of one cache attempt row.
#[derive(Clone, Debug)]
pub struct CacheAttempt {
    pub cache_id: String,
    pub carfile_hash: String,
    pub is_root: bool,
    pub status: CacheStatus,
    pub done_size: i64,
    pub done_blocks: i64,
    pub total_size: i64,
    pub total_blocks: i64,
    pub reliability: i64,
    pub nodes: i64,
    pub failed_blocks: i64,
    pub expired_at: OffsetDateTime,
}

impl CacheAttempt {
    pub fn new(
        cache_id: String,
        carfile_hash: String,
        is_root: bool,
        expired_at: OffsetDateTime,
    ) -> Self {
        Self {
            cache_id,
            carfile_hash,
            is_root,
            status: CacheStatus::Running,
            done_size: 0,
            done_blocks: 0,
            total_size: 0,
            // the root block is known from the start
            total_blocks: 1,
            reliability: 0,
            nodes: 0,
            failed_blocks: 0,
            expired_at,
        }
    }

    pub fn from_row(row: &CacheRow) -> Self {
        Self {
            cache_id: row.cache_id.clone(),
            carfile_hash: row.carfile_hash.clone(),
            is_root: row.is_root,
            status: CacheStatus::parse(&row.status).unwrap_or(CacheStatus::Running),
            done_size: row.done_size,
            done_blocks: row.done_blocks,
            total_size: row.total_size,
            total_blocks: row.total_blocks,
            reliability: row.reliability,
            nodes: row.nodes,
            failed_blocks: 0,
            expired_at: row.expired_time,
        }
    }

    pub fn to_row(&self) -> CacheRow {
        CacheRow {
            cache_id: self.cache_id.clone(),
            carfile_hash: self.carfile_hash.clone(),
            status: self.status.as_str().to_string(),
            is_root: self.is_root,
            done_size: self.done_size,
            done_blocks: self.done_blocks,
            total_size: self.total_size,
            total_blocks: self.total_blocks,
            reliability: self.reliability,
            nodes: self.nodes,
            expired_time: self.expired_at,
            end_time: None,
        }
    }
}

/// A block planned onto a node, ready to persist and dispatch.
#[derive(Clone, Debug)]
pub struct PlannedBlock {
    pub row: BlockRow,
    /// RPC URL of the chosen target; empty when no node qualified.
    pub target_rpc_url: String,
    /// RPC URL of the peer source; empty means the IPFS gateway.
    pub source_rpc_url: String,
}

/// Assign target nodes, sources and FIDs to a set of block CIDs.
///
/// Root caches place onto candidates only; other attempts seed from any
/// node already holding the block successfully and place anywhere. A CID
/// with no eligible target keeps an empty device: the row stays pending
/// and the attempt's lease counts it down to timeout.
pub async fn allocate_blocks(
    ctx: &SchedulerCtx,
    cache_id: &str,
    carfile_hash: &str,
    is_root: bool,
    cids: &[(String, Option<String>)],
) -> SchedulerResult<Vec<PlannedBlock>> {
    // (cid, hash, existing id, source device, source url)
    let mut prepared = Vec::with_capacity(cids.len());
    for (cid, existing_id) in cids {
        let hash = CidHash::from_cid(&parse_cid(cid)?);

        let mut source_device = String::new();
        let mut source_url = String::new();
        if !is_root {
            let holders = ctx.metadata.get_blocks_with_hash(hash.as_str()).await?;
            for holder in holders.values() {
                if let Some(node) = ctx.registry.get(&holder.device_id)
                    && node.online
                {
                    source_device = node.device_id.clone();
                    source_url = node.rpc_url.clone();
                    break;
                }
            }
        }

        prepared.push((cid.clone(), hash, existing_id.clone(), source_device, source_url));
    }

    // choose targets, bucketing per device so FID ranges stay contiguous
    let mut per_device: HashMap<String, Vec<usize>> = HashMap::new();
    let mut targets: HashMap<String, crate::nodes::NodeHandle> = HashMap::new();
    let mut unassigned = Vec::new();

    for (idx, (cid, _, _, source_device, _)) in prepared.iter().enumerate() {
        let mut exclude = HashSet::new();
        if !source_device.is_empty() {
            exclude.insert(source_device.clone());
        }

        match ctx.registry.select_targets(1, is_root, &exclude).pop() {
            Some(node) => {
                per_device.entry(node.device_id.clone()).or_default().push(idx);
                targets.entry(node.device_id.clone()).or_insert(node);
            }
            None => {
                tracing::warn!(cid = %cid, cache_id = %cache_id, "no suitable node for block");
                unassigned.push(idx);
            }
        }
    }

    let mut planned: Vec<Option<PlannedBlock>> = vec![None; prepared.len()];

    for (device_id, indices) in per_device {
        let (mut fid, _) = ctx.live.next_fid_range(&device_id, indices.len() as i64);
        let node = &targets[&device_id];

        for idx in indices {
            let (cid, hash, existing_id, source_device, source_url) = &prepared[idx];
            planned[idx] = Some(PlannedBlock {
                row: block_row(
                    existing_id.clone(),
                    cache_id,
                    carfile_hash,
                    cid,
                    hash,
                    &device_id,
                    fid,
                    source_device,
                ),
                target_rpc_url: node.rpc_url.clone(),
                source_rpc_url: source_url.clone(),
            });
            fid += 1;
        }
    }

    for idx in unassigned {
        let (cid, hash, existing_id, source_device, _) = &prepared[idx];
        planned[idx] = Some(PlannedBlock {
            row: block_row(
                existing_id.clone(),
                cache_id,
                carfile_hash,
                cid,
                hash,
                "",
                0,
                source_device,
            ),
            target_rpc_url: String::new(),
            source_rpc_url: String::new(),
        });
    }

    Ok(planned.into_iter().flatten().collect())
}

#[allow(clippy::too_many_arguments)]
fn block_row(
    existing_id: Option<String>,
    cache_id: &str,
    carfile_hash: &str,
    cid: &str,
    hash: &CidHash,
    device_id: &str,
    fid: i64,
    source: &str,
) -> BlockRow {
    BlockRow {
        id: existing_id.unwrap_or_else(|| BlockId::generate().as_str().to_string()),
        cache_id: cache_id.to_string(),
        carfile_hash: carfile_hash.to_string(),
        cid: cid.to_string(),
        cid_hash: hash.as_str().to_string(),
        device_id: device_id.to_string(),
        fid,
        size: 0,
        reliability: 0,
        source: source.to_string(),
        status: CacheStatus::Pending.as_str().to_string(),
        end_time: None,
    }
}

/// Send planned blocks to their nodes, one request per (target, source)
/// pair, and fold the returned pipeline stats into the registry. Returns
/// how many blocks went out.
pub async fn dispatch_planned(
    ctx: &SchedulerCtx,
    cache_id: &str,
    carfile_hash: &str,
    planned: &[PlannedBlock],
) -> usize {
    let mut groups: HashMap<(String, String), (String, Vec<BlockPlacement>)> = HashMap::new();
    for block in planned {
        if block.row.device_id.is_empty() {
            continue;
        }
        groups
            .entry((block.row.device_id.clone(), block.source_rpc_url.clone()))
            .or_insert_with(|| (block.target_rpc_url.clone(), Vec::new()))
            .1
            .push(BlockPlacement {
                cid: block.row.cid.clone(),
                fid: block.row.fid,
            });
    }

    let mut dispatched = 0;
    for ((device_id, source_url), (target_url, block_infos)) in groups {
        let count = block_infos.len();
        let request = CacheBlocksRequest {
            block_infos,
            download_url: source_url,
            download_token: String::new(),
            carfile_hash: carfile_hash.to_string(),
            cache_id: cache_id.to_string(),
        };

        match ctx.dispatcher.cache_blocks(&target_url, vec![request]).await {
            Ok(stat) => {
                ctx.registry.update_stat(&device_id, stat);
                dispatched += count;
            }
            Err(e) => {
                tracing::warn!(device_id = %device_id, cache_id = %cache_id, error = %e,
                    "dispatching cache blocks failed");
            }
        }
    }
    dispatched
}
