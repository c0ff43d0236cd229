//! Node RPC handlers.

use crate::error::{ApiError, ApiResult};
use crate::scheduler_client::SchedulerApi as _;
use crate::state::NodeState;
use courier_blockstore::BlockStore as _;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use courier_core::CidHash;
use courier_core::rpc::{
    BlockOperationResult, CacheBlocksRequest, CacheStat, DeleteBlocksRequest,
    RemoveWaitCacheBlockRequest,
};
use serde::Serialize;

/// POST /v1/blocks/cache
pub async fn cache_blocks(
    State(state): State<NodeState>,
    Json(reqs): Json<Vec<CacheBlocksRequest>>,
) -> Json<CacheStat> {
    tracing::info!(requests = reqs.len(), "cache blocks");
    Json(state.pipeline.cache_blocks(reqs).await)
}

/// GET /v1/stat
pub async fn query_cache_stat(State(state): State<NodeState>) -> Json<CacheStat> {
    Json(state.pipeline.stats().await)
}

/// POST /v1/blocks/delete
pub async fn delete_blocks(
    State(state): State<NodeState>,
    Json(req): Json<DeleteBlocksRequest>,
) -> ApiResult<Json<Vec<BlockOperationResult>>> {
    tracing::info!(cids = req.cids.len(), "delete blocks");
    let mut failed = Vec::new();

    for cid in &req.cids {
        let hash = match CidHash::from_cid_str(cid) {
            Ok(hash) => hash,
            Err(e) => {
                failed.push(BlockOperationResult {
                    cid: cid.clone(),
                    err_msg: e.to_string(),
                });
                continue;
            }
        };

        match state.store.delete(&hash).await {
            Ok(()) => {
                let _ = state.index.remove(&hash).await;
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(cid = %cid, "delete: block not present");
            }
            Err(e) => {
                failed.push(BlockOperationResult {
                    cid: cid.clone(),
                    err_msg: e.to_string(),
                });
            }
        }
    }

    Ok(Json(failed))
}

/// POST /v1/blocks/announce_deleted
///
/// Tell the scheduler first; delete locally whatever it released.
pub async fn announce_blocks_deleted(
    State(state): State<NodeState>,
    Json(req): Json<DeleteBlocksRequest>,
) -> ApiResult<Json<Vec<BlockOperationResult>>> {
    let refused = state
        .scheduler
        .delete_block_records(&state.device.device_id, req.cids.clone())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut failed: Vec<BlockOperationResult> = refused
        .iter()
        .map(|(cid, err)| BlockOperationResult {
            cid: cid.clone(),
            err_msg: err.clone(),
        })
        .collect();

    for cid in &req.cids {
        if refused.contains_key(cid) {
            continue;
        }
        let Ok(hash) = CidHash::from_cid_str(cid) else {
            continue;
        };
        match state.store.delete(&hash).await {
            Ok(()) => {
                let _ = state.index.remove(&hash).await;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => failed.push(BlockOperationResult {
                cid: cid.clone(),
                err_msg: e.to_string(),
            }),
        }
    }

    Ok(Json(failed))
}

/// GET /v1/blocks/{cid}: peer block fetch and the LoadBlock RPC.
pub async fn load_block(
    State(state): State<NodeState>,
    Path(cid): Path<String>,
) -> ApiResult<Response> {
    let hash = CidHash::from_cid_str(&cid).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let data = state.store.get(&hash).await?;

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, data.len())
        .body(axum::body::Body::from(data))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

#[derive(Debug, Serialize)]
pub struct CidResponse {
    pub cid: String,
}

/// GET /v1/fid/{fid}
pub async fn get_cid(
    State(state): State<NodeState>,
    Path(fid): Path<i64>,
) -> ApiResult<Json<CidResponse>> {
    match state.index.get_cid(fid).await.map_err(ApiError::from)? {
        Some(cid) => Ok(Json(CidResponse { cid })),
        None => Err(ApiError::NotFound(format!("fid {fid}"))),
    }
}

#[derive(Debug, Serialize)]
pub struct FidResponse {
    pub fid: i64,
}

/// GET /v1/cid/{cid}
pub async fn get_fid(
    State(state): State<NodeState>,
    Path(cid): Path<String>,
) -> ApiResult<Json<FidResponse>> {
    let hash = CidHash::from_cid_str(&cid).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    match state.index.get_fid(&hash).await.map_err(ApiError::from)? {
        Some(fid) => Ok(Json(FidResponse { fid })),
        None => Err(ApiError::NotFound(cid)),
    }
}

/// POST /v1/blocks/delete_all
pub async fn delete_all_blocks(State(state): State<NodeState>) -> ApiResult<()> {
    tracing::warn!("deleting all local blocks");
    for key in state.store.iter_keys().await? {
        match state.store.delete(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    state.index.clear().await.map_err(ApiError::from)?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub removed_placements: usize,
}

/// POST /v1/cache/remove_waiting
pub async fn remove_wait_cache_block(
    State(state): State<NodeState>,
    Json(req): Json<RemoveWaitCacheBlockRequest>,
) -> ApiResult<Json<RemovedResponse>> {
    let hash = CidHash::from_cid_str(&req.carfile_cid)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let removed = state.pipeline.remove_wait(hash.as_str());
    tracing::info!(carfile = %req.carfile_cid, removed, "dropped waiting cache entry");
    Ok(Json(RemovedResponse {
        removed_placements: removed,
    }))
}
