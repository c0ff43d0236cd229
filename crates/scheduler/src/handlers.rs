//! Scheduler HTTP handlers: the operator surface and the node-facing RPC.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use courier_core::CidHash;
use courier_core::rpc::{
    CacheCarfileRequest, CacheErrorInfo, CacheResultRequest, DeleteBlockRecordsRequest,
    NodeRegistration, UserDownloadResultRequest,
};
use courier_metadata::MetadataStore as _;
use courier_metadata::models::{DownloadRow, NodeRow};
use courier_metadata::repos::nodes::NodeAuth;
use courier_signer::SecretKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

// ----- operator surface -----

/// POST /v1/carfiles
pub async fn cache_carfile(
    State(state): State<AppState>,
    Json(req): Json<CacheCarfileRequest>,
) -> ApiResult<()> {
    if req.reliability <= 0 {
        return Err(ApiError::BadRequest("reliability must be positive".to_string()));
    }
    state
        .manager
        .cache_carfile(&req.cid, req.reliability, req.expired_at)
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct CacheSummary {
    pub cache_id: String,
    pub status: String,
    pub is_root: bool,
    pub done_size: i64,
    pub done_blocks: i64,
    pub reliability: i64,
    pub nodes: i64,
}

#[derive(Debug, Serialize)]
pub struct CarfileResponse {
    pub carfile_cid: String,
    pub carfile_hash: String,
    pub need_reliability: i64,
    pub reliability: i64,
    pub total_size: i64,
    pub total_blocks: i64,
    pub cache_count: i64,
    pub nodes: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expired_time: OffsetDateTime,
    pub caches: Vec<CacheSummary>,
}

/// GET /v1/carfiles/{cid}
pub async fn carfile_info(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> ApiResult<Json<CarfileResponse>> {
    let (row, caches) = state.manager.carfile_info(&cid).await?;
    Ok(Json(CarfileResponse {
        carfile_cid: row.carfile_cid,
        carfile_hash: row.carfile_hash,
        need_reliability: row.need_reliability,
        reliability: row.reliability,
        total_size: row.total_size,
        total_blocks: row.total_blocks,
        cache_count: row.cache_count,
        nodes: row.nodes,
        expired_time: row.expired_time,
        caches: caches
            .into_iter()
            .map(|c| CacheSummary {
                cache_id: c.cache_id,
                status: c.status,
                is_root: c.is_root,
                done_size: c.done_size,
                done_blocks: c.done_blocks,
                reliability: c.reliability,
                nodes: c.nodes,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExtendExpiryRequest {
    pub hours: i64,
    #[serde(default)]
    pub cache_id: Option<String>,
}

/// PUT /v1/carfiles/{cid}/expiry
pub async fn extend_carfile_expiry(
    State(state): State<AppState>,
    Path(cid): Path<String>,
    Json(req): Json<ExtendExpiryRequest>,
) -> ApiResult<()> {
    if req.hours <= 0 {
        return Err(ApiError::BadRequest("hours must be positive".to_string()));
    }
    let hash = CidHash::from_cid_str(&cid).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state
        .ctx()
        .metadata
        .extend_cache_expiry(hash.as_str(), req.cache_id.as_deref(), req.hours)
        .await?;
    Ok(())
}

/// DELETE /v1/carfiles/{cid}
pub async fn remove_carfile(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> ApiResult<()> {
    state.manager.remove_carfile(&cid).await?;
    Ok(())
}

/// GET /v1/caches/{cache_id}/errors
pub async fn cache_errors(
    State(state): State<AppState>,
    Path(cache_id): Path<String>,
) -> Json<Vec<CacheErrorInfo>> {
    Json(state.ctx().live.cache_errors(&cache_id))
}

// ----- node-facing RPC -----

/// POST /v1/node/register
pub async fn register_node(
    State(state): State<AppState>,
    Json(reg): Json<NodeRegistration>,
) -> ApiResult<()> {
    let ctx = state.ctx();
    ctx.registry.register(&reg);

    // each node gets its own download-grant signing key, minted on first
    // registration and kept across reconnects
    let private_key = match ctx.metadata.get_node(&reg.device_id).await? {
        Some(existing) if !existing.private_key.is_empty() => existing.private_key,
        _ => SecretKey::generate().to_base64(),
    };

    let row = NodeRow {
        device_id: reg.device_id.clone(),
        last_time: OffsetDateTime::now_utc(),
        geo: String::new(),
        node_type: reg.node_type.to_string(),
        is_online: true,
        address: reg.rpc_url.clone(),
        server_name: ctx.config.server_name.clone(),
        private_key,
        url: reg.download_url.clone(),
        quitted: false,
    };
    ctx.metadata.set_node_info(&row).await?;

    ctx.live.update_node_counters(&reg.device_id, |counters| {
        counters.disk_usage = reg.disk_usage;
        counters.longitude = reg.longitude;
        counters.latitude = reg.latitude;
    });

    tracing::info!(device_id = %reg.device_id, node_type = %reg.node_type, "node registered");
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    pub device_id: String,
}

/// GET /v1/node/public_key?device_id=
///
/// The verifying half of the device's download-grant key, fetched by the
/// node after registration.
pub async fn get_public_key(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<PublicKeyResponse>> {
    let auth = state.ctx().metadata.get_node_auth(&query.device_id).await?;
    Ok(Json(PublicKeyResponse {
        public_key: verifying_key_of(&auth)?,
    }))
}

#[derive(Debug, Serialize)]
pub struct NodeAuthResponse {
    pub device_id: String,
    /// Public URL of the device's download edge.
    pub url: String,
    /// Base64 verifying key for grants served by that edge.
    pub verifying_key: String,
}

/// GET /v1/nodes/{device_id}/auth
///
/// Hands a locator or operator everything needed to direct users at a
/// device: its download URL and the key its grants verify against.
pub async fn node_download_auth(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<NodeAuthResponse>> {
    let auth = state.ctx().metadata.get_node_auth(&device_id).await?;
    let verifying_key = verifying_key_of(&auth)?;
    Ok(Json(NodeAuthResponse {
        device_id: auth.device_id,
        url: auth.url,
        verifying_key,
    }))
}

fn verifying_key_of(auth: &NodeAuth) -> ApiResult<String> {
    let secret = SecretKey::from_base64(&auth.private_key)
        .map_err(|e| ApiError::Internal(format!("stored key for {}: {e}", auth.device_id)))?;
    Ok(secret.public_key().to_base64())
}

/// POST /v1/node/cache_result
///
/// Asynchronous: results land in the durable queue and the worker pool
/// folds them.
pub async fn cache_result(
    State(state): State<AppState>,
    Json(req): Json<CacheResultRequest>,
) -> ApiResult<()> {
    state.ctx().live.push_result(req);
    Ok(())
}

/// POST /v1/node/blocks/deleted
pub async fn delete_block_records(
    State(state): State<AppState>,
    Json(req): Json<DeleteBlockRecordsRequest>,
) -> ApiResult<Json<HashMap<String, String>>> {
    let mut hash_to_cid = HashMap::new();
    let mut hashes = Vec::with_capacity(req.cids.len());
    let mut refused = HashMap::new();

    for cid in &req.cids {
        match CidHash::from_cid_str(cid) {
            Ok(hash) => {
                hash_to_cid.insert(hash.as_str().to_string(), cid.clone());
                hashes.push(hash.as_str().to_string());
            }
            Err(e) => {
                refused.insert(cid.clone(), e.to_string());
            }
        }
    }

    let refused_hashes = state
        .ctx()
        .metadata
        .delete_block_records(&req.device_id, &hashes)
        .await?;
    for (hash, reason) in refused_hashes {
        if let Some(cid) = hash_to_cid.get(&hash) {
            refused.insert(cid.clone(), reason);
        }
    }

    Ok(Json(refused))
}

/// POST /v1/node/download_result
pub async fn user_download_result(
    State(state): State<AppState>,
    Json(req): Json<UserDownloadResultRequest>,
) -> ApiResult<()> {
    let ctx = state.ctx();
    let result = &req.result;

    let record = ctx.live.download_record(result.sn);
    let now = OffsetDateTime::now_utc();

    let row = DownloadRow {
        id: record
            .as_ref()
            .map(|r| format!("dl-{}", r.sn))
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        device_id: req.device_id.clone(),
        block_cid: record.as_ref().map(|r| r.block_cid.clone()).unwrap_or_default(),
        carfile_cid: record
            .as_ref()
            .map(|r| r.carfile_cid.clone())
            .unwrap_or_default(),
        block_size: result.block_size,
        speed: result.download_speed,
        reward: 0,
        status: if result.result { 1 } else { 2 },
        failed_reason: result.failed_reason.clone(),
        client_ip: record.as_ref().map(|r| r.client_ip.clone()).unwrap_or_default(),
        created_time: record.as_ref().map(|r| r.created).unwrap_or(now),
        complete_time: Some(now),
    };
    ctx.metadata.save_block_download_info(&row).await?;

    if result.result {
        ctx.live.update_node_counters(&req.device_id, |counters| {
            counters.download_count += 1;
            counters.total_upload += result.block_size;
        });
    }
    ctx.live.remove_download_record(result.sn);
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub device_id: String,
}

/// POST /v1/node/offline
pub async fn node_offline(
    State(state): State<AppState>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<()> {
    let ctx = state.ctx();
    ctx.registry.set_offline(&req.device_id);
    ctx.metadata
        .set_node_offline(&req.device_id, OffsetDateTime::now_utc())
        .await?;
    tracing::info!(device_id = %req.device_id, "node offline");
    Ok(())
}

/// POST /v1/node/quit
pub async fn node_quit(
    State(state): State<AppState>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<()> {
    state.manager.node_quit(&req.device_id).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub online_nodes: usize,
    pub running_tasks: usize,
    pub waiting_tasks: usize,
    /// Successful cache attempts since this scheduler started.
    pub carfile_success_count: i64,
}

/// GET /v1/health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let ctx = state.ctx();
    ctx.metadata.health_check().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        online_nodes: ctx.registry.online_count(),
        running_tasks: ctx.live.running_count(),
        waiting_tasks: ctx.live.waiting_len(),
        carfile_success_count: ctx.live.carfile_success_count(),
    }))
}
