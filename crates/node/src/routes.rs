//! Route configuration for the node daemon.

use crate::download;
use crate::handlers;
use crate::state::NodeState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the node router: the scheduler-facing RPC surface plus the
/// public user download edge.
pub fn create_router(state: NodeState) -> Router {
    let rpc_routes = Router::new()
        .route("/v1/blocks/cache", post(handlers::cache_blocks))
        .route("/v1/blocks/delete", post(handlers::delete_blocks))
        .route(
            "/v1/blocks/announce_deleted",
            post(handlers::announce_blocks_deleted),
        )
        .route("/v1/blocks/delete_all", post(handlers::delete_all_blocks))
        .route("/v1/blocks/{cid}", get(handlers::load_block))
        .route("/v1/stat", get(handlers::query_cache_stat))
        .route("/v1/fid/{fid}", get(handlers::get_cid))
        .route("/v1/cid/{cid}", get(handlers::get_fid))
        .route(
            "/v1/cache/remove_waiting",
            post(handlers::remove_wait_cache_block),
        );

    Router::new()
        .merge(rpc_routes)
        .route("/block/get", get(download::get_block))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
