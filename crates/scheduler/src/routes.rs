//! Route configuration for the scheduler daemon.

use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::routing::{delete, get, post, put};
use tower_http::trace::TraceLayer;

/// Create the scheduler router.
pub fn create_router(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/carfiles", post(handlers::cache_carfile))
        .route("/v1/carfiles/{cid}", get(handlers::carfile_info))
        .route("/v1/carfiles/{cid}", delete(handlers::remove_carfile))
        .route(
            "/v1/carfiles/{cid}/expiry",
            put(handlers::extend_carfile_expiry),
        )
        .route("/v1/caches/{cache_id}/errors", get(handlers::cache_errors))
        .route("/v1/nodes/{device_id}/auth", get(handlers::node_download_auth));

    let node_routes = Router::new()
        .route("/v1/node/register", post(handlers::register_node))
        .route("/v1/node/public_key", get(handlers::get_public_key))
        .route("/v1/node/cache_result", post(handlers::cache_result))
        .route("/v1/node/blocks/deleted", post(handlers::delete_block_records))
        .route("/v1/node/download_result", post(handlers::user_download_result))
        .route("/v1/node/offline", post(handlers::node_offline))
        .route("/v1/node/quit", post(handlers::node_quit));

    Router::new()
        .merge(operator_routes)
        .merge(node_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
