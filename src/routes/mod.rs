//! HTTP routes

pub mod health;
pub mod metrics;
pub mod upload;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::middleware::{log_requests, require_api_key};
use crate::state::AppState;

/// Multipart framing allowance on top of the configured file size
const BODY_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Build the application router.
///
/// `/health` and `/metrics` are open; `/upload` requires the API key.
pub fn router(state: AppState) -> Router {
    let body_limit = state
        .config
        .ingest
        .max_file_size_bytes()
        .saturating_add(BODY_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let protected = Router::new()
        .route("/upload", post(upload::upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::prometheus_metrics))
        .merge(protected)
        .layer(from_fn_with_state(state.clone(), log_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
