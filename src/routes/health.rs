//! Health endpoint

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::tasks::backup::ManagerState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub backup_manager: ManagerState,
}

/// GET /health
///
/// Returns 200 while the server is running, with the backup worker state
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        backup_manager: state.backup.state(),
    })
}
