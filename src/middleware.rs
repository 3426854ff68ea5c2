//! Request authentication and logging middleware

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::state::AppState;

const API_KEY_HEADER: &str = "X-API-Key";

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Reject requests whose `X-API-Key` header does not match the configured key
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    if provided != Some(state.config.server.api_key.expose_secret().as_str()) {
        warn!(
            ip = %client_ip(&request),
            path = %request.uri().path(),
            key_present = provided.is_some(),
            "Unauthorized access attempt"
        );
        return Err(AppError::Unauthorized("Invalid or missing API key".into()));
    }

    Ok(next.run(request).await)
}

/// Log every handled request with a level chosen by status class
pub async fn log_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ip = client_ip(&request);

    let response = next.run(request).await;

    state.metrics.inc_requests();
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    match status {
        500.. => error!(%method, %path, status, duration_ms, %ip, "Request handled"),
        400..=499 => warn!(%method, %path, status, duration_ms, %ip, "Request handled"),
        _ => info!(%method, %path, status, duration_ms, %ip, "Request handled"),
    }

    response
}
