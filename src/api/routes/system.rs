//! Engine-wide handlers: pause, status, servers, warnings, health.

use super::SetSpeedLimitRequest;
use crate::api::AppState;
use crate::error::Result;
use crate::types::{EngineStatus, ServerStatus};
use crate::warnings::Warning;
use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};

/// POST /pause - Pause the downloader (forced jobs keep running)
pub async fn pause_all(State(state): State<AppState>) -> Result<StatusCode> {
    state.downloader.pause_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /resume - Resume the downloader
pub async fn resume_all(State(state): State<AppState>) -> Result<StatusCode> {
    state.downloader.resume_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /status - State, throughput and cache figures
pub async fn status(State(state): State<AppState>) -> Result<Json<EngineStatus>> {
    Ok(Json(state.downloader.status().await?))
}

/// PUT /speed-limit - Change the bandwidth limit
pub async fn set_speed_limit(
    State(state): State<AppState>,
    Json(request): Json<SetSpeedLimitRequest>,
) -> StatusCode {
    state.downloader.set_speed_limit(request.limit_bps);
    StatusCode::NO_CONTENT
}

/// GET /servers - Connection and traffic figures per server
pub async fn list_servers(State(state): State<AppState>) -> Result<Json<Vec<ServerStatus>>> {
    Ok(Json(state.downloader.server_status().await?))
}

/// GET /warnings - Recent warnings, oldest first
pub async fn list_warnings(State(state): State<AppState>) -> Json<Vec<Warning>> {
    Json(state.downloader.warnings())
}

/// DELETE /warnings - Forget all warnings
pub async fn clear_warnings(State(state): State<AppState>) -> StatusCode {
    state.downloader.clear_warnings();
    StatusCode::NO_CONTENT
}

/// GET /health - Liveness
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
