//! History handlers.

use super::HistoryQuery;
use crate::api::AppState;
use crate::error::{Error, Result};
use crate::types::JobId;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde_json::{Value, json};

/// GET /history - Finished and failed jobs, most recent first
pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0);
    let items = state.downloader.history(limit, offset).await?;
    Ok(Json(json!({
        "items": items,
        "limit": limit,
        "offset": offset,
    })))
}

/// DELETE /history/:id - Forget one entry
pub async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if state.downloader.delete_history(&JobId::from(id.as_str())).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("history entry {id}")))
    }
}
