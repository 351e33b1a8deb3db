//! Queue and job handlers.

use super::{
    AddJobQuery, AddJobResponse, DeleteJobQuery, MoveJobRequest, PositionResponse, PurgeRequest,
    PurgeResponse, RenameJobRequest, SetPriorityRequest, SortQueueRequest, TopOnlyRequest,
};
use crate::api::AppState;
use crate::downloader::AddOptions;
use crate::error::{Error, Result};
use crate::queue::PurgeSelector;
use crate::types::{JobId, JobInfo, Priority};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// GET /queue - Jobs in queue order
pub async fn list_queue(State(state): State<AppState>) -> Result<Json<Vec<JobInfo>>> {
    Ok(Json(state.downloader.queue_snapshot().await?))
}

/// POST /queue - Add a job from a raw NZB body
pub async fn add_job(
    State(state): State<AppState>,
    Query(query): Query<AddJobQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<AddJobResponse>)> {
    let name = query.name.unwrap_or_else(|| "upload".to_string());
    let options = AddOptions {
        category: query.category,
        priority: query.priority.unwrap_or(Priority::Default),
        password: query.password,
        paused: query.paused,
        pre_check: query.pre_check,
        ..AddOptions::default()
    };
    let id = state
        .downloader
        .add_nzb_content(&body, &name, options)
        .await?;
    Ok((StatusCode::CREATED, Json(AddJobResponse { id })))
}

/// GET /queue/:id - One job
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>> {
    Ok(Json(state.downloader.job_info(&JobId::from(id)).await?))
}

/// DELETE /queue/:id - Delete a job
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteJobQuery>,
) -> Result<StatusCode> {
    state
        .downloader
        .delete(&JobId::from(id), query.del_files)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/:id/pause - Pause a job
pub async fn pause_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.downloader.pause(&JobId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/:id/resume - Resume a job
pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.resume(&JobId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /queue/:id/priority - Change a job's priority
pub async fn set_job_priority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetPriorityRequest>,
) -> Result<Json<PositionResponse>> {
    let position = state
        .downloader
        .set_priority(&JobId::from(id), request.priority)
        .await?;
    Ok(Json(PositionResponse { position }))
}

/// POST /queue/:id/move - Move a job to an index or behind another job
pub async fn move_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<MoveJobRequest>,
) -> Result<Json<PositionResponse>> {
    let id = JobId::from(id);
    let position = match (request.index, request.after) {
        (Some(index), None) => state.downloader.move_to(&id, index).await?,
        (None, Some(anchor)) => state.downloader.move_after(&id, &anchor).await?,
        _ => {
            return Err(Error::Config {
                message: "give either `index` or `after`".into(),
                key: None,
            });
        }
    };
    Ok(Json(PositionResponse { position }))
}

/// POST /queue/:id/rename - Rename a job and/or supply its password
pub async fn rename_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameJobRequest>,
) -> Result<StatusCode> {
    state
        .downloader
        .rename(&JobId::from(id), request.name, request.password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/sort - Sort within priority ranks
pub async fn sort_queue(
    State(state): State<AppState>,
    Json(request): Json<SortQueueRequest>,
) -> Result<StatusCode> {
    state
        .downloader
        .sort_queue(request.key, request.direction)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/top-only - Restrict dispatch to the head job
pub async fn set_top_only(
    State(state): State<AppState>,
    Json(request): Json<TopOnlyRequest>,
) -> StatusCode {
    state.downloader.set_top_only(request.enabled);
    StatusCode::NO_CONTENT
}

/// POST /queue/purge - Delete every matching job
pub async fn purge_queue(
    State(state): State<AppState>,
    Json(request): Json<PurgeRequest>,
) -> Result<Json<PurgeResponse>> {
    let selector = if let Some(name) = request.name {
        PurgeSelector::NameContains(name)
    } else if let Some(category) = request.category {
        PurgeSelector::Category(category)
    } else if let Some(status) = request.status {
        PurgeSelector::Status(status)
    } else {
        PurgeSelector::All
    };
    let removed = state
        .downloader
        .purge(selector, request.del_files)
        .await?;
    Ok(Json(PurgeResponse { removed }))
}
