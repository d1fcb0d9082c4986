use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::generation::{HistoryItem, HistoryQuery, HistoryResponse, ThumbnailRequest};
use crate::routes::auth::CurrentOwner;
use crate::routes::error::ApiResult;

/// GET /api/v1/history: the caller's finished generations, newest first.
pub async fn list_history(
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    query.validate()?;

    let page = state
        .orchestrator
        .list_history(&owner, query.page, query.page_size, query.search.as_deref())
        .await?;

    Ok(Json(HistoryResponse {
        items: page.items.into_iter().map(HistoryItem::from).collect(),
        total: page.total,
        page: page.page,
        page_size: page.page_size,
    }))
}

/// DELETE /api/v1/history/{job_id}: remove a finished generation and its files.
pub async fn delete_history(
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_history(&owner, job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/v1/history/{job_id}/thumbnail
pub async fn attach_thumbnail(
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ThumbnailRequest>,
) -> ApiResult<Json<HistoryItem>> {
    request.validate()?;

    let job = state
        .orchestrator
        .attach_thumbnail(&owner, job_id, request.thumbnail_path)
        .await?;

    Ok(Json(job.into()))
}
