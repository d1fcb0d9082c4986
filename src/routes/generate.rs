use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::generation::{
    CancelResponse, QueueItem, QueueStatusResponse, SubmitRequest, SubmitResponse,
};
use crate::models::job::Job;
use crate::routes::auth::CurrentOwner;
use crate::routes::error::ApiResult;

/// POST /api/v1/generations: queue a new generation.
pub async fn submit_generation(
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    request.validate()?;

    let job = state.orchestrator.submit(&owner, request.into()).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id: job.id,
            status: job.status,
            message: "Generation added to queue".to_string(),
        }),
    ))
}

/// GET /api/v1/queue: the caller's pending and processing jobs.
pub async fn get_queue(
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
) -> Json<QueueStatusResponse> {
    let snapshot = state.orchestrator.queue_status(&owner);

    Json(QueueStatusResponse {
        items: snapshot
            .entries
            .iter()
            .map(|entry| QueueItem::from_entry(&entry.job, entry.position))
            .collect(),
        active_id: snapshot.active_id,
    })
}

/// DELETE /api/v1/queue/{job_id}: cancel a queued or running job.
pub async fn cancel_generation(
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let (outcome, status) = state.orchestrator.cancel(&owner, job_id).await?;
    Ok(Json(CancelResponse {
        id: job_id,
        outcome,
        status,
    }))
}

/// GET /api/v1/jobs/{job_id}: full record of one job.
pub async fn get_job(
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.get_job(&owner, job_id).await?))
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub queue_length: usize,
    pub busy: bool,
    pub engine: String,
    pub observers: usize,
}

/// GET /api/v1/status: load of the generation slot.
pub async fn system_status(
    State(state): State<AppState>,
    CurrentOwner(_owner): CurrentOwner,
) -> Json<SystemStatus> {
    Json(SystemStatus {
        queue_length: state.orchestrator.queue_len(),
        busy: state.orchestrator.is_busy(),
        engine: state.engine_name.to_string(),
        observers: state.orchestrator.observer_count(),
    })
}
