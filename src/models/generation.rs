use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{
    FailureReason, GenerationParams, Job, JobProgress, JobResult, JobStatus,
};

/// Request to queue a new music generation.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 10_000))]
    pub lyrics: String,

    #[garde(length(min = 1, max = 500))]
    pub tags: String,

    #[garde(length(max = 200))]
    pub title: Option<String>,

    #[serde(default = "default_max_audio_length_ms")]
    #[garde(range(min = 10_000, max = 240_000))]
    pub max_audio_length_ms: u32,

    #[serde(default = "default_temperature")]
    #[garde(range(min = 0.1, max = 2.0))]
    pub temperature: f32,

    #[serde(default = "default_topk")]
    #[garde(range(min = 1, max = 500))]
    pub topk: u32,

    #[serde(default = "default_cfg_scale")]
    #[garde(range(min = 1.0, max = 5.0))]
    pub cfg_scale: f32,
}

fn default_max_audio_length_ms() -> u32 {
    120_000
}

fn default_temperature() -> f32 {
    1.0
}

fn default_topk() -> u32 {
    50
}

fn default_cfg_scale() -> f32 {
    1.5
}

impl From<SubmitRequest> for GenerationParams {
    fn from(req: SubmitRequest) -> Self {
        Self {
            lyrics: req.lyrics,
            tags: req.tags,
            title: req.title,
            max_audio_length_ms: req.max_audio_length_ms,
            temperature: req.temperature,
            topk: req.topk,
            cfg_scale: req.cfg_scale,
        }
    }
}

/// Response after a job has been admitted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// A job as listed in the caller's queue view.
///
/// `position` is the job's place in the global line: 0 while it is running,
/// then 1, 2, ... for pending jobs in start order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub position: usize,
    pub title: Option<String>,
    pub status: JobStatus,
    pub progress: Option<JobProgress>,
    pub created_at: DateTime<Utc>,
    pub lyrics: String,
    pub tags: String,
}

impl QueueItem {
    pub fn from_entry(job: &Job, position: usize) -> Self {
        Self {
            id: job.id,
            position,
            title: job.params.title.clone(),
            status: job.status,
            progress: job.progress,
            created_at: job.created_at,
            lyrics: job.params.lyrics.clone(),
            tags: job.params.tags.clone(),
        }
    }
}

/// The caller's pending and processing jobs in start order.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    pub items: Vec<QueueItem>,
    pub active_id: Option<Uuid>,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still queued and is now `cancelled`.
    Cancelled,
    /// The job is running; the worker will stop it at its next checkpoint.
    CancelRequested,
    /// The job had already finished. Nothing changed.
    AlreadyTerminal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: Uuid,
    pub outcome: CancelOutcome,
    pub status: JobStatus,
}

/// Query string for the history listing.
#[derive(Debug, Deserialize, Validate)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    #[garde(range(min = 1))]
    pub page: u32,

    #[serde(default = "default_page_size")]
    #[garde(range(min = 1, max = 100))]
    pub page_size: u32,

    #[garde(length(max = 200))]
    pub search: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// One finished generation in the history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: Uuid,
    pub title: Option<String>,
    pub status: JobStatus,
    pub lyrics: String,
    pub tags: String,
    pub result: Option<JobResult>,
    pub failure_reason: Option<FailureReason>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub max_audio_length_ms: u32,
    pub temperature: f32,
    pub topk: u32,
    pub cfg_scale: f32,
}

impl From<Job> for HistoryItem {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            title: job.params.title,
            status: job.status,
            lyrics: job.params.lyrics,
            tags: job.params.tags,
            result: job.result,
            failure_reason: job.failure_reason,
            error: job.error,
            created_at: job.created_at,
            finished_at: job.finished_at,
            max_audio_length_ms: job.params.max_audio_length_ms,
            temperature: job.params.temperature,
            topk: job.params.topk,
            cfg_scale: job.params.cfg_scale,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub items: Vec<HistoryItem>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Body of `PUT /api/v1/history/{id}/thumbnail`.
#[derive(Debug, Deserialize, Validate)]
pub struct ThumbnailRequest {
    #[garde(length(min = 1, max = 1024))]
    pub thumbnail_path: String,
}
