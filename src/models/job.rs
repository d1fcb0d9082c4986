use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Milliseconds of audio produced per generated frame.
pub const FRAME_MS: u32 = 80;

/// Opaque identity of the caller that submitted a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a generation job.
///
/// `Pending -> Processing -> {Completed | Failed | Cancelled}`, plus the
/// direct `Pending -> Cancelled` edge for jobs cancelled before they start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Cancelled)
        )
    }
}

/// Stable category recorded on a failed job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    /// The engine reported an unrecoverable error.
    EngineError,
    /// The engine finished but its output could not be understood.
    InvalidOutput,
    /// The engine call panicked.
    EnginePanicked,
    /// The process stopped while the job was running.
    Interrupted,
}

/// Parameters snapshot taken at submission. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub lyrics: String,
    pub tags: String,
    pub title: Option<String>,
    pub max_audio_length_ms: u32,
    pub temperature: f32,
    pub topk: u32,
    pub cfg_scale: f32,
}

impl GenerationParams {
    /// Number of frames the engine is expected to produce at most.
    pub fn expected_frames(&self) -> u32 {
        self.max_audio_length_ms / FRAME_MS
    }
}

/// `(current_unit, total_units)` reported while a job runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JobProgress {
    pub current: u32,
    pub total: u32,
}

impl JobProgress {
    pub fn new(current: u32, total: u32) -> Self {
        Self { current, total }
    }

    /// Fold an engine tick into the recorded progress.
    ///
    /// `current` never moves backwards, and once an engine has reported a
    /// total it stays fixed. Returns whether anything changed.
    pub fn advance(&mut self, current: u32, total: u32, total_fixed: &mut bool) -> bool {
        let mut changed = false;
        if !*total_fixed && total > 0 {
            changed |= self.total != total;
            self.total = total;
            *total_fixed = true;
        }
        if current > self.current {
            self.current = current;
            changed = true;
        }
        changed
    }
}

/// Artifact produced by a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub audio_path: String,
    pub thumbnail_path: Option<String>,
    pub duration_ms: u64,
}

/// A submitted generation request and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub status: JobStatus,
    pub params: GenerationParams,
    pub progress: Option<JobProgress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub failure_reason: Option<FailureReason>,
    pub error: Option<String>,
}

impl Job {
    /// Build a fresh `Pending` job. A missing title defaults to
    /// `Generation <first 8 chars of the id>`.
    pub fn new(owner_id: OwnerId, mut params: GenerationParams) -> Self {
        let id = Uuid::new_v4();
        if params.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
            params.title = Some(format!("Generation {}", &id.simple().to_string()[..8]));
        }
        Self {
            id,
            owner_id,
            status: JobStatus::Pending,
            params,
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            failure_reason: None,
            error: None,
        }
    }

    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        &self.owner_id == owner
    }

    pub fn title(&self) -> &str {
        self.params.title.as_deref().unwrap_or_default()
    }

    pub fn mark_processing(&mut self) {
        debug_assert!(self.status.can_transition_to(JobStatus::Processing));
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        self.progress = Some(JobProgress::new(0, self.params.expected_frames()));
    }

    pub fn mark_completed(&mut self, result: JobResult) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: FailureReason, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason);
        self.error = Some(message.into());
        self.result = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.result = None;
        self.finished_at = Some(Utc::now());
    }

    /// Case-insensitive substring match over title, tags and lyrics.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [self.title(), self.params.tags.as_str(), self.params.lyrics.as_str()]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}
