//! Public face of the generation subsystem.
//!
//! Composes the admission queue, progress hub, job store and worker into the
//! submit / query / cancel / history operations, enforcing that callers only
//! ever see or touch their own jobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{HistoryPage, JobStore, StoreError};
use crate::models::generation::CancelOutcome;
use crate::models::job::{FailureReason, GenerationParams, Job, JobProgress, JobStatus, OwnerId};
use crate::services::generation::GenerationEngine;
use crate::services::progress::{
    ObserverId, ProgressEvent, ProgressHub, Subscription, DEFAULT_OBSERVER_BUFFER,
};
use crate::services::queue::{
    AdmissionQueue, CancelRequest, QueueError, QueueSnapshot, DEFAULT_MAX_PENDING,
};
use crate::services::worker::{persist_or_hold, UnpersistedJobs, Worker};

/// Tunables for the orchestrator and its worker.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_pending: usize,
    pub observer_buffer: usize,
    pub progress_interval: Duration,
    pub output_dir: PathBuf,
    pub history_max_page_size: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            progress_interval: Duration::from_millis(250),
            output_dir: PathBuf::from("./data/audio"),
            history_max_page_size: 100,
        }
    }
}

/// Jobs found at startup and what was done with them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted: usize,
}

pub struct Orchestrator {
    queue: Arc<AdmissionQueue>,
    hub: Arc<ProgressHub>,
    store: Arc<dyn JobStore>,
    unpersisted: Arc<UnpersistedJobs>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, settings: OrchestratorSettings) -> Self {
        Self {
            queue: Arc::new(AdmissionQueue::new(settings.max_pending)),
            hub: Arc::new(ProgressHub::new(settings.observer_buffer)),
            store,
            unpersisted: Arc::new(UnpersistedJobs::default()),
            settings,
        }
    }

    /// Build the worker bound to this orchestrator's queue and hub.
    pub fn worker(&self, engine: Arc<dyn GenerationEngine>) -> Worker {
        Worker {
            queue: self.queue.clone(),
            hub: self.hub.clone(),
            store: self.store.clone(),
            unpersisted: self.unpersisted.clone(),
            engine,
            output_dir: self.settings.output_dir.clone(),
            progress_interval: self.settings.progress_interval,
        }
    }

    /// Start the worker loop on the runtime.
    pub fn spawn_worker(
        &self,
        engine: Arc<dyn GenerationEngine>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let worker = self.worker(engine);
        tokio::spawn(worker.run(shutdown))
    }

    /// Re-admit pending jobs and fail jobs interrupted by a restart.
    ///
    /// Call once, before the worker starts.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();

        for mut job in self.store.list_unfinished().await? {
            match job.status {
                JobStatus::Pending => {
                    tracing::info!(job_id = %job.id, owner_id = %job.owner_id, "Re-admitting pending job");
                    self.queue.restore(job);
                    report.requeued += 1;
                }
                JobStatus::Processing => {
                    tracing::warn!(job_id = %job.id, owner_id = %job.owner_id, "Job was interrupted by a restart");
                    job.mark_failed(
                        FailureReason::Interrupted,
                        "server stopped while the job was generating",
                    );
                    persist_or_hold(self.store.as_ref(), &self.unpersisted, &job).await;
                    report.interrupted += 1;
                }
                _ => {}
            }
        }

        Ok(report)
    }

    /// Admit a new job for `owner`.
    pub async fn submit(
        &self,
        owner: &OwnerId,
        params: GenerationParams,
    ) -> Result<Job, OrchestratorError> {
        if self.queue.pending_len() >= self.queue.max_pending() {
            metrics::counter!("generation_jobs_rejected_total").increment(1);
            return Err(OrchestratorError::QueueFull);
        }

        let job = Job::new(owner.clone(), params);
        self.store.put(&job).await?;

        match self.queue.enqueue(job.clone()) {
            Ok(position) => {
                metrics::counter!("generation_jobs_submitted_total").increment(1);
                tracing::info!(
                    job_id = %job.id,
                    owner_id = %owner,
                    position,
                    "Generation job queued"
                );
                Ok(job)
            }
            Err(e) => {
                metrics::counter!("generation_jobs_rejected_total").increment(1);
                if let Err(store_err) = self.store.delete(job.id).await {
                    tracing::error!(job_id = %job.id, error = %store_err, "Failed to remove rejected job record");
                }
                Err(e.into())
            }
        }
    }

    /// The caller's pending and processing jobs in start order.
    pub fn queue_status(&self, owner: &OwnerId) -> QueueSnapshot {
        self.queue.snapshot_for(owner)
    }

    /// Cancel one of the caller's jobs.
    ///
    /// Pending jobs are cancelled immediately, the running job is signalled
    /// and finalized by the worker, and finished jobs are left untouched.
    pub async fn cancel(
        &self,
        owner: &OwnerId,
        job_id: Uuid,
    ) -> Result<(CancelOutcome, JobStatus), OrchestratorError> {
        match self.queue.request_cancel(job_id, owner) {
            CancelRequest::Removed(mut job) => {
                job.mark_cancelled();
                persist_or_hold(self.store.as_ref(), &self.unpersisted, &job).await;
                self.hub.publish(
                    owner,
                    ProgressEvent::new(
                        job.id,
                        JobStatus::Cancelled,
                        JobProgress::default(),
                        "Generation cancelled",
                    ),
                );
                metrics::counter!("generation_jobs_cancelled_total").increment(1);
                tracing::info!(job_id = %job_id, owner_id = %owner, "Pending job cancelled");
                Ok((CancelOutcome::Cancelled, JobStatus::Cancelled))
            }
            CancelRequest::Signalled(_) => {
                tracing::info!(job_id = %job_id, owner_id = %owner, "Cancellation requested for running job");
                Ok((CancelOutcome::CancelRequested, JobStatus::Processing))
            }
            CancelRequest::Settled(job) => Ok((CancelOutcome::AlreadyTerminal, job.status)),
            CancelRequest::NotOwned => {
                tracing::warn!(job_id = %job_id, owner_id = %owner, "Cancel attempted on another owner's job");
                Err(OrchestratorError::Forbidden)
            }
            CancelRequest::NotQueued => {
                let job = self.find_owned(owner, job_id).await?;
                if job.status.is_terminal() {
                    Ok((CancelOutcome::AlreadyTerminal, job.status))
                } else {
                    tracing::warn!(job_id = %job_id, status = %job.status, "Job record has no queue entry");
                    Err(OrchestratorError::NotFound)
                }
            }
        }
    }

    /// Full record of one of the caller's jobs.
    pub async fn get_job(&self, owner: &OwnerId, job_id: Uuid) -> Result<Job, OrchestratorError> {
        if let Some(job) = self.queue.get(job_id) {
            return if job.is_owned_by(owner) {
                Ok(job)
            } else {
                Err(OrchestratorError::Forbidden)
            };
        }
        self.find_owned(owner, job_id).await
    }

    /// Finished jobs of the caller, newest first.
    pub async fn list_history(
        &self,
        owner: &OwnerId,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<HistoryPage, OrchestratorError> {
        let page_size = page_size.clamp(1, self.settings.history_max_page_size.max(1));
        let search = search.map(str::trim).filter(|s| !s.is_empty());
        Ok(self.store.list(owner, page.max(1), page_size, search).await?)
    }

    /// Delete a finished job and its artifacts.
    pub async fn delete_history(&self, owner: &OwnerId, job_id: Uuid) -> Result<(), OrchestratorError> {
        let job = self.find_owned(owner, job_id).await?;
        if !job.status.is_terminal() {
            return Err(OrchestratorError::Validation(
                "job is still queued or running; cancel it first".to_string(),
            ));
        }

        self.store.delete(job_id).await?;
        self.unpersisted.remove(job_id);

        if let Some(result) = &job.result {
            remove_artifact(&result.audio_path).await;
            if let Some(thumbnail) = &result.thumbnail_path {
                remove_artifact(thumbnail).await;
            }
        }

        tracing::info!(job_id = %job_id, owner_id = %owner, "Generation deleted");
        Ok(())
    }

    /// Record a thumbnail produced outside the subsystem for a completed job.
    pub async fn attach_thumbnail(
        &self,
        owner: &OwnerId,
        job_id: Uuid,
        thumbnail_path: String,
    ) -> Result<Job, OrchestratorError> {
        let mut job = self.find_owned(owner, job_id).await?;
        match job.result.as_mut() {
            Some(result) if job.status == JobStatus::Completed => {
                result.thumbnail_path = Some(thumbnail_path);
            }
            _ => {
                return Err(OrchestratorError::Validation(
                    "thumbnails can only be attached to completed jobs".to_string(),
                ))
            }
        }

        self.store.put(&job).await?;
        self.unpersisted.remove(job_id);
        Ok(job)
    }

    /// Observe progress of the caller's jobs from now on.
    pub fn subscribe(&self, owner: &OwnerId) -> Subscription {
        self.hub.subscribe(owner.clone())
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.hub.unsubscribe(id);
    }

    /// Cancel the running job, if any. Used on shutdown.
    pub fn cancel_active(&self) {
        self.queue.cancel_active();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_busy(&self) -> bool {
        self.queue.active_id().is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.hub.observer_count()
    }

    pub async fn store_health(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }

    /// Terminal or stored record, checked against `owner`.
    async fn find_owned(&self, owner: &OwnerId, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let job = match self.unpersisted.get(job_id) {
            Some(job) => job,
            None => self
                .store
                .get(job_id)
                .await?
                .ok_or(OrchestratorError::NotFound)?,
        };
        if job.is_owned_by(owner) {
            Ok(job)
        } else {
            Err(OrchestratorError::Forbidden)
        }
    }
}

async fn remove_artifact(path: &str) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path, error = %e, "Failed to remove artifact"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Generation queue is full, retry later")]
    QueueFull,

    #[error("Job not found")]
    NotFound,

    #[error("Job belongs to another owner")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    #[error("Job store failure: {0}")]
    StorageFailure(#[from] StoreError),
}

impl From<QueueError> for OrchestratorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { .. } => Self::QueueFull,
        }
    }
}
