//! The single consumer that runs jobs against the one compute slot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::JobStore;
use crate::models::job::{FailureReason, Job, JobResult, JobStatus};
use crate::services::generation::{
    discard_partial, GeneratedAudio, GenerationEngine, GenerationError, GenerationRequest,
};
use crate::services::progress::{ProgressEvent, ProgressHub, ProgressThrottle};
use crate::services::queue::{AdmissionQueue, StartedJob};

/// Terminal records the store refused, kept until a later write succeeds.
#[derive(Default)]
pub struct UnpersistedJobs {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl UnpersistedJobs {
    pub fn insert(&self, job: Job) {
        self.jobs.lock().insert(job.id, job);
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().get(&job_id).cloned()
    }

    pub fn remove(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().remove(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }
}

/// How a single job run ended.
enum RunOutcome {
    Generated(GeneratedAudio),
    Cancelled,
    Failed(FailureReason, String),
}

/// Processes jobs one at a time until shut down.
pub struct Worker {
    pub(crate) queue: Arc<AdmissionQueue>,
    pub(crate) hub: Arc<ProgressHub>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) unpersisted: Arc<UnpersistedJobs>,
    pub(crate) engine: Arc<dyn GenerationEngine>,
    pub(crate) output_dir: PathBuf,
    pub(crate) progress_interval: Duration,
}

impl Worker {
    /// Main processing loop.
    ///
    /// A failing job never ends the loop; only `shutdown` does.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(engine = self.engine.name(), "Worker ready, starting job processing loop");

        while let Some(started) = self.queue.next_job(&shutdown).await {
            self.process(started).await;
            self.flush_unpersisted().await;
        }

        tracing::info!("Worker loop stopped");
    }

    async fn process(&self, started: StartedJob) {
        let StartedJob { job, cancel } = started;
        let timer = Instant::now();

        tracing::info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            max_audio_length_ms = job.params.max_audio_length_ms,
            "Processing generation job"
        );

        if let Err(e) = self.store.put(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to record job start, continuing in memory");
        }
        self.hub.publish(
            &job.owner_id,
            ProgressEvent::new(
                job.id,
                JobStatus::Processing,
                job.progress.unwrap_or_default(),
                "Generation started",
            ),
        );

        let outcome = self.run_engine(&job, cancel).await;

        let Some(record) = self.queue.settle_active(job.id, |record, cancel_requested| {
            match outcome {
                RunOutcome::Generated(audio) if cancel_requested => {
                    discard_partial(&audio.audio_path);
                    record.mark_cancelled();
                }
                RunOutcome::Generated(audio) => record.mark_completed(JobResult {
                    audio_path: audio.audio_path.to_string_lossy().into_owned(),
                    thumbnail_path: audio
                        .thumbnail_path
                        .map(|p| p.to_string_lossy().into_owned()),
                    duration_ms: audio.duration_ms,
                }),
                RunOutcome::Cancelled => record.mark_cancelled(),
                RunOutcome::Failed(reason, message) => record.mark_failed(reason, message),
            }
        }) else {
            tracing::error!(job_id = %job.id, "Active job vanished before it could be finalized");
            return;
        };

        self.persist(&record).await;
        self.queue.finish_active(record.id);
        self.publish_terminal(&record);

        let elapsed = timer.elapsed();
        metrics::histogram!("generation_processing_seconds").record(elapsed.as_secs_f64());
        match record.status {
            JobStatus::Completed => {
                metrics::counter!("generation_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = %record.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    duration_ms = record.result.as_ref().map(|r| r.duration_ms),
                    "Job completed successfully"
                );
            }
            JobStatus::Cancelled => {
                metrics::counter!("generation_jobs_cancelled_total").increment(1);
                tracing::info!(job_id = %record.id, "Job cancelled while processing");
            }
            _ => {
                metrics::counter!("generation_jobs_failed_total").increment(1);
                tracing::warn!(
                    job_id = %record.id,
                    reason = ?record.failure_reason,
                    error = record.error.as_deref().unwrap_or_default(),
                    "Job failed"
                );
            }
        }
    }

    /// Drive the blocking engine call on the blocking pool.
    async fn run_engine(&self, job: &Job, cancel: CancellationToken) -> RunOutcome {
        let engine = self.engine.clone();
        let queue = self.queue.clone();
        let hub = self.hub.clone();
        let interval = self.progress_interval;
        let job_id = job.id;
        let owner = job.owner_id.clone();
        let params = job.params.clone();
        let output_path = self.output_dir.join(format!("{job_id}.wav"));

        let handle = tokio::task::spawn_blocking(move || {
            let request = GenerationRequest {
                job_id,
                params: &params,
                output_path: &output_path,
            };
            let mut throttle = ProgressThrottle::new(interval);
            let mut on_progress = |current: u32, total: u32| {
                let Some(progress) = queue.record_progress(job_id, current, total) else {
                    return;
                };
                if throttle.should_emit(progress) {
                    hub.publish(
                        &owner,
                        ProgressEvent::new(
                            job_id,
                            JobStatus::Processing,
                            progress,
                            format!("Generating frame {}/{}", progress.current, progress.total),
                        ),
                    );
                }
            };
            engine.generate(&request, &cancel, &mut on_progress)
        });

        match handle.await {
            Ok(Ok(audio)) => RunOutcome::Generated(audio),
            Ok(Err(GenerationError::Cancelled)) => RunOutcome::Cancelled,
            Ok(Err(e)) => RunOutcome::Failed(
                e.failure_reason().unwrap_or(FailureReason::EngineError),
                e.to_string(),
            ),
            Err(join_err) => {
                tracing::error!(job_id = %job_id, error = %join_err, "Generation task panicked");
                RunOutcome::Failed(
                    FailureReason::EnginePanicked,
                    "generation engine panicked".to_string(),
                )
            }
        }
    }

    fn publish_terminal(&self, record: &Job) {
        let message = match record.status {
            JobStatus::Completed => "Generation complete".to_string(),
            JobStatus::Cancelled => "Generation cancelled".to_string(),
            _ => format!(
                "Generation failed: {}",
                record.error.as_deref().unwrap_or("unknown error")
            ),
        };
        self.hub.publish(
            &record.owner_id,
            ProgressEvent::new(
                record.id,
                record.status,
                record.progress.unwrap_or_default(),
                message,
            ),
        );
    }

    /// Write a terminal record, falling back to in-memory tracking.
    async fn persist(&self, record: &Job) {
        persist_or_hold(self.store.as_ref(), &self.unpersisted, record).await;
    }

    /// Retry records the store refused earlier.
    async fn flush_unpersisted(&self) {
        for job in self.unpersisted.snapshot() {
            match self.store.put(&job).await {
                Ok(()) => {
                    self.unpersisted.remove(job.id);
                    tracing::info!(job_id = %job.id, "Recovered job record written to store");
                }
                Err(e) => {
                    tracing::debug!(job_id = %job.id, error = %e, "Job store still unavailable");
                    break;
                }
            }
        }
    }
}

/// Write `record`, keeping it in `held` when the store fails.
pub(crate) async fn persist_or_hold(store: &dyn JobStore, held: &UnpersistedJobs, record: &Job) {
    match store.put(record).await {
        Ok(()) => {
            held.remove(record.id);
        }
        Err(e) => {
            metrics::counter!("generation_store_failures_total").increment(1);
            tracing::error!(
                job_id = %record.id,
                status = %record.status,
                error = %e,
                "Failed to persist job record, keeping it in memory"
            );
            held.insert(record.clone());
        }
    }
}
