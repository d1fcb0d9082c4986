//! In-memory admission queue and the single active-job slot.
//!
//! The pending backlog and the "currently processing" marker live behind one
//! lock so every transition between them is atomic. Only the worker loop
//! starts or finishes the active job; callers enqueue, remove and request
//! cancellation.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{Job, JobProgress, OwnerId};

/// Default bound on the pending backlog.
pub const DEFAULT_MAX_PENDING: usize = 32;

/// Job currently holding the compute slot.
struct ActiveJob {
    job: Job,
    cancel: CancellationToken,
    total_fixed: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    active: Option<ActiveJob>,
}

/// A job handed to the worker together with its cancellation token.
pub struct StartedJob {
    pub job: Job,
    pub cancel: CancellationToken,
}

/// A job in the caller's view, with its place in the global line.
///
/// Position 0 is the active job; pending jobs follow in start order.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub job: Job,
    pub position: usize,
}

/// Owner-filtered view of the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub entries: Vec<QueuedEntry>,
    pub active_id: Option<Uuid>,
}

/// Result of a cancellation request against the queue.
#[derive(Debug)]
pub enum CancelRequest {
    /// The job was pending and has been taken out of the backlog.
    Removed(Job),
    /// The job is active; its token has been cancelled.
    Signalled(Job),
    /// The active job's outcome is already decided.
    Settled(Job),
    /// The job is queued or active but belongs to someone else.
    NotOwned,
    /// The queue does not hold this job.
    NotQueued,
}

/// FIFO backlog of pending jobs plus the active-job marker.
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_pending: usize,
}

impl AdmissionQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_pending,
        }
    }

    /// Append a pending job to the tail.
    ///
    /// Returns the job's position in the global line.
    pub fn enqueue(&self, job: Job) -> Result<usize, QueueError> {
        let position = {
            let mut state = self.state.lock();
            if state.pending.len() >= self.max_pending {
                return Err(QueueError::QueueFull {
                    max_pending: self.max_pending,
                });
            }
            state.pending.push_back(job);
            metrics::gauge!("generation_queue_depth").set(state.pending.len() as f64);
            state.pending.len() - 1 + usize::from(state.active.is_some())
        };
        self.notify.notify_one();
        Ok(position)
    }

    /// Id of the job that will start next.
    pub fn peek_next(&self) -> Option<Uuid> {
        self.state.lock().pending.front().map(|job| job.id)
    }

    /// Remove a pending job. The active job is never removed here.
    pub fn remove(&self, job_id: Uuid) -> Option<Job> {
        let mut state = self.state.lock();
        let index = state.pending.iter().position(|job| job.id == job_id)?;
        let removed = state.pending.remove(index);
        metrics::gauge!("generation_queue_depth").set(state.pending.len() as f64);
        removed
    }

    /// The caller's own jobs in global start order.
    ///
    /// `active_id` is only reported when the active job belongs to `owner`.
    pub fn snapshot_for(&self, owner: &OwnerId) -> QueueSnapshot {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::default();
        let offset = usize::from(state.active.is_some());

        if let Some(active) = state
            .active
            .as_ref()
            .filter(|a| a.job.is_owned_by(owner) && !a.job.status.is_terminal())
        {
            snapshot.active_id = Some(active.job.id);
            snapshot.entries.push(QueuedEntry {
                job: active.job.clone(),
                position: 0,
            });
        }

        snapshot.entries.extend(
            state
                .pending
                .iter()
                .enumerate()
                .filter(|(_, job)| job.is_owned_by(owner))
                .map(|(index, job)| QueuedEntry {
                    job: job.clone(),
                    position: index + offset,
                }),
        );
        snapshot
    }

    /// Look up a queued or active job by id.
    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        let state = self.state.lock();
        state
            .active
            .as_ref()
            .map(|active| &active.job)
            .filter(|job| job.id == job_id)
            .or_else(|| state.pending.iter().find(|job| job.id == job_id))
            .cloned()
    }

    /// Owner-checked cancellation.
    ///
    /// Pending jobs are removed synchronously; the active job only has its
    /// token cancelled and is finalized by the worker.
    pub fn request_cancel(&self, job_id: Uuid, owner: &OwnerId) -> CancelRequest {
        let mut state = self.state.lock();

        if let Some(active) = state.active.as_ref().filter(|a| a.job.id == job_id) {
            if !active.job.is_owned_by(owner) {
                return CancelRequest::NotOwned;
            }
            if active.job.status.is_terminal() {
                return CancelRequest::Settled(active.job.clone());
            }
            active.cancel.cancel();
            return CancelRequest::Signalled(active.job.clone());
        }

        let Some(index) = state.pending.iter().position(|job| job.id == job_id) else {
            return CancelRequest::NotQueued;
        };
        if !state.pending[index].is_owned_by(owner) {
            return CancelRequest::NotOwned;
        }
        match state.pending.remove(index) {
            Some(job) => {
                metrics::gauge!("generation_queue_depth").set(state.pending.len() as f64);
                CancelRequest::Removed(job)
            }
            None => CancelRequest::NotQueued,
        }
    }

    /// Pending jobs plus the active one, if any.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + usize::from(state.active.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.state.lock().active.as_ref().map(|active| active.job.id)
    }

    /// Pending jobs only.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Wait until a pending job is available and move it into the active slot.
    ///
    /// Returns `None` once `shutdown` is cancelled.
    pub(crate) async fn next_job(&self, shutdown: &CancellationToken) -> Option<StartedJob> {
        loop {
            if let Some(started) = self.try_start_next() {
                return Some(started);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Pop the head into the active slot, unless a job is already active.
    pub(crate) fn try_start_next(&self) -> Option<StartedJob> {
        let mut state = self.state.lock();
        if state.active.is_some() {
            return None;
        }
        let mut job = state.pending.pop_front()?;
        metrics::gauge!("generation_queue_depth").set(state.pending.len() as f64);

        job.mark_processing();
        let cancel = CancellationToken::new();
        state.active = Some(ActiveJob {
            job: job.clone(),
            cancel: cancel.clone(),
            total_fixed: false,
        });
        Some(StartedJob { job, cancel })
    }

    /// Fold an engine tick into the active job's progress.
    ///
    /// Returns the updated progress when it changed.
    pub(crate) fn record_progress(
        &self,
        job_id: Uuid,
        current: u32,
        total: u32,
    ) -> Option<JobProgress> {
        let mut state = self.state.lock();
        let active = state.active.as_mut().filter(|a| a.job.id == job_id)?;
        let progress = active.job.progress.get_or_insert_with(JobProgress::default);
        progress
            .advance(current, total, &mut active.total_fixed)
            .then_some(*progress)
    }

    /// Decide the active job's outcome while still holding the slot.
    ///
    /// `settle` receives the record and whether cancellation was requested.
    /// Runs under the queue lock, so a cancel request either lands before
    /// the decision or observes the settled status.
    pub(crate) fn settle_active(
        &self,
        job_id: Uuid,
        settle: impl FnOnce(&mut Job, bool),
    ) -> Option<Job> {
        let mut state = self.state.lock();
        let active = state.active.as_mut().filter(|a| a.job.id == job_id)?;
        settle(&mut active.job, active.cancel.is_cancelled());
        Some(active.job.clone())
    }

    /// Re-admit a job recovered from the store, ignoring the pending bound.
    pub(crate) fn restore(&self, job: Job) {
        {
            let mut state = self.state.lock();
            state.pending.push_back(job);
            metrics::gauge!("generation_queue_depth").set(state.pending.len() as f64);
        }
        self.notify.notify_one();
    }

    /// Release the active slot, returning the in-memory record.
    pub(crate) fn finish_active(&self, job_id: Uuid) -> Option<Job> {
        let mut state = self.state.lock();
        if state.active.as_ref().is_some_and(|a| a.job.id == job_id) {
            state.active.take().map(|active| active.job)
        } else {
            None
        }
    }

    /// Cancel whatever is running. Used on shutdown.
    pub(crate) fn cancel_active(&self) {
        if let Some(active) = self.state.lock().active.as_ref() {
            active.cancel.cancel();
        }
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full ({max_pending} pending jobs), retry later")]
    QueueFull { max_pending: usize },
}
