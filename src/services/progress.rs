//! Progress fan-out from the worker loop to live observers.
//!
//! Each observer owns a bounded channel. Publishing never waits: an observer
//! whose buffer is full, or whose receiver is gone, is removed on the spot
//! and recovers by re-subscribing and re-reading the queue.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::job::{JobProgress, JobStatus, OwnerId};

/// Default per-observer buffer.
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

/// A progress update as delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(
        job_id: Uuid,
        status: JobStatus,
        progress: JobProgress,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            status,
            progress,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Identifies one registered observer.
pub type ObserverId = Uuid;

struct Observer {
    owner: OwnerId,
    sender: mpsc::Sender<ProgressEvent>,
}

/// Receiving side of a subscription.
pub struct Subscription {
    pub id: ObserverId,
    receiver: mpsc::Receiver<ProgressEvent>,
}

impl Subscription {
    /// Next event, or `None` once the hub has dropped this observer.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Owner-scoped publish/subscribe register.
pub struct ProgressHub {
    observers: Mutex<HashMap<ObserverId, Observer>>,
    buffer: usize,
}

impl ProgressHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register an observer for `owner`'s jobs.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe(&self, owner: OwnerId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        let mut observers = self.observers.lock();
        observers.insert(id, Observer { owner, sender });
        metrics::gauge!("progress_observers").set(observers.len() as f64);
        Subscription { id, receiver }
    }

    /// Deregister an observer. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: ObserverId) {
        let mut observers = self.observers.lock();
        if observers.remove(&id).is_some() {
            metrics::gauge!("progress_observers").set(observers.len() as f64);
        }
    }

    /// Deliver `event` to every observer of `owner` without waiting.
    ///
    /// Returns the number of observers that accepted it.
    pub fn publish(&self, owner: &OwnerId, event: ProgressEvent) -> usize {
        let mut observers = self.observers.lock();
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, observer) in observers.iter().filter(|(_, o)| &o.owner == owner) {
            match observer.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(observer_id = %id, "Progress observer lagging, dropping it");
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(observer_id = %id, "Progress observer disconnected");
                    dropped.push(*id);
                }
            }
        }

        if !dropped.is_empty() {
            for id in dropped {
                observers.remove(&id);
            }
            metrics::gauge!("progress_observers").set(observers.len() as f64);
        }
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}

/// Rate limit for non-terminal progress events of one job.
///
/// The first tick and the final unit always pass; in between, at most one
/// event per `min_interval`.
pub struct ProgressThrottle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, progress: JobProgress) -> bool {
        self.should_emit_at(progress, Instant::now())
    }

    fn should_emit_at(&mut self, progress: JobProgress, now: Instant) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        let last_unit = progress.total > 0 && progress.current >= progress.total;
        if due || last_unit {
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }
}
