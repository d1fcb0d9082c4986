//! Test fixtures: scripted generation engines and job stores with injected faults

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use songsmith::db::{HistoryPage, JobStore, MemoryJobStore, StoreError};
use songsmith::models::job::{GenerationParams, Job, OwnerId};
use songsmith::services::generation::{
    GeneratedAudio, GenerationEngine, GenerationError, GenerationRequest,
};

/// Generation parameters with short audio so runs stay small.
pub fn params(lyrics: &str) -> GenerationParams {
    GenerationParams {
        lyrics: lyrics.to_string(),
        tags: "synthwave, female vocals".to_string(),
        title: None,
        max_audio_length_ms: 10_000,
        temperature: 1.0,
        topk: 50,
        cfg_scale: 1.5,
    }
}

pub fn owner(name: &str) -> OwnerId {
    OwnerId::new(name)
}

/// A latch the engine waits on before producing its first frame.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    /// Block until opened. Returns false if `cancel` fired first.
    fn wait(&self, cancel: &CancellationToken) -> bool {
        let mut open = self.open.lock();
        while !*open {
            if cancel.is_cancelled() {
                return false;
            }
            self.cond.wait_for(&mut open, Duration::from_millis(10));
        }
        true
    }
}

/// Engine that emits a fixed number of frames and writes a tiny artifact.
///
/// Records the order in which jobs started and the highest number of runs
/// it ever saw at once.
pub struct ScriptedEngine {
    frames: u32,
    step_delay: Duration,
    fail_at: Option<u32>,
    gate: Option<Arc<Gate>>,
    started: Mutex<Vec<Uuid>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(frames: u32) -> Self {
        Self {
            frames,
            step_delay: Duration::from_millis(5),
            fail_at: None,
            gate: None,
            started: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fail right after reporting frame `frame`.
    pub fn failing_at(mut self, frame: u32) -> Self {
        self.fail_at = Some(frame);
        self
    }

    /// Hold every run before its first frame until `gate` opens.
    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn started(&self) -> Vec<Uuid> {
        self.started.lock().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(u32, u32),
    ) -> Result<GeneratedAudio, GenerationError> {
        self.started.lock().push(request.job_id);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        if let Some(gate) = &self.gate {
            if !gate.wait(cancel) {
                return Err(GenerationError::Cancelled);
            }
        }

        for frame in 1..=self.frames {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            std::thread::sleep(self.step_delay);
            on_progress(frame, self.frames);
            if self.fail_at == Some(frame) {
                return Err(GenerationError::Engine(format!(
                    "decoder crashed at frame {frame}"
                )));
            }
        }

        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        std::fs::write(request.output_path, b"RIFF")?;
        Ok(GeneratedAudio {
            audio_path: request.output_path.to_path_buf(),
            thumbnail_path: None,
            duration_ms: u64::from(self.frames) * 80,
        })
    }
}

/// Engine that panics mid-run.
pub struct PanickingEngine;

impl GenerationEngine for PanickingEngine {
    fn name(&self) -> &str {
        "panicking"
    }

    fn generate(
        &self,
        _request: &GenerationRequest<'_>,
        _cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(u32, u32),
    ) -> Result<GeneratedAudio, GenerationError> {
        on_progress(1, 4);
        panic!("model weights corrupted");
    }
}

/// Engine that finishes its artifact and sees a cancel land right after,
/// before the worker settles the job.
pub struct CancelAfterFinishEngine;

impl GenerationEngine for CancelAfterFinishEngine {
    fn name(&self) -> &str {
        "cancel-after-finish"
    }

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(u32, u32),
    ) -> Result<GeneratedAudio, GenerationError> {
        on_progress(1, 1);
        std::fs::write(request.output_path, b"RIFF")?;
        cancel.cancel();
        Ok(GeneratedAudio {
            audio_path: request.output_path.to_path_buf(),
            thumbnail_path: None,
            duration_ms: 80,
        })
    }
}

/// In-memory store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryJobStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put(job).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn list(
        &self,
        owner: &OwnerId,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<HistoryPage, StoreError> {
        self.inner.list(owner, page, page_size, search).await
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete(job_id).await
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.list_unfinished().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check()
    }
}
