use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{FailureReason, GenerationParams};

/// Environment variable carrying the artifact path to the generator process.
pub const OUTPUT_PATH_ENV: &str = "SONGSMITH_OUTPUT_PATH";

/// Everything the engine needs for one generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub job_id: Uuid,
    pub params: &'a GenerationParams,
    pub output_path: &'a Path,
}

/// Artifact produced by a successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAudio {
    pub audio_path: PathBuf,
    pub thumbnail_path: Option<PathBuf>,
    pub duration_ms: u64,
}

/// The music model, seen from the orchestrator.
///
/// `generate` blocks for the length of the generation. Implementations call
/// `on_progress(current, total)` as frames are produced and must check
/// `cancel` at least once per progress tick, returning
/// [`GenerationError::Cancelled`] when it fires.
pub trait GenerationEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(u32, u32),
    ) -> Result<GeneratedAudio, GenerationError>;
}

/// Parameters written to the generator's stdin.
#[derive(Serialize)]
struct EngineInput<'a> {
    job_id: Uuid,
    lyrics: &'a str,
    tags: &'a str,
    title: Option<&'a str>,
    max_audio_length_ms: u32,
    temperature: f32,
    topk: u32,
    cfg_scale: f32,
    output_path: &'a Path,
}

/// One line of the generator's stdout protocol.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EngineMessage {
    Progress {
        current: u32,
        total: u32,
    },
    Done {
        duration_ms: u64,
        #[serde(default)]
        thumbnail_path: Option<PathBuf>,
    },
}

/// Runs an external generator program per job.
///
/// The program receives the parameters as JSON on stdin and reports
/// newline-delimited JSON on stdout:
/// `{"event":"progress","current":N,"total":M}` while working and
/// `{"event":"done","duration_ms":D}` once the artifact is written.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn spawn<'a>(&self, request: &GenerationRequest<'a>) -> Result<GeneratorProcess<'a>, GenerationError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(OUTPUT_PATH_ENV, request.output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let mut process = GeneratorProcess {
            child,
            output_path: request.output_path,
            reaped: false,
        };

        let input = EngineInput {
            job_id: request.job_id,
            lyrics: &request.params.lyrics,
            tags: &request.params.tags,
            title: request.params.title.as_deref(),
            max_audio_length_ms: request.params.max_audio_length_ms,
            temperature: request.params.temperature,
            topk: request.params.topk,
            cfg_scale: request.params.cfg_scale,
            output_path: request.output_path,
        };

        if let Some(mut stdin) = process.child.stdin.take() {
            let payload = serde_json::to_vec(&input)
                .map_err(|e| GenerationError::Engine(format!("encoding parameters: {e}")))?;
            // The generator may ignore stdin and exit early.
            if let Err(e) = stdin.write_all(&payload) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }
        Ok(process)
    }
}

impl GenerationEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(u32, u32),
    ) -> Result<GeneratedAudio, GenerationError> {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        // Every early return below drops `process`, which kills the generator.
        let mut process = self.spawn(request)?;
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| GenerationError::Engine("generator stdout unavailable".to_string()))?;
        let lines = forward_lines(stdout);

        let mut done = None;
        loop {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            let line = match lines.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(line) => line?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match serde_json::from_str::<EngineMessage>(line.trim()) {
                Ok(EngineMessage::Progress { current, total }) => on_progress(current, total),
                Ok(EngineMessage::Done {
                    duration_ms,
                    thumbnail_path,
                }) => done = Some((duration_ms, thumbnail_path)),
                Err(_) => tracing::debug!(job_id = %request.job_id, line = %line, "Ignoring generator output"),
            }
        }

        let status = loop {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            if let Some(status) = process.try_wait()? {
                break status;
            }
            std::thread::sleep(CANCEL_POLL_INTERVAL);
        };
        if !status.success() {
            discard_partial(request.output_path);
            return Err(GenerationError::Engine(format!("generator exited with {status}")));
        }

        let Some((duration_ms, thumbnail_path)) = done else {
            discard_partial(request.output_path);
            return Err(GenerationError::InvalidOutput(
                "generator finished without a done event".to_string(),
            ));
        };
        if !request.output_path.exists() {
            return Err(GenerationError::InvalidOutput(format!(
                "artifact {} was not written",
                request.output_path.display()
            )));
        }

        Ok(GeneratedAudio {
            audio_path: request.output_path.to_path_buf(),
            thumbnail_path,
            duration_ms,
        })
    }
}

/// How often a silent generator is checked for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A spawned generator. Dropping it before it exited on its own kills the
/// process, reaps it and removes the partial artifact.
struct GeneratorProcess<'a> {
    child: Child,
    output_path: &'a Path,
    reaped: bool,
}

impl GeneratorProcess<'_> {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.reaped = status.is_some();
        Ok(status)
    }
}

impl Drop for GeneratorProcess<'_> {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "Generator already exited");
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!(error = %e, "Failed to reap generator process");
        }
        discard_partial(self.output_path);
    }
}

/// Read stdout on its own thread so the caller can poll for cancellation.
///
/// The reader stops after the first I/O error.
fn forward_lines(stdout: ChildStdout) -> Receiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Remove a partially written artifact, if any.
pub fn discard_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial artifact"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation cancelled")]
    Cancelled,

    #[error("Generation engine failed: {0}")]
    Engine(String),

    #[error("Generation produced unusable output: {0}")]
    InvalidOutput(String),

    #[error("Generator I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenerationError {
    /// Category recorded on the job, or `None` for a cancellation.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Cancelled => None,
            Self::Engine(_) | Self::Io(_) => Some(FailureReason::EngineError),
            Self::InvalidOutput(_) => Some(FailureReason::InvalidOutput),
        }
    }
}
