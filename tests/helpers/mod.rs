//! Test helper utilities: orchestrator construction, polling and a live server

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use songsmith::app_state::AppState;
use songsmith::db::JobStore;
use songsmith::models::job::{Job, JobStatus, OwnerId};
use songsmith::routes::{self, auth::TokenVerifier};
use songsmith::services::generation::GenerationEngine;
use songsmith::services::orchestrator::{Orchestrator, OrchestratorSettings};

pub const TEST_SECRET: &str = "integration-test-secret";

/// Fresh output directory under the system temp dir.
pub fn output_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("songsmith-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("Failed to create output dir");
    dir
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_pending: 8,
        progress_interval: Duration::ZERO,
        output_dir: output_dir(),
        ..OrchestratorSettings::default()
    }
}

/// An orchestrator with its worker already running.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub shutdown: CancellationToken,
    pub worker: JoinHandle<()>,
}

impl Harness {
    pub fn start(
        store: Arc<dyn JobStore>,
        settings: OrchestratorSettings,
        engine: Arc<dyn GenerationEngine>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(store, settings));
        let shutdown = CancellationToken::new();
        let worker = orchestrator.spawn_worker(engine, shutdown.clone());
        Self {
            orchestrator,
            shutdown,
            worker,
        }
    }

    pub async fn stop(self) {
        self.orchestrator.cancel_active();
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.worker).await;
    }
}

/// Poll `get_job` until the job reaches `status` (or any terminal status
/// when `status` is terminal and the job ended differently).
pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    owner: &OwnerId,
    job_id: Uuid,
    status: JobStatus,
) -> Job {
    for _ in 0..500 {
        if let Ok(job) = orchestrator.get_job(owner, job_id).await {
            if job.status == status || (status.is_terminal() && job.status.is_terminal()) {
                return job;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("Job {job_id} did not reach {status} within 5 seconds");
}

/// Wait until the orchestrator has no running job and an empty backlog.
pub async fn wait_idle(orchestrator: &Orchestrator) {
    for _ in 0..500 {
        if orchestrator.queue_len() == 0 && !orchestrator.is_busy() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("Orchestrator did not become idle within 5 seconds");
}

/// Serve the full router on an ephemeral port.
pub async fn spawn_app(orchestrator: Arc<Orchestrator>, engine_name: &str) -> SocketAddr {
    let state = AppState::new(orchestrator, TokenVerifier::new(TEST_SECRET), engine_name);
    let app = routes::router(state, None);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Listener has no address");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server error");
    });
    addr
}

pub fn token_for(owner: &str) -> String {
    TokenVerifier::new(TEST_SECRET)
        .issue(&OwnerId::new(owner), 3600)
        .expect("Failed to sign test token")
}
