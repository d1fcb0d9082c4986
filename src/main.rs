use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use songsmith::app_state::AppState;
use songsmith::config::AppConfig;
use songsmith::db::{self, JobStore, MemoryJobStore, PgJobStore};
use songsmith::routes::{self, auth::TokenVerifier};
use songsmith::services::generation::{CommandEngine, GenerationEngine};
use songsmith::services::orchestrator::Orchestrator;

/// Upper bound on waiting for the running generation to wind down.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing songsmith server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Job store: PostgreSQL when configured, otherwise process memory
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running database migrations");
            db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");

            Arc::new(PgJobStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, job history will not survive a restart");
            Arc::new(MemoryJobStore::new())
        }
    };

    tokio::fs::create_dir_all(&config.audio_output_dir)
        .await
        .expect("Failed to create audio output directory");

    let orchestrator = Arc::new(Orchestrator::new(store, config.orchestrator_settings()));

    match orchestrator.recover().await {
        Ok(report) => tracing::info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            "Recovered unfinished jobs"
        ),
        Err(e) => tracing::error!(error = %e, "Failed to recover unfinished jobs"),
    }

    let engine: Arc<dyn GenerationEngine> = Arc::new(CommandEngine::new(
        &config.generator_command,
        config.generator_args(),
    ));
    tracing::info!(engine = engine.name(), "Generation engine configured");

    let shutdown = CancellationToken::new();
    let worker = orchestrator.spawn_worker(engine.clone(), shutdown.clone());

    let state = AppState::new(
        orchestrator.clone(),
        TokenVerifier::new(&config.jwt_secret),
        engine.name(),
    );
    let app = routes::router(state, Some(prometheus_handle));

    tracing::info!("Starting songsmith on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal_orchestrator = orchestrator.clone();
    let signal_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received, stopping generation");
            signal_orchestrator.cancel_active();
            signal_shutdown.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    match tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, worker).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Worker task ended abnormally"),
        Err(_) => tracing::warn!(
            timeout_secs = WORKER_SHUTDOWN_TIMEOUT.as_secs(),
            "Worker did not stop in time, exiting anyway"
        ),
    }
    tracing::info!("Server stopped");
}
