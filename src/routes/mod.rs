//! HTTP and WebSocket surface.

pub mod auth;
pub mod error;
pub mod generate;
pub mod health;
pub mod history;
pub mod metrics;
pub mod progress;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Request bodies are small JSON documents.
const BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Build the application router.
///
/// `/metrics` is only mounted when a Prometheus recorder is installed.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let api = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/generations", post(generate::submit_generation))
        .route("/api/v1/queue", get(generate::get_queue))
        .route("/api/v1/queue/{job_id}", delete(generate::cancel_generation))
        .route("/api/v1/jobs/{job_id}", get(generate::get_job))
        .route("/api/v1/status", get(generate::system_status))
        .route("/api/v1/history", get(history::list_history))
        .route("/api/v1/history/{job_id}", delete(history::delete_history))
        .route(
            "/api/v1/history/{job_id}/thumbnail",
            put(history::attach_thumbnail),
        )
        .route("/api/v1/progress/ws", get(progress::progress_ws))
        .with_state(state);

    let app = match prometheus {
        Some(handle) => api.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        ),
        None => api,
    };

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
}
