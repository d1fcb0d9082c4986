use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint for queue, job and observer metrics.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the service records.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "generation_jobs_submitted_total",
        "Generation jobs admitted to the queue"
    );
    metrics::describe_counter!(
        "generation_jobs_rejected_total",
        "Generation jobs refused because the queue was full"
    );
    metrics::describe_counter!(
        "generation_jobs_completed_total",
        "Generation jobs that produced audio"
    );
    metrics::describe_counter!(
        "generation_jobs_failed_total",
        "Generation jobs that ended in failure"
    );
    metrics::describe_counter!(
        "generation_jobs_cancelled_total",
        "Generation jobs cancelled by their owner"
    );
    metrics::describe_counter!(
        "generation_store_failures_total",
        "Job record writes that failed and were held in memory"
    );
    metrics::describe_histogram!(
        "generation_processing_seconds",
        "Wall time of one generation run"
    );
    metrics::describe_gauge!(
        "generation_queue_depth",
        "Jobs waiting for the generation slot"
    );
    metrics::describe_gauge!("progress_observers", "Registered progress observers");
}
