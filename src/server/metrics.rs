//! Prometheus metrics for the job server.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tracing::{error, info};

/// Metric name prefix for all harness metrics
const PREFIX: &str = "deadline_jobs";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOB_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_job_runs_total"),
            "Total number of job runs by terminal status"
        ),
        &["job_id", "status"]
    )
    .expect("Failed to create job_runs_total metric");

    pub static ref JOB_RUN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_run_duration_seconds"),
            "Job run duration in seconds, including retries"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["job_id"]
    )
    .expect("Failed to create job_run_duration_seconds metric");

    pub static ref JOBS_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(
            format!("{PREFIX}_jobs_running"),
            "Whether a job is currently executing"
        ),
        &["job_id"]
    )
    .expect("Failed to create jobs_running metric");

    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_http_requests_total"),
            "Total number of HTTP requests"
        ),
        &["method", "path", "status"]
    )
    .expect("Failed to create http_requests_total metric");
}

/// Register all metrics with the global registry. Safe to call more than
/// once; duplicate registrations are ignored.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(JOB_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
}

pub fn record_job_execution(job_id: &str, status: &str, duration: Duration) {
    JOB_RUNS_TOTAL.with_label_values(&[job_id, status]).inc();
    JOB_RUN_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn set_job_running(job_id: &str, running: bool) {
    JOBS_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_http_request(method: &str, path: &str, status: u16) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `/metrics` on its own port for Prometheus scraping.
pub async fn run_metrics_server(port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
