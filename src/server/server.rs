use super::metrics;
use super::state::ServerState;
use super::ServerConfig;
use crate::background_jobs::{JobError, SchedulerHandle};
use anyhow::Result;
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home() -> &'static str {
    "Hello World!"
}

async fn stats(State(state): State<ServerState>) -> impl IntoResponse {
    Json(ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
    })
}

async fn list_jobs(State(handle): State<SchedulerHandle>) -> Response {
    match handle.list_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => {
            error!("Failed to list jobs: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_job(State(handle): State<SchedulerHandle>, Path(id): Path<String>) -> Response {
    match handle.get_job(&id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Failed to get job {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn trigger_job(State(handle): State<SchedulerHandle>, Path(id): Path<String>) -> Response {
    match handle.trigger_job(&id).await {
        Ok(()) => {
            info!("Manually triggered job: {}", id);
            StatusCode::ACCEPTED.into_response()
        }
        Err(JobError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Failed to trigger job {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn job_history(
    State(handle): State<SchedulerHandle>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    if !handle.job_exists(&id).await {
        return StatusCode::NOT_FOUND.into_response();
    }

    let limit = params.limit.unwrap_or(20).min(100);
    match handle.get_job_history(&id, limit) {
        Ok(history) => Json(history).into_response(),
        Err(e) => {
            error!("Failed to load history for job {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    metrics::record_http_request(method.as_str(), &path, response.status().as_u16());
    debug!(
        "{} {} -> {} in {:?}",
        method,
        path,
        response.status(),
        start.elapsed()
    );
    response
}

pub fn make_app(state: ServerState) -> Router {
    let job_routes: Router = Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/trigger", post(trigger_job))
        .route("/jobs/{id}/history", get(job_history))
        .with_state(state.clone());

    Router::new()
        .route("/", get(home))
        .route("/stats", get(stats))
        .with_state(state)
        .nest("/v1", job_routes)
        .layer(middleware::from_fn(log_requests))
}

pub async fn run_server(
    config: ServerConfig,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Server listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::create_scheduler;
    use crate::server_store::{ServerStore, SqliteServerStore};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::sync::Arc;
    use tower::ServiceExt; // for `oneshot`

    async fn test_app() -> (Router, CancellationToken) {
        let server_store: Arc<dyn ServerStore> =
            Arc::new(SqliteServerStore::in_memory().unwrap());
        let shutdown = CancellationToken::new();
        let (mut scheduler, handle) =
            create_scheduler(server_store.clone(), shutdown.clone(), 2);

        scheduler
            .register_job(Arc::new(crate::background_jobs::jobs::SleeperJob::new(
                "sleeper",
                "Sleeper",
                Duration::from_secs(60),
                Duration::from_secs(30),
                2,
            )))
            .await
            .unwrap();

        tokio::spawn(async move {
            scheduler.run().await;
        });

        let state = ServerState::new(ServerConfig { port: 0 }, handle, server_store);
        (make_app(state), shutdown)
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn home_returns_greeting() {
        let (app, shutdown) = test_app().await;

        let response = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Hello World!");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn jobs_endpoint_lists_registered_jobs() {
        let (app, shutdown) = test_app().await;

        let response = app
            .oneshot(HttpRequest::get("/v1/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], "sleeper");
        assert_eq!(jobs[0]["schedule"]["type"], "never");
        assert_eq!(jobs[0]["retry_count"], 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (app, shutdown) = test_app().await;

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/v1/jobs/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/v1/jobs/nope/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                HttpRequest::get("/v1/jobs/nope/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn trigger_is_accepted_for_registered_job() {
        let (app, shutdown) = test_app().await;

        let response = app
            .oneshot(
                HttpRequest::post("/v1/jobs/sleeper/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        shutdown.cancel();
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0d 00:00:00");
        assert_eq!(
            format_uptime(Duration::from_secs(86_400 + 3600 + 61)),
            "1d 01:01:01"
        );
    }
}
