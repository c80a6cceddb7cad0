//! Common test infrastructure
//!
//! Spawns an isolated job server on a random port for end-to-end tests.
//! The demo jobs are registered with millisecond-scale timeouts so a full
//! trigger-to-failure cycle completes quickly.

use deadline_jobs::background_jobs::create_scheduler;
use deadline_jobs::background_jobs::jobs::SleeperJob;
use deadline_jobs::server::{make_app, ServerConfig, ServerState};
use deadline_jobs::server_store::{ServerStore, SqliteServerStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Retry count of the fast `sleeper` test job (so 2 attempts total).
pub const SLEEPER_RETRY_COUNT: u32 = 1;

/// Test server instance with an isolated database.
///
/// When dropped, the server and scheduler shut down and temp resources are
/// cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    _temp_dir: TempDir,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestServer {
    /// Spawns a new test server on a random port.
    pub async fn spawn() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("server.db");
        let server_store: Arc<dyn ServerStore> =
            Arc::new(SqliteServerStore::new(&db_path).expect("Failed to open server store"));

        let shutdown = CancellationToken::new();
        let (mut scheduler, scheduler_handle) =
            create_scheduler(Arc::clone(&server_store), shutdown.clone(), 2);

        scheduler
            .register_job(Arc::new(SleeperJob::new(
                "sleeper",
                "Sleeper",
                Duration::from_millis(200),
                Duration::from_millis(100),
                SLEEPER_RETRY_COUNT,
            )))
            .await
            .expect("Failed to register sleeper");
        scheduler
            .register_job(Arc::new(SleeperJob::new(
                "long-sleeper",
                "Long Sleeper",
                Duration::from_millis(400),
                Duration::from_millis(200),
                0,
            )))
            .await
            .expect("Failed to register long-sleeper");

        tokio::spawn(async move {
            scheduler.run().await;
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let state = ServerState::new(ServerConfig { port }, scheduler_handle, server_store);
        let app = make_app(state);

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
                .expect("Server error");
        });

        TestServer {
            base_url,
            _temp_dir: temp_dir,
            shutdown,
        }
    }
}
