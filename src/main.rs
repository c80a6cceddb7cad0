use anyhow::Result;
use clap::Parser;
use deadline_jobs::background_jobs::create_scheduler;
use deadline_jobs::background_jobs::jobs::SleeperJob;
use deadline_jobs::config::{AppConfig, CliConfig, FileConfig, JobTuning};
use deadline_jobs::server::{metrics, run_server, ServerConfig, ServerState};
use deadline_jobs::server_store::{ServerStore, SqliteServerStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the SQLite database file for job run history.
    #[clap(long, default_value = "deadline-jobs.db")]
    pub db_path: PathBuf,

    /// Optional TOML config file; its values override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Number of jobs that may execute concurrently.
    #[clap(long, default_value_t = 1)]
    pub worker_count: usize,
}

fn sleeper(id: &str, name: &str, tuning: JobTuning) -> Arc<SleeperJob> {
    Arc::new(SleeperJob::new(
        id,
        name,
        tuning.execute_timeout,
        tuning.lock_timeout,
        tuning.retry_count,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .init();

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let cli_config = CliConfig {
        db_path: Some(cli_args.db_path),
        port: cli_args.port,
        metrics_port: cli_args.metrics_port,
        worker_count: cli_args.worker_count,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening server database at {:?}...", config.db_path);
    let server_store: Arc<dyn ServerStore> = Arc::new(SqliteServerStore::new(&config.db_path)?);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let shutdown_token = CancellationToken::new();
    {
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c, shutting down");
                token.cancel();
            }
        });
    }

    let (mut scheduler, scheduler_handle) = create_scheduler(
        Arc::clone(&server_store),
        shutdown_token.clone(),
        config.worker_count,
    );

    // Two near-identical registrations differing only in their constants,
    // neither of which ever fires on a schedule.
    scheduler
        .register_job(sleeper("sleeper", "Sleeper", config.sleeper))
        .await?;
    scheduler
        .register_job(sleeper("long-sleeper", "Long Sleeper", config.long_sleeper))
        .await?;

    let scheduler_task = tokio::spawn(async move {
        scheduler.run().await;
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::run_metrics_server(metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let server_config = ServerConfig { port: config.port };
    let state = ServerState::new(
        server_config.clone(),
        scheduler_handle,
        Arc::clone(&server_store),
    );
    run_server(server_config, state, shutdown_token.clone()).await?;

    // Server is down; wait for the scheduler to drain in-flight jobs.
    shutdown_token.cancel();
    let _ = scheduler_task.await;
    Ok(())
}
