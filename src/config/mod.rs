mod file_config;

pub use file_config::{FileConfig, JobTuningConfig, JobsConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub worker_count: usize,
}

/// Timeout and retry constants for one registered job. Fixed at startup,
/// not runtime-mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTuning {
    pub execute_timeout: Duration,
    pub lock_timeout: Duration,
    pub retry_count: u32,
}

impl JobTuning {
    fn resolve(defaults: JobTuning, file: Option<&JobTuningConfig>) -> Self {
        let file = file.cloned().unwrap_or_default();
        JobTuning {
            execute_timeout: file
                .execute_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.execute_timeout),
            lock_timeout: file
                .lock_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
            retry_count: file.retry_count.unwrap_or(defaults.retry_count),
        }
    }
}

/// The two demo job registrations mirror each other except for their
/// constants: a one-minute sleeper and a slower two-minute variant.
const SLEEPER_DEFAULTS: JobTuning = JobTuning {
    execute_timeout: Duration::from_secs(60),
    lock_timeout: Duration::from_secs(30),
    retry_count: 2,
};

const LONG_SLEEPER_DEFAULTS: JobTuning = JobTuning {
    execute_timeout: Duration::from_secs(120),
    lock_timeout: Duration::from_secs(90),
    retry_count: 1,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub worker_count: usize,
    pub sleeper: JobTuning,
    pub long_sleeper: JobTuning,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file
    /// config. TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let worker_count = file.worker_count.unwrap_or(cli.worker_count);

        let jobs = file.jobs.unwrap_or_default();
        let sleeper = JobTuning::resolve(SLEEPER_DEFAULTS, jobs.sleeper.as_ref());
        let long_sleeper = JobTuning::resolve(LONG_SLEEPER_DEFAULTS, jobs.long_sleeper.as_ref());

        let config = AppConfig {
            db_path,
            port,
            metrics_port,
            worker_count,
            sleeper,
            long_sleeper,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid configurations at startup rather than at run time.
    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be at least 1");
        }
        for (name, tuning) in [("sleeper", self.sleeper), ("long_sleeper", self.long_sleeper)] {
            if tuning.lock_timeout >= tuning.execute_timeout {
                bail!(
                    "{}: lock timeout {:?} must be strictly less than execute timeout {:?}",
                    name,
                    tuning.lock_timeout,
                    tuning.execute_timeout
                );
            }
            if tuning.execute_timeout.is_zero() {
                bail!("{}: execute timeout must be greater than zero", name);
            }
        }
        Ok(())
    }
}
