//! Persistence for server-side job state.
//!
//! Jobs themselves own no persistent state; the store only keeps the run
//! history the scheduler records around each invocation, so past runs are
//! visible through the admin API after the fact.

mod models;
mod sqlite_server_store;

pub use models::{JobRun, JobRunStatus};
pub use sqlite_server_store::SqliteServerStore;

use anyhow::Result;

pub trait ServerStore: Send + Sync {
    /// Record the start of a job invocation. Returns the run row ID.
    fn record_job_start(
        &self,
        job_id: &str,
        invocation_id: &str,
        triggered_by: &str,
    ) -> Result<i64>;

    /// Record the terminal outcome of a run. `attempts` is the number of
    /// execution attempts actually made (zero when the run never got past
    /// the execution lock).
    fn record_job_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        attempts: u32,
        error_message: Option<String>,
    ) -> Result<()>;

    fn get_running_jobs(&self) -> Result<Vec<JobRun>>;
    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>>;
    fn get_last_run(&self, job_id: &str) -> Result<Option<JobRun>>;

    /// Mark rows still `running` as failed. Called once at startup, so runs
    /// interrupted by a crash do not linger as running forever.
    fn mark_stale_jobs_failed(&self) -> Result<usize>;
}
