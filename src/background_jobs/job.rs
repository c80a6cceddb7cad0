use super::context::JobContext;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Schedule for when a job should run.
#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Never run on a timer; the job is only triggered manually.
    Never,
    /// Run at fixed intervals.
    Interval(Duration),
}

/// Errors that can occur during job execution.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found")]
    NotFound,
    #[error("could not acquire the execution lock within {0:?}")]
    LockTimeout(Duration),
    #[error("job was cancelled")]
    Cancelled,
    #[error("execution deadline exceeded")]
    DeadlineExceeded,
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl JobError {
    /// Stable label used for run history and metrics.
    pub fn status_label(&self) -> &'static str {
        match self {
            JobError::NotFound => "not_found",
            JobError::LockTimeout(_) => "lock_timeout",
            JobError::Cancelled => "cancelled",
            JobError::DeadlineExceeded => "deadline_exceeded",
            JobError::ExecutionFailed(_) => "failed",
        }
    }
}

/// Trait for recurring jobs.
///
/// Jobs run as async tasks under the bounded runner: the body receives a
/// cancellation token that fires when either the scheduler cancels the
/// attempt or the job's execution deadline elapses, whichever comes first.
/// Long-running work should stop promptly once the token is cancelled.
#[async_trait]
pub trait RecurringJob: Send + Sync {
    /// Unique identifier for this job.
    fn id(&self) -> &str;

    /// Human-readable name for this job.
    fn name(&self) -> &str;

    /// Description of what this job does.
    fn description(&self) -> &str;

    /// When this job should be scheduled to run.
    fn schedule(&self) -> JobSchedule {
        JobSchedule::Never
    }

    /// Number of re-attempts after the first failure, not the total number
    /// of run attempts. A job that should run at most 3 times before giving
    /// up has a retry count of 2.
    fn retry_count(&self) -> u32;

    /// Hard wall-clock limit for a single execution attempt.
    fn execute_timeout(&self) -> Duration;

    /// How long a trigger waits for the per-job execution lock. Must be
    /// strictly less than `execute_timeout`, leaving headroom so a lock wait
    /// never starves the execution window.
    fn lock_timeout(&self) -> Duration;

    /// Execute one attempt of the job.
    async fn run(&self, ctx: &JobContext, cancellation: CancellationToken)
        -> Result<(), JobError>;
}

/// Check the timeout invariant for a job. Called at registration so a bad
/// configuration is rejected at startup rather than surfacing mid-run.
pub(super) fn validate_timeouts(job: &dyn RecurringJob) -> Result<(), JobError> {
    if job.lock_timeout() >= job.execute_timeout() {
        return Err(JobError::ExecutionFailed(format!(
            "job {}: lock timeout {:?} must be less than execute timeout {:?}",
            job.id(),
            job.lock_timeout(),
            job.execute_timeout(),
        )));
    }
    Ok(())
}
