use super::job::{JobError, JobSchedule, RecurringJob};
use crate::server_store::{JobRun, ServerStore};
use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Information about a registered job for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub schedule: JobScheduleInfo,
    pub retry_count: u32,
    pub execute_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub is_running: bool,
    pub last_run: Option<JobRunInfo>,
}

/// Serializable schedule information.
#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

impl From<JobSchedule> for JobScheduleInfo {
    fn from(schedule: JobSchedule) -> Self {
        match schedule {
            JobSchedule::Never => JobScheduleInfo {
                schedule_type: "never".to_string(),
                interval_secs: None,
            },
            JobSchedule::Interval(duration) => JobScheduleInfo {
                schedule_type: "interval".to_string(),
                interval_secs: Some(duration.as_secs()),
            },
        }
    }
}

/// Serializable job run information.
#[derive(Debug, Clone, Serialize)]
pub struct JobRunInfo {
    pub invocation_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

impl From<JobRun> for JobRunInfo {
    fn from(run: JobRun) -> Self {
        JobRunInfo {
            invocation_id: run.invocation_id,
            started_at: run.started_at.to_rfc3339(),
            finished_at: run.finished_at.map(|dt| dt.to_rfc3339()),
            status: run.status.as_str().to_string(),
            attempts: run.attempts,
            error_message: run.error_message,
            triggered_by: run.triggered_by,
        }
    }
}

/// Command sent to the scheduler.
pub(super) enum SchedulerCommand {
    TriggerJob {
        job_id: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
}

/// Shared state between the scheduler and its handle.
pub(super) struct SharedJobState {
    /// Static job info (set at registration, never changes)
    pub jobs: HashMap<String, Arc<dyn RecurringJob>>,
    /// Currently running job IDs
    pub running_jobs: HashSet<String>,
}

/// Handle to interact with the job scheduler from HTTP handlers.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    shared_state: Arc<RwLock<SharedJobState>>,
    server_store: Arc<dyn ServerStore>,
}

impl SchedulerHandle {
    pub(super) fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        shared_state: Arc<RwLock<SharedJobState>>,
        server_store: Arc<dyn ServerStore>,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
            server_store,
        }
    }

    /// Get information about all registered jobs, sorted by job ID.
    pub async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let state = self.shared_state.read().await;
        let mut jobs = Vec::new();

        for (job_id, job) in &state.jobs {
            jobs.push(self.job_info(job_id, job.as_ref(), &state)?);
        }

        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    /// Get information about a specific job.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let state = self.shared_state.read().await;
        match state.jobs.get(job_id) {
            Some(job) => Ok(Some(self.job_info(job_id, job.as_ref(), &state)?)),
            None => Ok(None),
        }
    }

    fn job_info(
        &self,
        job_id: &str,
        job: &dyn RecurringJob,
        state: &SharedJobState,
    ) -> Result<JobInfo> {
        let last_run = self
            .server_store
            .get_last_run(job_id)?
            .map(JobRunInfo::from);
        Ok(JobInfo {
            id: job_id.to_string(),
            name: job.name().to_string(),
            description: job.description().to_string(),
            schedule: job.schedule().into(),
            retry_count: job.retry_count(),
            execute_timeout_secs: job.execute_timeout().as_secs(),
            lock_timeout_secs: job.lock_timeout().as_secs(),
            is_running: state.running_jobs.contains(job_id),
            last_run,
        })
    }

    /// Check whether a job with the given ID is registered.
    pub async fn job_exists(&self, job_id: &str) -> bool {
        self.shared_state.read().await.jobs.contains_key(job_id)
    }

    /// Check whether a job is currently running.
    pub async fn is_job_running(&self, job_id: &str) -> bool {
        self.shared_state
            .read()
            .await
            .running_jobs
            .contains(job_id)
    }

    /// Trigger a job manually.
    pub async fn trigger_job(&self, job_id: &str) -> Result<(), JobError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::TriggerJob {
                job_id: job_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler not available".to_string()))?;

        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler dropped the request".to_string()))?
    }

    /// Get recent run history for a job, newest first.
    pub fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRunInfo>> {
        Ok(self
            .server_store
            .get_job_history(job_id, limit)?
            .into_iter()
            .map(JobRunInfo::from)
            .collect())
    }
}
