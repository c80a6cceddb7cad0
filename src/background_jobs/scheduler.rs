use super::context::JobContext;
use super::handle::{SchedulerCommand, SchedulerHandle, SharedJobState};
use super::job::{validate_timeouts, JobError, JobSchedule, RecurringJob};
use super::runner::{run_bounded, Invocation};
use crate::server::metrics;
use crate::server_store::{JobRunStatus, ServerStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for an in-flight job to acknowledge cancellation.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages background job registration and execution.
///
/// Jobs registered with [`JobSchedule::Never`] only run when triggered
/// through the [`SchedulerHandle`]. Each trigger serializes against other
/// invocations of the same job via a per-job lock bounded by the job's lock
/// timeout, runs under the bounded runner, and is re-attempted according to
/// the job's retry count before the failure is recorded.
pub struct JobScheduler {
    /// Shared state accessible by SchedulerHandle
    shared_state: Arc<RwLock<SharedJobState>>,

    /// In-flight job invocations, keyed by invocation ID.
    running_handles: HashMap<String, JoinHandle<()>>,

    /// Per-job execution locks, serializing invocations of the same job.
    job_locks: HashMap<String, Arc<Mutex<()>>>,

    /// Next due time for interval-scheduled jobs.
    next_due: HashMap<String, tokio::time::Instant>,

    /// Server store for persisting run history.
    server_store: Arc<dyn ServerStore>,

    /// Receiver for commands from SchedulerHandle
    command_receiver: mpsc::Receiver<SchedulerCommand>,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,

    /// Shared context provided to jobs during execution.
    job_context: JobContext,

    /// Bounds the number of concurrently executing jobs.
    worker_slots: Arc<Semaphore>,
}

impl JobScheduler {
    fn new(
        server_store: Arc<dyn ServerStore>,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
        job_context: JobContext,
        worker_count: usize,
        shared_state: Arc<RwLock<SharedJobState>>,
    ) -> Self {
        Self {
            shared_state,
            running_handles: HashMap::new(),
            job_locks: HashMap::new(),
            next_due: HashMap::new(),
            server_store,
            command_receiver,
            shutdown_token,
            job_context,
            worker_slots: Arc::new(Semaphore::new(worker_count.max(1))),
        }
    }

    /// Register a job with the scheduler.
    ///
    /// Rejects jobs whose lock timeout is not strictly less than their
    /// execute timeout, so a misconfiguration fails at startup.
    pub async fn register_job(&mut self, job: Arc<dyn RecurringJob>) -> Result<(), JobError> {
        validate_timeouts(job.as_ref())?;

        let job_id = job.id().to_string();
        info!("Registering job: {} - {}", job_id, job.description());

        if let JobSchedule::Interval(interval) = job.schedule() {
            self.next_due
                .insert(job_id.clone(), tokio::time::Instant::now() + interval);
        }
        self.job_locks
            .insert(job_id.clone(), Arc::new(Mutex::new(())));

        let mut state = self.shared_state.write().await;
        state.jobs.insert(job_id, job);
        Ok(())
    }

    /// Get the number of registered jobs.
    pub async fn job_count(&self) -> usize {
        self.shared_state.read().await.jobs.len()
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        let job_count = self.job_count().await;
        info!("Starting job scheduler with {} registered jobs", job_count);

        // On startup: mark any stale running jobs as failed
        match self.server_store.mark_stale_jobs_failed() {
            Ok(count) if count > 0 => {
                info!("Marked {} stale jobs as failed from previous run", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to mark stale jobs: {}", e);
            }
        }

        loop {
            self.cleanup_completed_jobs();

            let sleep_duration = self.time_until_next_due();
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs().await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Job scheduler stopped");
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::TriggerJob { job_id, response } => {
                let result = self.trigger_job(&job_id).await;
                let _ = response.send(result);
            }
        }
    }

    /// Manually trigger a job by ID.
    ///
    /// Triggering does not refuse an already-running job: the spawned
    /// invocation waits on the per-job lock and fails with a lock timeout if
    /// the running invocation does not finish in time.
    async fn trigger_job(&mut self, job_id: &str) -> Result<(), JobError> {
        if !self.shared_state.read().await.jobs.contains_key(job_id) {
            return Err(JobError::NotFound);
        }

        self.spawn_job(job_id, "manual").await;
        Ok(())
    }

    /// Time until the next interval-scheduled job is due.
    fn time_until_next_due(&self) -> Duration {
        let now = tokio::time::Instant::now();
        self.next_due
            .values()
            .map(|due| due.saturating_duration_since(now))
            .min()
            .unwrap_or(Duration::from_secs(60))
    }

    /// Run all interval jobs that are due.
    async fn run_due_jobs(&mut self) {
        let now = tokio::time::Instant::now();
        let mut due_jobs = Vec::new();

        for (job_id, due) in &self.next_due {
            if *due <= now {
                due_jobs.push(job_id.clone());
            }
        }

        for job_id in due_jobs {
            let interval = {
                let state = self.shared_state.read().await;
                match state.jobs.get(&job_id).map(|job| job.schedule()) {
                    Some(JobSchedule::Interval(interval)) => interval,
                    _ => continue,
                }
            };
            self.next_due
                .insert(job_id.clone(), tokio::time::Instant::now() + interval);
            self.spawn_job(&job_id, "schedule").await;
        }
    }

    /// Spawn one invocation of a job.
    async fn spawn_job(&mut self, job_id: &str, triggered_by: &str) {
        let job = {
            let state = self.shared_state.read().await;
            match state.jobs.get(job_id) {
                Some(job) => Arc::clone(job),
                None => {
                    error!("Attempted to spawn unknown job: {}", job_id);
                    return;
                }
            }
        };

        let lock = match self.job_locks.get(job_id) {
            Some(lock) => Arc::clone(lock),
            None => {
                error!("No execution lock for job: {}", job_id);
                return;
            }
        };

        let invocation_id = uuid::Uuid::new_v4().to_string();
        let run_id =
            match self
                .server_store
                .record_job_start(job_id, &invocation_id, triggered_by)
            {
                Ok(id) => id,
                Err(e) => {
                    error!("Failed to record job start for {}: {}", job_id, e);
                    return;
                }
            };

        info!(
            "Queued job: {} (invocation: {}, triggered_by: {})",
            job_id, invocation_id, triggered_by
        );

        let cancel_token = self.job_context.cancellation_token.child_token();
        let ctx = JobContext::new(cancel_token.clone(), Arc::clone(&self.server_store));

        let server_store = Arc::clone(&self.server_store);
        let shared_state = Arc::clone(&self.shared_state);
        let worker_slots = Arc::clone(&self.worker_slots);
        let job_id_owned = job_id.to_string();
        let invocation_key = invocation_id.clone();

        let handle = tokio::spawn(async move {
            let _permit = match worker_slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed, scheduler is gone
            };

            // Serialize invocations of the same job, bounded by the lock
            // timeout so a lock wait never starves the execution window.
            let _lock_guard =
                match tokio::time::timeout(job.lock_timeout(), lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        let err = JobError::LockTimeout(job.lock_timeout());
                        warn!(
                            "Job {} [{}] could not acquire the execution lock within {:?}",
                            job_id_owned,
                            invocation_id,
                            job.lock_timeout()
                        );
                        metrics::record_job_execution(
                            &job_id_owned,
                            err.status_label(),
                            Duration::ZERO,
                        );
                        if let Err(e) = server_store.record_job_finish(
                            run_id,
                            JobRunStatus::Failed,
                            0,
                            Some(err.to_string()),
                        ) {
                            error!("Failed to record job finish for {}: {}", job_id_owned, e);
                        }
                        return;
                    }
                };

            {
                let mut state = shared_state.write().await;
                state.running_jobs.insert(job_id_owned.clone());
            }
            metrics::set_job_running(&job_id_owned, true);

            let start_time = Instant::now();
            let total_attempts = job.retry_count() + 1;
            let mut attempts_made = 0;
            let mut outcome: Result<(), JobError> = Ok(());

            for attempt in 1..=total_attempts {
                attempts_made = attempt;
                // Fresh cancellation signal per attempt, linked to shutdown.
                let attempt_token = cancel_token.child_token();
                let invocation = Invocation::new(
                    format!("{}#{}", invocation_id, attempt),
                    job.name().to_string(),
                );

                outcome = run_bounded(
                    &invocation,
                    &attempt_token,
                    job.execute_timeout(),
                    |merged| job.run(&ctx, merged),
                )
                .await;

                match &outcome {
                    Ok(()) => break,
                    Err(_) if attempt < total_attempts && !cancel_token.is_cancelled() => {
                        warn!(
                            "Job {} [{}] attempt {}/{} failed, re-attempting",
                            job_id_owned, invocation_id, attempt, total_attempts
                        );
                    }
                    Err(_) => break,
                }
            }

            let elapsed = start_time.elapsed();
            let (status, error_msg, status_label) = match &outcome {
                Ok(()) => {
                    info!(
                        "Job {} [{}] completed successfully in {:?}",
                        job_id_owned, invocation_id, elapsed
                    );
                    (JobRunStatus::Completed, None, "success")
                }
                Err(e) => {
                    error!(
                        "Job {} [{}] gave up after {} attempt(s) in {:?}: {}",
                        job_id_owned, invocation_id, attempts_made, elapsed, e
                    );
                    (JobRunStatus::Failed, Some(e.to_string()), e.status_label())
                }
            };

            metrics::record_job_execution(&job_id_owned, status_label, elapsed);
            metrics::set_job_running(&job_id_owned, false);

            if let Err(e) =
                server_store.record_job_finish(run_id, status, attempts_made, error_msg)
            {
                error!("Failed to record job finish for {}: {}", job_id_owned, e);
            }

            {
                let mut state = shared_state.write().await;
                state.running_jobs.remove(&job_id_owned);
            }
        });

        self.running_handles.insert(invocation_key, handle);
    }

    /// Drop handles for invocations that have finished.
    fn cleanup_completed_jobs(&mut self) {
        self.running_handles
            .retain(|_, handle| !handle.is_finished());
    }

    /// Gracefully shut down the scheduler, cancelling in-flight jobs.
    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");
        self.job_context.cancellation_token.cancel();

        for (invocation_id, handle) in self.running_handles.drain() {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!(
                    "Invocation {} did not stop within {:?}",
                    invocation_id, SHUTDOWN_DRAIN_TIMEOUT
                );
            }
        }

        info!("Scheduler shutdown complete");
    }
}

/// Create a scheduler and a handle for interacting with it.
pub fn create_scheduler(
    server_store: Arc<dyn ServerStore>,
    shutdown_token: CancellationToken,
    worker_count: usize,
) -> (JobScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(SharedJobState {
        jobs: HashMap::new(),
        running_jobs: HashSet::new(),
    }));

    let job_context = JobContext::new(shutdown_token.child_token(), Arc::clone(&server_store));

    let scheduler = JobScheduler::new(
        Arc::clone(&server_store),
        command_rx,
        shutdown_token,
        job_context,
        worker_count,
        Arc::clone(&shared_state),
    );

    let handle = SchedulerHandle::new(command_tx, shared_state, server_store);

    (scheduler, handle)
}
