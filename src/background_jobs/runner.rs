//! Bounded execution of a single job attempt.
//!
//! The runner races the job body against a merged deadline (the caller's
//! cancellation token OR a wall-clock timer, first to fire wins) and emits a
//! fixed sequence of lifecycle events: `Starting`, optionally a
//! dead-on-arrival warning, optionally `Error`, and always exactly one
//! `Exiting` per invocation.

use super::job::JobError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A single execution attempt of a registered job.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Opaque identifier for this attempt, assigned by the scheduler.
    pub job_id: String,
    /// Identifies which registered job is running.
    pub job_name: String,
}

impl Invocation {
    pub fn new(job_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
        }
    }
}

/// Emits the exit event when dropped, so the event is logged on every exit
/// path: normal completion, propagated errors and panics alike.
struct ExitLogGuard<'a> {
    invocation: &'a Invocation,
}

impl Drop for ExitLogGuard<'_> {
    fn drop(&mut self) {
        info!(
            "Exiting job {} [{}]",
            self.invocation.job_name, self.invocation.job_id
        );
    }
}

/// Run a unit of work under a hard wall-clock deadline.
///
/// The work receives a child of `external` and is terminated when either
/// `external` fires or `execute_timeout` elapses, whichever comes first.
/// Failures are logged and then propagated to the caller, never swallowed,
/// so the retry policy upstream can observe them.
pub async fn run_bounded<F, Fut>(
    invocation: &Invocation,
    external: &CancellationToken,
    execute_timeout: Duration,
    work: F,
) -> Result<(), JobError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), JobError>>,
{
    info!(
        "Starting job {} [{}]",
        invocation.job_name, invocation.job_id
    );

    if external.is_cancelled() {
        // Diagnostic only: the wait below is still attempted and fails
        // near-instantly against the already-cancelled token, so the run is
        // recorded with a proper error rather than silently skipped.
        warn!(
            "Job {} [{}] was already cancelled before the wait started",
            invocation.job_name, invocation.job_id
        );
    }

    let _exit_guard = ExitLogGuard { invocation };

    let merged = external.child_token();
    let result = tokio::select! {
        res = work(merged.clone()) => res,
        _ = external.cancelled() => Err(JobError::Cancelled),
        _ = tokio::time::sleep(execute_timeout) => Err(JobError::DeadlineExceeded),
    };
    // Stop any sub-tasks the work may have spawned with the merged token.
    merged.cancel();

    if let Err(err) = &result {
        error!(
            "Error during job {} [{}]: {}",
            invocation.job_name, invocation.job_id, err
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn invocation() -> Invocation {
        Invocation::new("run-1", "test-job")
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_when_work_never_completes() {
        let token = CancellationToken::new();
        let started = Instant::now();

        let result = run_bounded(&invocation(), &token, Duration::from_secs(60), |_merged| {
            std::future::pending::<Result<(), JobError>>()
        })
        .await;

        assert!(matches!(result, Err(JobError::DeadlineExceeded)));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancellation_wins_over_deadline() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = run_bounded(&invocation(), &token, Duration::from_secs(60), |_merged| {
            std::future::pending::<Result<(), JobError>>()
        })
        .await;

        assert!(matches!(result, Err(JobError::Cancelled)));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_on_arrival_fails_without_waiting_out_the_timeout() {
        let token = CancellationToken::new();
        token.cancel();

        let started = Instant::now();
        let result = run_bounded(&invocation(), &token, Duration::from_secs(60), |_merged| {
            std::future::pending::<Result<(), JobError>>()
        })
        .await;

        assert!(matches!(result, Err(JobError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_work_returns_ok() {
        let token = CancellationToken::new();

        let result = run_bounded(&invocation(), &token, Duration::from_secs(60), |_merged| {
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn work_failure_is_propagated() {
        let token = CancellationToken::new();

        let result = run_bounded(&invocation(), &token, Duration::from_secs(60), |_merged| {
            async { Err(JobError::ExecutionFailed("boom".to_string())) }
        })
        .await;

        match result {
            Err(JobError::ExecutionFailed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("Expected ExecutionFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn merged_token_is_cancelled_after_the_deadline() {
        let token = CancellationToken::new();
        let observed: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let observed_in_work = observed.clone();

        let result = run_bounded(&invocation(), &token, Duration::from_secs(10), |merged| {
            let observed = observed_in_work.clone();
            async move {
                *observed.lock().unwrap() = Some(merged);
                std::future::pending::<Result<(), JobError>>().await
            }
        })
        .await;

        assert!(matches!(result, Err(JobError::DeadlineExceeded)));
        let merged = observed.lock().unwrap().take().unwrap();
        assert!(merged.is_cancelled());
    }

    // Capturing writer so tests can assert on the emitted log sequence.
    #[derive(Clone, Default)]
    struct LogCapture {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_subscriber() -> (LogCapture, impl tracing::Subscriber + Send + Sync) {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .without_time()
            .finish();
        (capture, subscriber)
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_logs_starting_then_error_then_exiting() {
        let (capture, subscriber) = capture_subscriber();
        let guard = tracing::subscriber::set_default(subscriber);

        let token = CancellationToken::new();
        let result = run_bounded(&invocation(), &token, Duration::from_millis(100), |_merged| {
            std::future::pending::<Result<(), JobError>>()
        })
        .await;
        drop(guard);

        assert!(matches!(result, Err(JobError::DeadlineExceeded)));
        let logs = capture.contents();
        let starting = logs.find("Starting job test-job [run-1]").unwrap();
        let error = logs.find("Error during job test-job [run-1]").unwrap();
        let exiting = logs.find("Exiting job test-job [run-1]").unwrap();
        assert!(starting < error);
        assert!(error < exiting);
        assert_eq!(logs.matches("Exiting job").count(), 1);
    }

    #[tokio::test]
    async fn success_logs_no_error_between_starting_and_exiting() {
        let (capture, subscriber) = capture_subscriber();
        let guard = tracing::subscriber::set_default(subscriber);

        let token = CancellationToken::new();
        let result = run_bounded(&invocation(), &token, Duration::from_secs(60), |_merged| {
            async { Ok(()) }
        })
        .await;
        drop(guard);

        assert!(result.is_ok());
        let logs = capture.contents();
        let starting = logs.find("Starting job test-job [run-1]").unwrap();
        let exiting = logs.find("Exiting job test-job [run-1]").unwrap();
        assert!(starting < exiting);
        assert!(!logs.contains("Error during job"));
        assert_eq!(logs.matches("Exiting job").count(), 1);
    }

    #[tokio::test]
    async fn dead_on_arrival_logs_warning_before_the_wait() {
        let (capture, subscriber) = capture_subscriber();
        let guard = tracing::subscriber::set_default(subscriber);

        let token = CancellationToken::new();
        token.cancel();
        let result = run_bounded(&invocation(), &token, Duration::from_secs(60), |_merged| {
            std::future::pending::<Result<(), JobError>>()
        })
        .await;
        drop(guard);

        assert!(matches!(result, Err(JobError::Cancelled)));
        let logs = capture.contents();
        let starting = logs.find("Starting job test-job [run-1]").unwrap();
        let warning = logs
            .find("was already cancelled before the wait started")
            .unwrap();
        let error = logs.find("Error during job test-job [run-1]").unwrap();
        let exiting = logs.find("Exiting job test-job [run-1]").unwrap();
        assert!(starting < warning);
        assert!(warning < error);
        assert!(error < exiting);
    }
}
