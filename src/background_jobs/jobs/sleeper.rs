//! Job that sleeps until its execution deadline fires.
//!
//! This is the demo payload of the harness: the body is an indefinite wait,
//! so every attempt is terminated by the bounded runner's merged deadline and
//! the whole retry/lock/logging machinery can be observed end to end. The
//! harness registers two instances of this job with different constants.

use crate::background_jobs::{JobContext, JobError, RecurringJob};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A recurring job whose body never completes on its own.
///
/// The timeouts and retry count are fixed at registration time; the same
/// type serves every registered variant.
pub struct SleeperJob {
    id: String,
    name: String,
    description: String,
    execute_timeout: Duration,
    lock_timeout: Duration,
    retry_count: u32,
}

impl SleeperJob {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        execute_timeout: Duration,
        lock_timeout: Duration,
        retry_count: u32,
    ) -> Self {
        let id = id.into();
        Self {
            description: format!("Sleeps until its {:?} execution deadline fires", execute_timeout),
            id,
            name: name.into(),
            execute_timeout,
            lock_timeout,
            retry_count,
        }
    }
}

#[async_trait]
impl RecurringJob for SleeperJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn execute_timeout(&self) -> Duration {
        self.execute_timeout
    }

    fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    async fn run(
        &self,
        _ctx: &JobContext,
        _cancellation: CancellationToken,
    ) -> Result<(), JobError> {
        // Wait indefinitely; the bounded runner terminates the attempt when
        // the merged deadline fires.
        std::future::pending::<()>().await;
        unreachable!("pending future never completes")
    }
}
