//! Background job registration and execution system.
//!
//! This module provides the infrastructure for running recurring jobs under a
//! hard execution deadline: a job trait, a bounded runner that races the job
//! body against a merged cancellation signal, and a scheduler that handles
//! manual triggers, retries and per-job serialization.

mod context;
mod handle;
mod job;
pub mod jobs;
mod runner;
mod scheduler;

pub use context::JobContext;
pub use handle::{JobInfo, JobRunInfo, JobScheduleInfo, SchedulerHandle};
pub use job::{JobError, JobSchedule, RecurringJob};
pub use runner::{run_bounded, Invocation};
pub use scheduler::{create_scheduler, JobScheduler};
