//! Deadline Jobs Server Library
//!
//! A demonstration harness for timeout-governed background jobs: recurring
//! jobs that never fire on a schedule are triggered manually through the
//! HTTP API and race their body against a hard execution deadline.
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod background_jobs;
pub mod config;
pub mod server;
pub mod server_store;

// Re-export commonly used types for convenience
pub use background_jobs::{
    create_scheduler, JobContext, JobError, JobScheduler, RecurringJob, SchedulerHandle,
};
pub use server::{make_app, run_server, ServerConfig, ServerState};
pub use server_store::{ServerStore, SqliteServerStore};
