use crate::background_jobs::SchedulerHandle;
use crate::server_store::ServerStore;
use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedServerStore = Arc<dyn ServerStore>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub scheduler_handle: SchedulerHandle,
    pub server_store: GuardedServerStore,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        scheduler_handle: SchedulerHandle,
        server_store: GuardedServerStore,
    ) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            scheduler_handle,
            server_store,
        }
    }
}

impl FromRef<ServerState> for SchedulerHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler_handle.clone()
    }
}
