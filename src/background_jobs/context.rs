use crate::server_store::ServerStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
///
/// Carries references to shared resources and the scheduler's root
/// cancellation token for graceful shutdown handling.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Access to server-side state (run history).
    pub server_store: Arc<dyn ServerStore>,
}

impl JobContext {
    pub fn new(cancellation_token: CancellationToken, server_store: Arc<dyn ServerStore>) -> Self {
        Self {
            cancellation_token,
            server_store,
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
