pub mod metrics;
pub mod server;
pub mod state;

pub use server::{make_app, run_server};
pub use state::ServerState;

/// Static server configuration, resolved at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}
