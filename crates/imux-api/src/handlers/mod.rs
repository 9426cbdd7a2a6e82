//! Handlers for the daemon's local JSON API.

pub mod sessions;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use imux_services::{DestinationRouter, SessionRegistry};

#[derive(Clone)]
pub struct ApiState {
    pub registry: SessionRegistry,
    pub router: Arc<DestinationRouter>,
    /// Address the daemon accepts transport links on.
    pub listen_addr: String,
    pub started_at: Instant,
    /// Sending on this stops the daemon.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

pub use sessions::{handle_session_drop, handle_session_inspect, handle_sessions};
pub use status::{handle_shutdown, handle_status};
