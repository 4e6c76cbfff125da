//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::relay::Registry;

/// Shared application state for the webhook server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Identifier → delivery channel map, shared with the SSH sessions.
    pub registry: Registry,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: Registry) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            registry,
        }
    }
}
