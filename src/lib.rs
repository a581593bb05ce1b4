// lib.rs - Generation pipeline coordinator
pub mod config;
pub mod coordinator;
pub mod escalation;
pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod providers;
pub mod store;

use coordinator::Coordinator;
use std::time::{Duration, Instant};

/// Shared state of the webhook server.
pub struct AppState {
    pub coordinator: Coordinator,
    pub webhook_secret: String,
    /// Upper bound for one request, including a finalize it may trigger.
    pub request_timeout: Duration,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(coordinator: Coordinator, webhook_secret: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            coordinator,
            webhook_secret: webhook_secret.into(),
            request_timeout,
            started_at: Instant::now(),
        }
    }
}
