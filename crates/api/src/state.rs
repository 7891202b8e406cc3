//! Shared state for the API server.

use crate::rate_limit::{RateLimitConfig, RateLimiter};
use munin_coordinator::Coordinator;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by every request handler.
///
/// The coordinator is stateless between turns, so handlers borrow it
/// without locking.
pub struct AppState {
    pub coordinator: Coordinator,
    pub limiter: Arc<RateLimiter>,
    /// Wall-clock budget for one whole turn, triage included.
    pub turn_budget: Duration,
    start_time: Instant,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            turn_budget: Duration::from_secs(120),
            start_time: Instant::now(),
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.limiter = Arc::new(RateLimiter::new(config));
        self
    }

    pub fn with_turn_budget(mut self, budget: Duration) -> Self {
        self.turn_budget = budget;
        self
    }

    /// Uptime in seconds, for health checks.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
