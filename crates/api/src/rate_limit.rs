//! Per-IP admission control for the turn endpoint.
//!
//! A turn request holds its connection open for the whole SSE stream, so
//! admission covers two things at once: a sliding request window and a cap
//! on concurrently open streams. Both are checked in a single lock pass by
//! [`RateLimiter::begin_turn`], which hands back an RAII permit for the
//! stream slot.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Limits applied per client IP.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per sliding window.
    pub max_requests: u32,
    /// Sliding window duration.
    pub window: Duration,
    /// Maximum concurrent turn streams per IP.
    pub max_concurrent: u32,
    /// Maximum request body size in bytes. Turn bodies carry base64
    /// attachments, so this is well above a typical JSON payload.
    pub max_body_size: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            max_concurrent: 8,
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

/// Why a turn request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    /// Too many requests inside the sliding window.
    Window,
    /// Too many turn streams already open.
    Streams,
}

/// Request history for one IP.
#[derive(Debug)]
struct IpEntry {
    /// Request timestamps inside the current window.
    requests: Vec<Instant>,
    /// Turn streams currently open.
    open_streams: u32,
}

impl IpEntry {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            open_streams: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        self.requests.retain(|&t| now.duration_since(t) < window);
    }

    fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.open_streams == 0
    }
}

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Thread-safe sliding-window limiter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: RwLock<HashMap<IpAddr, IpEntry>>,
    last_cleanup: RwLock<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Admit one turn request from `ip`, claiming a stream slot that is
    /// released when the returned permit drops.
    ///
    /// A request refused for the stream cap still counts against the
    /// request window; hammering the endpoint with parallel turns does not
    /// come free.
    pub fn begin_turn(self: &Arc<Self>, ip: IpAddr) -> Result<TurnPermit, LimitExceeded> {
        self.maybe_cleanup();

        let now = Instant::now();
        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_insert_with(IpEntry::new);
        entry.prune(now, self.config.window);

        if entry.requests.len() >= self.config.max_requests as usize {
            return Err(LimitExceeded::Window);
        }
        entry.requests.push(now);

        if entry.open_streams >= self.config.max_concurrent {
            return Err(LimitExceeded::Streams);
        }
        entry.open_streams += 1;

        Ok(TurnPermit {
            limiter: Arc::clone(self),
            ip,
        })
    }

    fn release_stream(&self, ip: IpAddr) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&ip) {
            entry.open_streams = entry.open_streams.saturating_sub(1);
        }
    }

    pub fn max_body_size(&self) -> usize {
        self.config.max_body_size
    }

    /// Drop idle entries every few minutes so the map does not grow with
    /// every IP ever seen.
    fn maybe_cleanup(&self) {
        let now = Instant::now();
        {
            let last = self.last_cleanup.read();
            if now.duration_since(*last) < CLEANUP_INTERVAL {
                return;
            }
        }

        let mut last = self.last_cleanup.write();
        // Double-check after acquiring the write lock.
        if now.duration_since(*last) < CLEANUP_INTERVAL {
            return;
        }
        *last = now;

        let window = self.config.window;
        let mut entries = self.entries.write();
        entries.retain(|_, entry| {
            entry.prune(now, window);
            !entry.is_idle()
        });
    }

    /// Current limiter state, surfaced by the health endpoint.
    pub fn stats(&self) -> RateLimitStats {
        let entries = self.entries.read();
        RateLimitStats {
            tracked_ips: entries.len(),
            open_streams: entries.values().map(|e| e.open_streams).sum(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimitStats {
    pub tracked_ips: usize,
    pub open_streams: u32,
}

/// One admitted turn's claim on a stream slot. Dropping it releases the
/// slot, so a slot cannot leak when a handler bails early or the client
/// disconnects mid-stream.
#[derive(Debug)]
pub struct TurnPermit {
    limiter: Arc<RateLimiter>,
    ip: IpAddr,
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.limiter.release_stream(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))
    }

    fn limiter(config: RateLimitConfig) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(config))
    }

    #[test]
    fn test_turns_admitted_under_limit() {
        let limiter = limiter(RateLimitConfig {
            max_requests: 6,
            ..Default::default()
        });
        for _ in 0..6 {
            assert!(limiter.begin_turn(test_ip()).is_ok());
        }
    }

    #[test]
    fn test_turn_over_window_is_refused() {
        let limiter = limiter(RateLimitConfig {
            max_requests: 6,
            ..Default::default()
        });
        for _ in 0..6 {
            limiter.begin_turn(test_ip()).ok();
        }
        assert_eq!(
            limiter.begin_turn(test_ip()).unwrap_err(),
            LimitExceeded::Window
        );
    }

    #[test]
    fn test_stream_cap_refuses_then_recovers_on_drop() {
        let limiter = limiter(RateLimitConfig {
            max_concurrent: 4,
            ..Default::default()
        });
        let ip = test_ip();

        let mut permits = Vec::new();
        for _ in 0..4 {
            permits.push(limiter.begin_turn(ip).unwrap());
        }
        assert_eq!(limiter.begin_turn(ip).unwrap_err(), LimitExceeded::Streams);

        permits.pop();
        assert!(limiter.begin_turn(ip).is_ok());
    }

    #[test]
    fn test_stream_refusal_still_consumes_window() {
        let limiter = limiter(RateLimitConfig {
            max_requests: 4,
            max_concurrent: 1,
            ..Default::default()
        });
        let ip = test_ip();

        let _held = limiter.begin_turn(ip).unwrap();
        for _ in 0..3 {
            assert_eq!(limiter.begin_turn(ip).unwrap_err(), LimitExceeded::Streams);
        }
        // Window filled up by the refused attempts.
        assert_eq!(
            limiter.begin_turn(ip).unwrap_err(),
            LimitExceeded::Window
        );
    }

    #[test]
    fn test_separate_ips_have_separate_windows() {
        let limiter = limiter(RateLimitConfig {
            max_requests: 1,
            ..Default::default()
        });
        let first = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let second = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        assert!(limiter.begin_turn(first).is_ok());
        assert_eq!(
            limiter.begin_turn(first).unwrap_err(),
            LimitExceeded::Window
        );
        assert!(limiter.begin_turn(second).is_ok());
    }

    #[test]
    fn test_stats_reflect_open_streams() {
        let limiter = limiter(RateLimitConfig::default());
        let permit = limiter.begin_turn(test_ip()).unwrap();

        let stats = limiter.stats();
        assert_eq!(stats.tracked_ips, 1);
        assert_eq!(stats.open_streams, 1);

        drop(permit);
        assert_eq!(limiter.stats().open_streams, 0);
    }
}
