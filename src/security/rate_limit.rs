//! Fixed-window rate limiting for inbound requests.
//!
//! Each `(client, category)` pair owns a window `{count, reset_at}`. A request
//! at or after `reset_at` opens a fresh window with `count = 1`; inside a window
//! the request is admitted while `count < max_requests`. Denied requests do not
//! count. Bursts of up to twice the limit are possible across a window boundary.

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::background::spawn_interval;
use crate::http::Request;

/// Bucket for requests whose origin cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Zero denies every request.
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    /// `max_requests` per `window`.
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(60))
    }
}

/// The counter a request is charged to: one window per client per category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Client identity, see [`client_id`].
    pub client: String,
    /// Route category, so sensitive routes can carry tighter limits.
    pub category: String,
}

impl RateLimitKey {
    /// Keys `client` under `category`.
    pub fn new(client: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            category: category.into(),
        }
    }
}

/// Outcome of a check, or the read-only view of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window resets; `0` while requests are allowed.
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

impl Window {
    fn status(&self, config: &RateLimitConfig, now: Instant) -> RateLimitStatus {
        let remaining = config.max_requests.saturating_sub(self.count);
        let allowed = remaining > 0;
        RateLimitStatus {
            allowed,
            limit: config.max_requests,
            remaining,
            retry_after_secs: if allowed {
                0
            } else {
                ceil_secs(self.reset_at.saturating_duration_since(now)).max(1)
            },
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Fixed-window counters keyed by client and route category.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use upguard::security::{RateLimitConfig, RateLimitKey, RateLimiter};
///
/// let limiter = RateLimiter::new();
/// let key = RateLimitKey::new("198.51.100.7", "writes");
/// let config = RateLimitConfig::new(2, Duration::from_secs(60));
///
/// assert!(limiter.check(&key, &config));
/// assert!(limiter.check(&key, &config));
///
/// let denied = limiter.hit(&key, &config);
/// assert!(!denied.allowed);
/// assert!(denied.retry_after_secs >= 1);
/// ```
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<RateLimitKey, Window>,
}

impl RateLimiter {
    /// Creates a limiter with no windows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request against `key` and returns whether it is admitted.
    pub fn check(&self, key: &RateLimitKey, config: &RateLimitConfig) -> bool {
        self.hit(key, config).allowed
    }

    /// Like [`check`](Self::check), returning the window state after the
    /// request was counted.
    pub fn hit(&self, key: &RateLimitKey, config: &RateLimitConfig) -> RateLimitStatus {
        let now = Instant::now();
        match self.windows.entry(key.clone()) {
            Entry::Occupied(mut slot) if now < slot.get().reset_at => {
                let window = slot.get_mut();
                if window.count < config.max_requests {
                    window.count += 1;
                    let mut status = window.status(config, now);
                    status.allowed = true;
                    status
                } else {
                    window.status(config, now)
                }
            }
            _ if config.max_requests == 0 => RateLimitStatus {
                allowed: false,
                limit: 0,
                remaining: 0,
                retry_after_secs: ceil_secs(config.window).max(1),
            },
            slot => {
                let window = Window {
                    count: 1,
                    reset_at: now + config.window,
                };
                let mut status = window.status(config, now);
                status.allowed = true;
                slot.insert(window);
                status
            }
        }
    }

    /// The current window for `key`, without counting a request.
    pub fn status(&self, key: &RateLimitKey, config: &RateLimitConfig) -> RateLimitStatus {
        let now = Instant::now();
        match self.windows.get(key) {
            Some(window) if now < window.reset_at => window.status(config, now),
            _ => RateLimitStatus {
                allowed: config.max_requests > 0,
                limit: config.max_requests,
                remaining: config.max_requests,
                retry_after_secs: 0,
            },
        }
    }

    /// Drops expired windows. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now < window.reset_at);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "expired rate-limit windows swept");
        }
        removed
    }

    /// Windows currently tracked, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Returns `true` if no window is tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Sweeps every `interval` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        spawn_interval("rate-limit-sweep", interval, move || {
            let limiter = limiter.clone();
            async move {
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep();
                        true
                    }
                    None => false,
                }
            }
        })
    }
}

/// Identifies the caller: the peer address, or the first `X-Forwarded-For` hop
/// when the deployment sits behind a trusted proxy. Falls back to
/// [`UNKNOWN_CLIENT`].
pub fn client_id(request: &Request, trust_forwarded_for: bool) -> String {
    let forwarded = || {
        request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok())
    };
    let forwarded = if trust_forwarded_for { forwarded() } else { None };
    forwarded
        .or_else(|| request.peer_addr().map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RateLimitKey {
        RateLimitKey::new("10.0.0.1", "writes")
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_denies() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(3, Duration::from_secs(60));
        assert!(limiter.check(&key(), &config));
        assert!(limiter.check(&key(), &config));
        assert!(limiter.check(&key(), &config));
        assert!(!limiter.check(&key(), &config));
        assert!(!limiter.check(&key(), &config));

        let status = limiter.status(&key(), &config);
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.retry_after_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_at_boundary() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(2, Duration::from_secs(10));
        assert!(limiter.check(&key(), &config));
        assert!(limiter.check(&key(), &config));
        assert!(!limiter.check(&key(), &config));

        tokio::time::advance(Duration::from_millis(9_500)).await;
        assert!(!limiter.check(&key(), &config));
        assert_eq!(limiter.status(&key(), &config).retry_after_secs, 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        let status = limiter.hit(&key(), &config);
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_read_only() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(1, Duration::from_secs(10));
        for _ in 0..5 {
            assert!(limiter.status(&key(), &config).allowed);
        }
        assert!(limiter.check(&key(), &config));
        assert!(!limiter.check(&key(), &config));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_and_categories_are_isolated() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(1, Duration::from_secs(10));
        assert!(limiter.check(&key(), &config));
        assert!(!limiter.check(&key(), &config));
        assert!(limiter.check(&RateLimitKey::new("10.0.0.2", "writes"), &config));
        assert!(limiter.check(&RateLimitKey::new("10.0.0.1", "reads"), &config));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_denies_everything() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(0, Duration::from_secs(5));
        let status = limiter.hit(&key(), &config);
        assert!(!status.allowed);
        assert_eq!(status.retry_after_secs, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_windows() {
        let limiter = RateLimiter::new();
        let short = RateLimitConfig::new(5, Duration::from_secs(1));
        let long = RateLimitConfig::new(5, Duration::from_secs(60));
        limiter.check(&RateLimitKey::new("a", "x"), &short);
        limiter.check(&RateLimitKey::new("b", "x"), &long);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_when_limiter_dropped() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.check(&key(), &RateLimitConfig::new(5, Duration::from_secs(1)));
        let handle = limiter.spawn_sweeper(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(limiter.is_empty());

        drop(limiter);
        handle.await.unwrap();
    }

    #[test]
    fn client_identity() {
        let raw = b"POST / HTTP/1.1\r\nX-Forwarded-For: 203.0.113.9, 10.0.0.1\r\n\r\n";
        let request = Request::parse(raw).unwrap().0;
        assert_eq!(client_id(&request, true), "203.0.113.9");
        assert_eq!(client_id(&request, false), UNKNOWN_CLIENT);

        let request = request.with_peer_addr("192.0.2.4:9000".parse().unwrap());
        assert_eq!(client_id(&request, false), "192.0.2.4");

        let spoofed = b"POST / HTTP/1.1\r\nX-Forwarded-For: not-an-ip\r\n\r\n";
        let request = Request::parse(spoofed).unwrap().0;
        assert_eq!(client_id(&request, true), UNKNOWN_CLIENT);
    }
}
