//! Per-key fixed-window rate limiting.
//!
//! Grounded on `acton-service::middleware::governor`'s per-key `DashMap` of
//! limiter state, but counting in fixed windows instead of driving the
//! `governor` token-bucket crate: the wire protocol wants an explicit
//! `retryAfterMs` derived from "time left in the window", which a window
//! counter reports directly without reverse-engineering it from a bucket
//! fill rate.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

struct Window {
    started_at_ms: AtomicU64,
    count: AtomicU32,
}

/// Window-based limiter keyed by an arbitrary string (`ip:<addr>` or
/// `user:<id>`, per §4.3).
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    max_requests: u32,
    window_ms: u64,
    enabled: bool,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: config.max_requests,
            window_ms: config.window_ms,
            enabled: config.enabled,
        }
    }

    /// Check and record one request against `key`. Disabled limiters always
    /// succeed.
    pub fn check(&self, key: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let now = now_ms();
        let entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            started_at_ms: AtomicU64::new(now),
            count: AtomicU32::new(0),
        });

        let started_at = entry.started_at_ms.load(Ordering::Relaxed);
        if now.saturating_sub(started_at) >= self.window_ms {
            entry.started_at_ms.store(now, Ordering::Relaxed);
            entry.count.store(0, Ordering::Relaxed);
        }

        let count = entry.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.max_requests {
            let started_at = entry.started_at_ms.load(Ordering::Relaxed);
            let elapsed = now.saturating_sub(started_at);
            let retry_after_ms = self.window_ms.saturating_sub(elapsed);
            return Err(Error::RateLimited { retry_after_ms });
        }
        Ok(())
    }

    /// Drop the counter for `key`, e.g. when a rate-limit key is abandoned
    /// after re-keying `ip:<addr>` → `user:<id>` (invariant 4).
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }
}

/// `(username, ip)`-keyed login attempt limiter, grounded on
/// `acton-service::lockout::service::LoginLockout` translated from Redis
/// counters to an in-memory `DashMap`.
pub struct LoginRateLimiter {
    windows: DashMap<(String, String), Window>,
    max_attempts: u32,
    window_ms: u64,
    enabled: bool,
}

impl LoginRateLimiter {
    #[must_use]
    pub fn new(config: &crate::config::LoginRateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            max_attempts: config.max_attempts,
            window_ms: config.window_secs * 1000,
            enabled: config.enabled,
        }
    }

    pub fn check(&self, username: &str, ip: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let key = (username.to_string(), ip.to_string());
        let now = now_ms();
        let entry = self.windows.entry(key).or_insert_with(|| Window {
            started_at_ms: AtomicU64::new(now),
            count: AtomicU32::new(0),
        });

        let started_at = entry.started_at_ms.load(Ordering::Relaxed);
        if now.saturating_sub(started_at) >= self.window_ms {
            entry.started_at_ms.store(now, Ordering::Relaxed);
            entry.count.store(0, Ordering::Relaxed);
        }

        let count = entry.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.max_attempts {
            let started_at = entry.started_at_ms.load(Ordering::Relaxed);
            let elapsed = now.saturating_sub(started_at);
            return Err(Error::RateLimited { retry_after_ms: self.window_ms.saturating_sub(elapsed) });
        }
        Ok(())
    }

    /// Successful login resets the counter for `username` (any ip), per §4.3.
    pub fn reset_username(&self, username: &str) {
        self.windows.retain(|(u, _), _| u != username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: u32, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig { enabled: true, max_requests: max, window_ms }
    }

    #[test]
    fn exactly_max_requests_succeeds_then_next_fails() {
        let limiter = RateLimiter::new(&config(3, 60_000));
        for _ in 0..3 {
            limiter.check("ip:1.1.1.1").unwrap();
        }
        let err = limiter.check("ip:1.1.1.1").unwrap_err();
        assert!(err.retry_after_ms().is_some());
    }

    #[test]
    fn disabled_limiter_never_rejects() {
        let limiter = RateLimiter::new(&RateLimitConfig { enabled: false, max_requests: 1, window_ms: 1000 });
        limiter.check("k").unwrap();
        limiter.check("k").unwrap();
    }

    #[test]
    fn different_keys_are_independent() {
        let limiter = RateLimiter::new(&config(1, 60_000));
        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn login_limiter_resets_on_username_success() {
        let cfg = crate::config::LoginRateLimitConfig { enabled: true, max_attempts: 1, window_secs: 900 };
        let limiter = LoginRateLimiter::new(&cfg);
        limiter.check("alice", "1.2.3.4").unwrap();
        assert!(limiter.check("alice", "1.2.3.4").is_err());
        limiter.reset_username("alice");
        limiter.check("alice", "1.2.3.4").unwrap();
    }
}
