//! Revoked-user blacklist (§3.1 `BlacklistEntry`, §4.11 admin revocation).
//!
//! Grounded on the TTL-keyed `DashMap` pattern `acton-service`'s rate
//! limiter and lockout services use for their own bounded-lifetime state.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[derive(Default)]
pub struct Blacklist {
    entries: DashMap<String, i64>,
}

impl Blacklist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: impl Into<String>, ttl_ms: i64) {
        self.entries.insert(user_id.into(), now_ms() + ttl_ms);
    }

    /// True if `user_id` is currently blacklisted. Lazily evicts expired
    /// entries it happens to observe.
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        match self.entries.get(user_id) {
            Some(expires_at) if *expires_at > now_ms() => true,
            Some(_) => {
                self.entries.remove(user_id);
                false
            }
            None => false,
        }
    }

    /// Periodic sweep dropping every expired entry, called from a
    /// background interval (mirrors the login-lockout sweep in
    /// `acton-service::lockout`).
    pub fn sweep(&self) {
        let now = now_ms();
        self.entries.retain(|_, expires_at| *expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_blacklisted() {
        let blacklist = Blacklist::new();
        blacklist.insert("u1", 60_000);
        assert!(blacklist.contains("u1"));
    }

    #[test]
    fn expired_entry_is_not_blacklisted() {
        let blacklist = Blacklist::new();
        blacklist.insert("u1", -1);
        assert!(!blacklist.contains("u1"));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let blacklist = Blacklist::new();
        blacklist.insert("u1", -1);
        blacklist.sweep();
        assert_eq!(blacklist.entries.len(), 0);
    }
}
