//! Connection registry: live-connection bookkeeping shared across the server.
//!
//! Grounded on the per-key `DashMap` pattern `acton-service::middleware::governor`
//! and `lockout::service` use for their own concurrent counters — lock-free
//! reads never block a concurrent insert/remove, which matters here since
//! `server.stats`/`server.connections` enumerate while connections churn.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::ids::{ConnectionId, SubscriptionId};
use crate::protocol::ServerFrame;

/// Everything sent to a connection's write-task: either a frame to
/// serialize onto the socket, or an instruction to close it. Routing both
/// through one channel keeps the supervisor's read loop and the heartbeat
/// sweep from ever touching the socket directly.
#[derive(Debug, Clone)]
pub enum ConnectionSignal {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

/// Everything the rest of the gateway needs to know about one live socket.
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub remote_addr: IpAddr,
    pub connected_at_ms: i64,
    /// `userId` once authenticated, `None` otherwise.
    pub user_id: std::sync::RwLock<Option<String>>,
    pub roles: std::sync::RwLock<Vec<String>>,
    /// Session token, kept so the dispatcher can re-resolve the session
    /// (roles, expiry) when `auth_epoch` goes stale (§4.5).
    pub session_token: std::sync::RwLock<Option<String>>,
    pub session_expires_at: std::sync::RwLock<Option<i64>>,
    pub store_subscriptions: std::sync::RwLock<HashSet<SubscriptionId>>,
    pub rules_subscriptions: std::sync::RwLock<HashSet<SubscriptionId>>,
    pub last_pong_ms: std::sync::atomic::AtomicI64,
    /// Channel the supervisor's write-task drains; every push/system frame
    /// and close instruction for this connection goes through here so
    /// handlers never touch the socket directly.
    pub sender: mpsc::UnboundedSender<ConnectionSignal>,
    /// Last authorization-cache epoch this connection observed (§4.5).
    pub auth_epoch: std::sync::atomic::AtomicU64,
}

impl ConnectionRecord {
    #[must_use]
    pub fn new(remote_addr: IpAddr, sender: mpsc::UnboundedSender<ConnectionSignal>) -> Self {
        let now = now_ms();
        Self {
            id: ConnectionId::new_v4(),
            remote_addr,
            connected_at_ms: now,
            user_id: std::sync::RwLock::new(None),
            roles: std::sync::RwLock::new(Vec::new()),
            session_token: std::sync::RwLock::new(None),
            session_expires_at: std::sync::RwLock::new(None),
            store_subscriptions: std::sync::RwLock::new(HashSet::new()),
            rules_subscriptions: std::sync::RwLock::new(HashSet::new()),
            last_pong_ms: std::sync::atomic::AtomicI64::new(now),
            sender,
            auth_epoch: std::sync::atomic::AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().unwrap().clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user_id.read().unwrap().is_some()
    }

    pub fn set_identity(&self, user_id: Option<String>, roles: Vec<String>) {
        *self.user_id.write().unwrap() = user_id;
        *self.roles.write().unwrap() = roles;
    }

    /// Cache a resolved session's token/expiry alongside identity, so the
    /// dispatcher can refresh from the token alone once `auth_epoch` goes
    /// stale without asking the client to re-authenticate.
    pub fn set_session(&self, token: Option<String>, expires_at: Option<i64>) {
        *self.session_token.write().unwrap() = token;
        *self.session_expires_at.write().unwrap() = expires_at;
    }

    #[must_use]
    pub fn session_token(&self) -> Option<String> {
        self.session_token.read().unwrap().clone()
    }

    #[must_use]
    pub fn session_expires_at(&self) -> Option<i64> {
        *self.session_expires_at.read().unwrap()
    }

    pub fn push(&self, frame: ServerFrame) {
        // The receiving task may already be gone (connection closing); a
        // dropped push is not an error, the connection is on its way out.
        let _ = self.sender.send(ConnectionSignal::Frame(frame));
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.sender.send(ConnectionSignal::Close { code, reason: reason.into() });
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Live-connection map plus per-IP connection counters.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionRecord>>,
    per_ip_counts: DashMap<IpAddr, AtomicUsize>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connection count for `addr`, for the per-IP cap check.
    #[must_use]
    pub fn count_for_ip(&self, addr: IpAddr) -> usize {
        self.per_ip_counts
            .get(&addr)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn add(&self, record: Arc<ConnectionRecord>) {
        self.per_ip_counts
            .entry(record.remote_addr)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.connections.insert(record.id, record);
    }

    /// Remove a connection; idempotent — removing twice is a no-op the
    /// second time (invariant 1: never observed again after removal).
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        let removed = self.connections.remove(&id).map(|(_, v)| v);
        if let Some(record) = &removed {
            if let Some(counter) = self.per_ip_counts.get(&record.remote_addr) {
                counter.fetch_sub(1, Ordering::Relaxed);
            }
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Consistent point-in-time snapshot of every live connection. Taken by
    /// cloning `Arc`s out of the map rather than holding any lock across the
    /// caller's subsequent work.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ConnectionRecord>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot filtered by predicate (matching `userId`/role filters used
    /// by admin revocation and `server.connections`).
    #[must_use]
    pub fn filter(&self, mut predicate: impl FnMut(&ConnectionRecord) -> bool) -> Vec<Arc<ConnectionRecord>> {
        self.connections
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    #[must_use]
    pub fn authenticated_count(&self) -> usize {
        self.connections.iter().filter(|e| e.value().is_authenticated()).count()
    }

    #[must_use]
    pub fn total_store_subscriptions(&self) -> usize {
        self.connections
            .iter()
            .map(|e| e.value().store_subscriptions.read().unwrap().len())
            .sum()
    }

    #[must_use]
    pub fn total_rules_subscriptions(&self) -> usize {
        self.connections
            .iter()
            .map(|e| e.value().rules_subscriptions.read().unwrap().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn add_then_remove_clears_per_ip_counter() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let record = Arc::new(ConnectionRecord::new(addr(), tx));
        let id = record.id;
        registry.add(record);
        assert_eq!(registry.count_for_ip(addr()), 1);
        registry.remove(id);
        assert_eq!(registry.count_for_ip(addr()), 0);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn double_remove_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let record = Arc::new(ConnectionRecord::new(addr(), tx));
        let id = record.id;
        registry.add(record);
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn snapshot_reflects_authenticated_count() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let record = Arc::new(ConnectionRecord::new(addr(), tx));
        record.set_identity(Some("u1".to_string()), vec!["reader".to_string()]);
        registry.add(record);
        assert_eq!(registry.authenticated_count(), 1);
    }
}
