//! Live subscriptions: store queries (§4.7) and rule-engine event patterns
//! (§4.8), owned exclusively by their connection (§9 "no cyclic ownership").
//!
//! Grounded on the `other_examples` subscription-registry pattern: a
//! `DashMap<SubscriptionId, State>` for direct lookup plus a
//! `DashMap<ConnectionId, Vec<SubscriptionId>>` so closing a connection
//! cleans up its subscriptions in O(k) rather than scanning every live one.

pub mod rules_sub;
pub mod store_sub;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::ids::{ConnectionId, SubscriptionId};

/// (connection, query name, params, last-emitted snapshot) — §3.1.
pub struct StoreSubscription {
    pub connection_id: ConnectionId,
    pub query: String,
    pub params: Value,
    pub last_snapshot: RwLock<Value>,
}

/// (connection, glob pattern) — §3.1. No snapshot: every matching event
/// emits, there's nothing to dedup against.
pub struct RulesSubscription {
    pub connection_id: ConnectionId,
    pub pattern: String,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    store_subs: DashMap<SubscriptionId, Arc<StoreSubscription>>,
    rules_subs: DashMap<SubscriptionId, Arc<RulesSubscription>>,
    by_connection: DashMap<ConnectionId, Vec<SubscriptionId>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_store_subscription(&self, connection_id: ConnectionId, query: String, params: Value, initial_snapshot: Value) -> SubscriptionId {
        let id = SubscriptionId::new_v7();
        self.store_subs.insert(
            id,
            Arc::new(StoreSubscription { connection_id, query, params, last_snapshot: RwLock::new(initial_snapshot) }),
        );
        self.by_connection.entry(connection_id).or_default().push(id);
        id
    }

    pub fn add_rules_subscription(&self, connection_id: ConnectionId, pattern: String) -> SubscriptionId {
        let id = SubscriptionId::new_v7();
        self.rules_subs.insert(id, Arc::new(RulesSubscription { connection_id, pattern }));
        self.by_connection.entry(connection_id).or_default().push(id);
        id
    }

    /// Remove one subscription belonging to `connection_id`. Returns
    /// `false` if `id` doesn't exist or belongs to another connection
    /// (`store.unsubscribe`/`rules.unsubscribe` on an unknown id → `NOT_FOUND`).
    pub fn remove(&self, connection_id: ConnectionId, id: SubscriptionId) -> bool {
        let owned = self
            .store_subs
            .get(&id)
            .map(|s| s.connection_id == connection_id)
            .or_else(|| self.rules_subs.get(&id).map(|s| s.connection_id == connection_id));
        let Some(true) = owned else { return false };

        self.store_subs.remove(&id);
        self.rules_subs.remove(&id);
        if let Some(mut ids) = self.by_connection.get_mut(&connection_id) {
            ids.retain(|existing| *existing != id);
        }
        true
    }

    /// Drop every subscription owned by `connection_id`, e.g. on close.
    pub fn remove_all_for_connection(&self, connection_id: ConnectionId) {
        if let Some((_, ids)) = self.by_connection.remove(&connection_id) {
            for id in ids {
                self.store_subs.remove(&id);
                self.rules_subs.remove(&id);
            }
        }
    }

    #[must_use]
    pub fn count_for_connection(&self, connection_id: ConnectionId) -> usize {
        self.by_connection.get(&connection_id).map(|ids| ids.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn store_subscription_count(&self, query: Option<&str>) -> Vec<Arc<StoreSubscription>> {
        self.store_subs
            .iter()
            .filter(|e| query.map_or(true, |q| e.value().query == q))
            .map(|e| e.value().clone())
            .collect()
    }

    #[must_use]
    pub fn all_store_subscriptions(&self) -> Vec<(SubscriptionId, Arc<StoreSubscription>)> {
        self.store_subs.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }

    #[must_use]
    pub fn all_rules_subscriptions(&self) -> Vec<(SubscriptionId, Arc<RulesSubscription>)> {
        self.rules_subs.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remove_rejects_a_different_connections_subscription() {
        let registry = SubscriptionRegistry::new();
        let owner = ConnectionId::new_v4();
        let other = ConnectionId::new_v4();
        let id = registry.add_store_subscription(owner, "q".to_string(), json!({}), json!([]));
        assert!(!registry.remove(other, id));
        assert!(registry.remove(owner, id));
    }

    #[test]
    fn remove_all_for_connection_clears_mixed_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let conn = ConnectionId::new_v4();
        registry.add_store_subscription(conn, "q".to_string(), json!({}), json!([]));
        registry.add_rules_subscription(conn, "topic.*".to_string());
        assert_eq!(registry.count_for_connection(conn), 2);
        registry.remove_all_for_connection(conn);
        assert_eq!(registry.count_for_connection(conn), 0);
    }

    #[test]
    fn double_unsubscribe_is_rejected_the_second_time() {
        let registry = SubscriptionRegistry::new();
        let conn = ConnectionId::new_v4();
        let id = registry.add_store_subscription(conn, "q".to_string(), json!({}), json!([]));
        assert!(registry.remove(conn, id));
        assert!(!registry.remove(conn, id));
    }
}
