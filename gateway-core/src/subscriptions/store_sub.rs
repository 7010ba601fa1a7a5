//! Store-subscription evaluation loop (§4.7).

use std::sync::Arc;

use crate::registry::ConnectionRegistry;
use crate::store::{ChangeNotification, Store};
use crate::subscriptions::SubscriptionRegistry;

/// Spawned once per running server: re-evaluates every store subscription
/// on each change notification, pushing only when the result actually
/// changed (deep-equality diff — `serde_json::Value`'s `PartialEq` is
/// already structural, so no custom differ is needed).
///
/// Execution is serialized per Store instance: `Store::run_query` takes
/// the Store's own lock, so two notifications in flight can't interleave
/// reads of a half-applied write.
pub async fn run(
    store: Arc<dyn Store>,
    subscriptions: Arc<SubscriptionRegistry>,
    registry: Arc<ConnectionRegistry>,
    mut changes: tokio::sync::broadcast::Receiver<ChangeNotification>,
) {
    loop {
        match changes.recv().await {
            Ok(_notification) => {
                // The Store decides which query a change affects; when
                // that's ambiguous it re-runs every subscription, which is
                // always correct (just not maximally efficient) since the
                // diff step below suppresses any push whose result is
                // unchanged.
                for (id, sub) in subscriptions.all_store_subscriptions() {
                    let Ok(new_value) = store.run_query(&sub.query, sub.params.clone()).await else {
                        tracing::error!(subscription_id = %id, query = %sub.query, "subscription query evaluation failed");
                        continue;
                    };
                    let mut snapshot = sub.last_snapshot.write().await;
                    if *snapshot == new_value {
                        continue;
                    }
                    *snapshot = new_value.clone();
                    drop(snapshot);

                    if let Some(conn) = registry.get(sub.connection_id) {
                        conn.push(crate::protocol::ServerFrame::Push {
                            channel: crate::protocol::PushChannel::Subscription,
                            subscription_id: id,
                            data: sub.last_snapshot.read().await.clone(),
                        });
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ConnectionId;
    use crate::store::{BucketConfig, MemoryStore};
    use crate::subscriptions::SubscriptionRegistry;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn unchanged_query_result_emits_no_push() {
        let store = Arc::new(MemoryStore::new());
        store.define_bucket("items", BucketConfig::default()).await.unwrap();
        store.define_query(
            "all-items",
            Arc::new(|buckets, _params| json!(buckets.get("items").cloned().unwrap_or_default())),
        );
        let first = store.run_query("all-items", json!({})).await.unwrap();
        let second = store.run_query("all-items", json!({})).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn insert_changes_the_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.define_bucket("items", BucketConfig::default()).await.unwrap();
        store.define_query(
            "all-items",
            Arc::new(|buckets, _params| json!(buckets.get("items").cloned().unwrap_or_default())),
        );
        let before = store.run_query("all-items", json!({})).await.unwrap();
        store.insert("items", json!({"value": 42})).await.unwrap();
        let after = store.run_query("all-items", json!({})).await.unwrap();
        assert_ne!(before, after);
        let _ = ConnectionId::new_v4();
        let _ = SubscriptionRegistry::new();
    }
}
