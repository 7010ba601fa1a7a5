//! Rules-subscription event fan-out (§4.8).

use std::sync::Arc;

use serde_json::json;

use crate::protocol::{PushChannel, ServerFrame};
use crate::registry::ConnectionRegistry;
use crate::rules::{topic_matches, RuleEvent};
use crate::subscriptions::SubscriptionRegistry;

/// Spawned once per running server (only when a `RuleEngine` is
/// configured): fans every emitted event out to every subscription whose
/// pattern matches its topic. No snapshot, no dedup — unlike store
/// subscriptions every match pushes.
pub async fn run(
    subscriptions: Arc<SubscriptionRegistry>,
    registry: Arc<ConnectionRegistry>,
    mut events: tokio::sync::broadcast::Receiver<RuleEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                for (id, sub) in subscriptions.all_rules_subscriptions() {
                    if !topic_matches(&sub.pattern, &event.topic) {
                        continue;
                    }
                    if let Some(conn) = registry.get(sub.connection_id) {
                        conn.push(ServerFrame::Push {
                            channel: PushChannel::Event,
                            subscription_id: id,
                            data: json!({ "topic": event.topic, "event": event.data }),
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

    #[test]
    fn event_topic_is_matched_against_every_pattern() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "invoices.created"));
    }
}
