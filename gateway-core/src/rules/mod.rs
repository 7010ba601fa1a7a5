//! RuleEngine collaborator interface (§6.3) and an in-memory reference
//! implementation, plus the glob matcher used by rule subscriptions (§4.8).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::Result;

/// One emitted rule-engine event.
#[derive(Debug, Clone)]
pub struct RuleEvent {
    pub topic: String,
    pub data: Value,
    pub correlation_id: Option<String>,
}

/// Narrow interface the gateway consumes for pub/sub topics and key/value
/// facts. Optional — when absent, all `rules.*` operations return
/// `RULES_NOT_AVAILABLE`.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn emit(&self, topic: &str, data: Value, correlation_id: Option<String>) -> Result<()>;
    async fn set_fact(&self, key: &str, value: Value) -> Result<()>;
    async fn get_fact(&self, key: &str) -> Result<Option<Value>>;
    async fn delete_fact(&self, key: &str) -> Result<()>;
    async fn query_facts(&self, pattern: &str) -> Result<Vec<(String, Value)>>;
    async fn get_all_facts(&self) -> Result<Vec<(String, Value)>>;
    fn subscribe_events(&self) -> broadcast::Receiver<RuleEvent>;
    async fn stats(&self) -> Result<Value>;
}

/// In-memory reference `RuleEngine`: a fact map plus a broadcast event bus.
pub struct MemoryRuleEngine {
    facts: std::sync::RwLock<HashMap<String, Value>>,
    events: broadcast::Sender<RuleEvent>,
}

impl Default for MemoryRuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuleEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self { facts: std::sync::RwLock::new(HashMap::new()), events }
    }
}

#[async_trait]
impl RuleEngine for MemoryRuleEngine {
    async fn emit(&self, topic: &str, data: Value, correlation_id: Option<String>) -> Result<()> {
        let _ = self.events.send(RuleEvent { topic: topic.to_string(), data, correlation_id });
        Ok(())
    }

    async fn set_fact(&self, key: &str, value: Value) -> Result<()> {
        self.facts.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_fact(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.facts.read().unwrap().get(key).cloned())
    }

    async fn delete_fact(&self, key: &str) -> Result<()> {
        self.facts.write().unwrap().remove(key);
        Ok(())
    }

    async fn query_facts(&self, pattern: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .facts
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| topic_matches(pattern, k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_all_facts(&self) -> Result<Vec<(String, Value)>> {
        Ok(self.facts.read().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RuleEvent> {
        self.events.subscribe()
    }

    async fn stats(&self) -> Result<Value> {
        Ok(json!({ "factCount": self.facts.read().unwrap().len() }))
    }
}

/// Match a dot-delimited topic against a glob pattern: `*` matches exactly
/// one segment, `**` matches any number of trailing segments. This crate's
/// bundled `MemoryRuleEngine` is the engine the Open Question in spec.md §9
/// defers this choice to.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segs: Vec<&str> = pattern.split('.').collect();
    let topic_segs: Vec<&str> = topic.split('.').collect();
    match_segments(&pattern_segs, &topic_segs)
}

fn match_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.first() {
        None => topic.is_empty(),
        Some(&"**") => {
            if pattern.len() == 1 {
                return true;
            }
            (0..=topic.len()).any(|i| match_segments(&pattern[1..], &topic[i..]))
        }
        Some(&"*") => !topic.is_empty() && match_segments(&pattern[1..], &topic[1..]),
        Some(seg) => topic.first() == Some(seg) && match_segments(&pattern[1..], &topic[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_star_matches_exactly_one_segment() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.extra"));
    }

    #[test]
    fn double_star_matches_any_trailing_segments() {
        assert!(topic_matches("orders.**", "orders.created"));
        assert!(topic_matches("orders.**", "orders.created.shipped"));
        assert!(topic_matches("orders.**", "orders"));
    }

    #[test]
    fn exact_segment_must_match_literally() {
        assert!(!topic_matches("orders.created", "orders.cancelled"));
    }

    #[tokio::test]
    async fn query_facts_filters_by_pattern() {
        let engine = MemoryRuleEngine::new();
        engine.set_fact("user.1.status", json!("online")).await.unwrap();
        engine.set_fact("user.2.status", json!("offline")).await.unwrap();
        engine.set_fact("config.timeout", json!(30)).await.unwrap();
        let matches = engine.query_facts("user.*.status").await.unwrap();
        assert_eq!(matches.len(), 2);
    }
}
