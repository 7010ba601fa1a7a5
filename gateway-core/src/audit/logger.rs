//! Audit logger: a config-gated, sequentially-chained event sink.

use std::sync::Mutex;

use crate::config::AuditConfig;
use crate::error::Result;

use super::chain::AuditChain;
use super::event::{AuditEvent, AuditEventKind};

/// Logs events through a single hash chain. `Mutex`-guarded rather than
/// actor-owned: this crate has no actor runtime, and a short critical
/// section per event is enough to keep sealing strictly sequential.
pub struct AuditLogger {
    chain: Mutex<AuditChain>,
    events: Mutex<Vec<AuditEvent>>,
    config: AuditConfig,
}

impl AuditLogger {
    #[must_use]
    pub fn new(config: AuditConfig) -> Self {
        Self { chain: Mutex::new(AuditChain::new()), events: Mutex::new(Vec::new()), config }
    }

    #[must_use]
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    fn record(&self, event: AuditEvent) {
        let sealed = self.chain.lock().unwrap().seal(event);
        tracing::info!(
            sequence = sealed.sequence,
            kind = ?sealed.kind,
            user_id = sealed.user_id.as_deref(),
            success = sealed.success,
            "audit event"
        );
        self.events.lock().unwrap().push(sealed);
    }

    /// Log an auth-category event, gated on `audit_auth_events`.
    pub fn log_auth(&self, kind: AuditEventKind, success: bool, user_id: Option<String>, remote_ip: Option<String>) {
        if !self.config.enabled || !self.config.audit_auth_events {
            return;
        }
        self.record(AuditEvent::new(kind, success).with_user(user_id).with_remote_ip(remote_ip));
    }

    /// Log a dispatched operation, gated on `audit_all_operations`.
    pub fn log_operation(&self, name: &str, success: bool, user_id: Option<String>, metadata: Option<serde_json::Value>) {
        if !self.config.enabled || !self.config.audit_all_operations {
            return;
        }
        self.record(
            AuditEvent::new(AuditEventKind::Operation { name: name.to_string() }, success)
                .with_user(user_id)
                .with_metadata(metadata),
        );
    }

    /// Events in sequence order, newest last, optionally filtered by user.
    #[must_use]
    pub fn query(&self, user_id: Option<&str>, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .filter(|e| match user_id {
                None => true,
                Some(want) => e.user_id.as_deref() == Some(want),
            })
            .rev()
            .take(limit)
            .cloned()
            .rev()
            .collect()
    }

    /// Verify the whole chain is intact; `Err` carries the first bad sequence.
    pub fn verify(&self) -> Result<()> {
        let events = self.events.lock().unwrap();
        super::chain::verify_chain(&events).map_err(|seq| crate::error::Error::Internal(format!("audit chain broken at sequence {seq}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuditConfig {
        AuditConfig { enabled: true, audit_auth_events: true, audit_all_operations: true }
    }

    #[test]
    fn disabled_auditing_records_nothing() {
        let logger = AuditLogger::new(AuditConfig { enabled: false, ..config() });
        logger.log_auth(AuditEventKind::AuthLoginSuccess, true, Some("u1".to_string()), None);
        assert!(logger.query(None, 10).is_empty());
    }

    #[test]
    fn query_filters_by_user_and_respects_limit() {
        let logger = AuditLogger::new(config());
        logger.log_auth(AuditEventKind::AuthLoginSuccess, true, Some("u1".to_string()), None);
        logger.log_auth(AuditEventKind::AuthLoginSuccess, true, Some("u2".to_string()), None);
        logger.log_auth(AuditEventKind::AuthLogout, true, Some("u1".to_string()), None);

        let all = logger.query(None, 10);
        assert_eq!(all.len(), 3);
        let u1_only = logger.query(Some("u1"), 10);
        assert_eq!(u1_only.len(), 2);
        let limited = logger.query(None, 1);
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn recorded_events_verify() {
        let logger = AuditLogger::new(config());
        logger.log_operation("store.insert", true, Some("u1".to_string()), None);
        logger.log_operation("store.delete", false, Some("u1".to_string()), None);
        logger.verify().unwrap();
    }
}
