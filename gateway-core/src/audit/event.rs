//! Audit event shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::AuditEventId;

/// Category of an audited occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AuditEventKind {
    AuthLoginSuccess,
    AuthLoginFailed,
    AuthLogout,
    SessionRevoked,
    /// Any dispatched `type` string, e.g. `"store.insert"`.
    Operation { name: String },
}

/// One entry in the tamper-evident trail (§4.5 "audit trail" / §6.4 system
/// buckets, generalized to cover every auditable occurrence, not only auth).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditEventId,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub user_id: Option<String>,
    pub remote_ip: Option<String>,
    pub success: bool,
    pub metadata: Option<serde_json::Value>,
    /// Set by [`super::chain::AuditChain::seal`].
    pub sequence: u64,
    pub previous_hash: Option<String>,
    pub hash: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(kind: AuditEventKind, success: bool) -> Self {
        Self {
            id: AuditEventId::new_v4(),
            timestamp: Utc::now(),
            kind,
            user_id: None,
            remote_ip: None,
            success,
            metadata: None,
            sequence: 0,
            previous_hash: None,
            hash: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn with_remote_ip(mut self, remote_ip: Option<String>) -> Self {
        self.remote_ip = remote_ip;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
