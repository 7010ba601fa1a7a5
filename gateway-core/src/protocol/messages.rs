//! Typed wire shapes for every frame the gateway sends.
//!
//! Grounded on the tagged-enum message style of
//! `acton-service::websocket::messages` (one Rust type per wire shape,
//! `serde` doing the field mapping) generalized from that module's
//! room-coordination messages to the gateway's request/response/push/system
//! envelopes in spec §3.1/§6.1.

use serde::Serialize;

use crate::error::ErrorCode;
use crate::ids::SubscriptionId;

/// Channel a push frame is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushChannel {
    Subscription,
    Event,
}

/// Server-to-client system notifications (§6.1 `event ∈ {shutdown, session_revoked}`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SystemEvent {
    Shutdown { grace_period_ms: u64 },
    SessionRevoked { reason: String },
}

/// Every frame shape the gateway can write to a socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Welcome {
        version: u32,
        server_time: i64,
        requires_auth: bool,
    },
    Result {
        id: i64,
        data: serde_json::Value,
    },
    Error {
        id: i64,
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    Push {
        channel: PushChannel,
        subscription_id: SubscriptionId,
        data: serde_json::Value,
    },
    System {
        #[serde(flatten)]
        event: SystemEvent,
    },
    Ping {
        timestamp: i64,
    },
}

impl ServerFrame {
    /// Serialize to the JSON text sent over the socket.
    #[must_use]
    pub fn to_text(&self) -> String {
        // Every variant here is composed of serializable primitives;
        // serialization failure would be a programming error.
        serde_json::to_string(self).expect("ServerFrame always serializes")
    }
}

/// A decoded, not-yet-routed client request: `{id, type, ...fields}`.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub id: i64,
    /// The `type` field, e.g. `"store.insert"`, doubling as the operation name.
    pub op: String,
    /// The full decoded JSON object, including `id` and `type`, so handlers
    /// can pull whatever extra fields their operation needs.
    pub payload: serde_json::Value,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Request(ClientRequest),
    /// `{type:"pong", timestamp}` — consumed by the heartbeat, never routed.
    Pong { timestamp: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_serializes_with_camel_case_fields() {
        let frame = ServerFrame::Welcome {
            version: 1,
            server_time: 1_700_000_000_000,
            requires_auth: false,
        };
        let text = frame.to_text();
        assert!(text.contains("\"type\":\"welcome\""));
        assert!(text.contains("\"serverTime\":1700000000000"));
        assert!(text.contains("\"requiresAuth\":false"));
    }

    #[test]
    fn system_event_flattens_its_tag_alongside_type() {
        let frame = ServerFrame::System {
            event: SystemEvent::Shutdown { grace_period_ms: 5000 },
        };
        let text = frame.to_text();
        assert!(text.contains("\"type\":\"system\""));
        assert!(text.contains("\"event\":\"shutdown\""));
        assert!(text.contains("\"gracePeriodMs\":5000"));
    }

    #[test]
    fn error_omits_details_when_none() {
        let frame = ServerFrame::Error {
            id: 7,
            code: ErrorCode::Forbidden,
            message: "nope".to_string(),
            details: None,
        };
        assert!(!frame.to_text().contains("details"));
    }
}
