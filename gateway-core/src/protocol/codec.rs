//! Decodes inbound text frames, encodes outbound ones.
//!
//! Grounded on the error-classification style of `acton-service::error`
//! (one closed enum, one code per failure mode) but driving the frame-level
//! rules spec'd for this protocol rather than HTTP status mapping: a frame
//! that isn't a JSON object fails closed with id `0`, a missing numeric `id`
//! also fails with id `0` (there's nothing to echo), and everything past
//! that echoes the request's own `id`.

use crate::error::{Error, ErrorCode};
use crate::protocol::messages::{ClientFrame, ClientRequest, PushChannel, ServerFrame, SystemEvent};
use crate::ids::SubscriptionId;

/// A decode failure paired with the `id` the error envelope must carry.
#[derive(Debug)]
pub struct DecodeError {
    pub id: i64,
    pub error: Error,
}

/// Decode one inbound text frame.
///
/// Binary frames are rejected by the caller before reaching this function
/// (they close the connection with code 1003 rather than producing an
/// error envelope); this only handles text.
pub fn decode(text: &str) -> Result<ClientFrame, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| DecodeError {
        id: 0,
        error: Error::Parse(e.to_string()),
    })?;

    let obj = value.as_object().ok_or_else(|| DecodeError {
        id: 0,
        error: Error::Parse("frame must be a JSON object".to_string()),
    })?;

    if obj.get("type").and_then(serde_json::Value::as_str) == Some("pong") {
        let timestamp = obj.get("timestamp").and_then(serde_json::Value::as_i64).unwrap_or(0);
        return Ok(ClientFrame::Pong { timestamp });
    }

    let id = obj
        .get("id")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| DecodeError {
            id: 0,
            error: Error::InvalidRequest("missing numeric `id`".to_string()),
        })?;

    let op = obj
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DecodeError {
            id,
            error: Error::InvalidRequest("missing `type`".to_string()),
        })?
        .to_string();

    Ok(ClientFrame::Request(ClientRequest { id, op, payload: value }))
}

/// Encode the handshake frame sent the instant a connection is accepted.
#[must_use]
pub fn encode_welcome(version: u32, server_time: i64, requires_auth: bool) -> String {
    ServerFrame::Welcome { version, server_time, requires_auth }.to_text()
}

/// Encode a successful response to request `id`.
#[must_use]
pub fn encode_result(id: i64, data: serde_json::Value) -> String {
    ServerFrame::Result { id, data }.to_text()
}

/// Encode an error response, attaching `details` only when the caller
/// (the dispatcher, which knows `exposeErrorDetails`) opts in.
#[must_use]
pub fn encode_error(id: i64, error: &Error, details: Option<serde_json::Value>) -> String {
    ServerFrame::Error {
        id,
        code: error.code(),
        message: error.client_message(),
        details,
    }
    .to_text()
}

/// Encode an error by code directly, for call sites that never had a full
/// `Error` value (e.g. the supervisor rejecting a frame before dispatch).
#[must_use]
pub fn encode_error_code(id: i64, code: ErrorCode, message: impl Into<String>) -> String {
    ServerFrame::Error { id, code, message: message.into(), details: None }.to_text()
}

/// Encode a subscription push frame.
#[must_use]
pub fn encode_subscription_push(subscription_id: SubscriptionId, data: serde_json::Value) -> String {
    ServerFrame::Push { channel: PushChannel::Subscription, subscription_id, data }.to_text()
}

/// Encode a rule-engine event push frame.
#[must_use]
pub fn encode_event_push(subscription_id: SubscriptionId, data: serde_json::Value) -> String {
    ServerFrame::Push { channel: PushChannel::Event, subscription_id, data }.to_text()
}

/// Encode a shutdown system notification.
#[must_use]
pub fn encode_shutdown(grace_period_ms: u64) -> String {
    ServerFrame::System { event: SystemEvent::Shutdown { grace_period_ms } }.to_text()
}

/// Encode a session-revoked system notification.
#[must_use]
pub fn encode_session_revoked(reason: impl Into<String>) -> String {
    ServerFrame::System { event: SystemEvent::SessionRevoked { reason: reason.into() } }.to_text()
}

/// Encode a heartbeat ping.
#[must_use]
pub fn encode_ping(timestamp: i64) -> String {
    ServerFrame::Ping { timestamp }.to_text()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_json_fails_parse_error_with_id_zero() {
        let err = decode("not json").unwrap_err();
        assert_eq!(err.id, 0);
        assert_eq!(err.error.code(), ErrorCode::ParseError);
    }

    #[test]
    fn non_object_fails_parse_error() {
        let err = decode("[1,2,3]").unwrap_err();
        assert_eq!(err.id, 0);
        assert_eq!(err.error.code(), ErrorCode::ParseError);
    }

    #[test]
    fn missing_id_fails_invalid_request_with_id_zero() {
        let err = decode(r#"{"type":"store.get"}"#).unwrap_err();
        assert_eq!(err.id, 0);
        assert_eq!(err.error.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn missing_type_fails_invalid_request_preserving_id() {
        let err = decode(r#"{"id":42}"#).unwrap_err();
        assert_eq!(err.id, 42);
        assert_eq!(err.error.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn pong_is_recognized_without_requiring_an_id() {
        let frame = decode(r#"{"type":"pong","timestamp":1234}"#).unwrap();
        match frame {
            ClientFrame::Pong { timestamp } => assert_eq!(timestamp, 1234),
            ClientFrame::Request(_) => panic!("expected Pong"),
        }
    }

    #[test]
    fn well_formed_request_decodes_with_op_and_payload() {
        let frame = decode(r#"{"id":7,"type":"store.insert","bucket":"widgets"}"#).unwrap();
        match frame {
            ClientFrame::Request(req) => {
                assert_eq!(req.id, 7);
                assert_eq!(req.op, "store.insert");
                assert_eq!(req.payload["bucket"], "widgets");
            }
            ClientFrame::Pong { .. } => panic!("expected Request"),
        }
    }

    #[test]
    fn error_envelope_round_trips_through_serde() {
        let text = encode_error(3, &Error::Forbidden("no access".to_string()), None);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["id"], 3);
        assert_eq!(value["code"], "FORBIDDEN");
        assert!(value.get("details").is_none());
    }
}
