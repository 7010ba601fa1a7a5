//! Newtype identifiers used throughout the gateway
//!
//! Unlike the TypeID-prefixed identifiers acton-service uses for request
//! tracing, these are plain UUID newtypes — the wire protocol already tags
//! every envelope with a `type` field, so a prefix on the id itself would be
//! redundant. Connection and session ids use UUIDv4 (unpredictability
//! matters more than sortability for these); subscription ids use UUIDv7 so
//! that cleanup ordering on a connection's subscription list is naturally
//! stable.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            /// Generate a fresh time-sortable identifier.
            #[must_use]
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(ConnectionId, "Identifies one live WebSocket connection.");
uuid_id!(SubscriptionId, "Identifies one live store or rules subscription.");
uuid_id!(RequestId, "Identifies one client request, echoed back in the response envelope.");
uuid_id!(AuditEventId, "Identifies one sealed audit event.");
uuid_id!(SessionId, "Identifies a built-in-auth session token row.");

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new_v4()
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new_v7()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrips_through_parse() {
        let id = ConnectionId::new_v4();
        let s = id.to_string();
        let parsed: ConnectionId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn v7_ids_sort_by_creation_order() {
        let a = SubscriptionId::new_v7();
        let b = SubscriptionId::new_v7();
        assert!(a < b || a == b);
    }

    #[test]
    fn serde_roundtrip_is_a_bare_string() {
        let id = RequestId::new_v4();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
