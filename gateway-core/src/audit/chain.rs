//! BLAKE3 hash chain for audit event integrity.
//!
//! Each event's hash covers its content plus the previous event's hash, so
//! tampering with any past event invalidates every hash after it. Grounded
//! on `acton-service`'s `audit::chain` module, trimmed to the fields this
//! crate's [`super::event::AuditEvent`] actually carries and with the
//! `AuditAgent`-owned single-writer assumption made explicit via `&mut self`
//! rather than an actor handle.

use super::event::{AuditEvent, AuditEventKind};

pub struct AuditChain {
    previous_hash: Option<String>,
    sequence: u64,
}

impl Default for AuditChain {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditChain {
    #[must_use]
    pub fn new() -> Self {
        Self { previous_hash: None, sequence: 0 }
    }

    /// Seal `event`: assign the next sequence number, link it to the chain
    /// tip, and compute its hash. Must only be called from the single
    /// writer that owns this chain — sequencing is not synchronized here.
    pub fn seal(&mut self, mut event: AuditEvent) -> AuditEvent {
        self.sequence += 1;
        event.sequence = self.sequence;
        event.previous_hash = self.previous_hash.clone();

        let hash = Self::compute_hash(&event);
        event.hash = Some(hash.clone());
        self.previous_hash = Some(hash);
        event
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn compute_hash(event: &AuditEvent) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(event.sequence.to_le_bytes().as_ref());
        if let Some(prev) = &event.previous_hash {
            hasher.update(prev.as_bytes());
        }
        hasher.update(event.id.as_uuid().as_bytes());
        hasher.update(event.timestamp.to_rfc3339().as_bytes());
        hasher.update(kind_label(&event.kind).as_bytes());
        hasher.update(&[u8::from(event.success)]);
        if let Some(user_id) = &event.user_id {
            hasher.update(user_id.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn kind_label(kind: &AuditEventKind) -> String {
    match kind {
        AuditEventKind::AuthLoginSuccess => "authLoginSuccess".to_string(),
        AuditEventKind::AuthLoginFailed => "authLoginFailed".to_string(),
        AuditEventKind::AuthLogout => "authLogout".to_string(),
        AuditEventKind::SessionRevoked => "sessionRevoked".to_string(),
        AuditEventKind::Operation { name } => format!("operation:{name}"),
    }
}

/// Recompute every hash in `events` (assumed in sequence order) and confirm
/// the chain is unbroken. Returns the sequence number of the first bad link.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), u64> {
    let mut expected_prev: Option<String> = None;
    for event in events {
        if event.previous_hash != expected_prev {
            return Err(event.sequence);
        }
        let recomputed = AuditChain::compute_hash(event);
        if event.hash.as_deref() != Some(recomputed.as_str()) {
            return Err(event.sequence);
        }
        expected_prev = event.hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_events_form_a_verifiable_chain() {
        let mut chain = AuditChain::new();
        let e1 = chain.seal(AuditEvent::new(AuditEventKind::AuthLoginSuccess, true));
        let e2 = chain.seal(AuditEvent::new(AuditEventKind::AuthLogout, true));
        assert_eq!(e2.previous_hash, e1.hash);
        assert!(verify_chain(&[e1, e2]).is_ok());
    }

    #[test]
    fn tampering_with_an_earlier_event_breaks_verification() {
        let mut chain = AuditChain::new();
        let e1 = chain.seal(AuditEvent::new(AuditEventKind::AuthLoginSuccess, true));
        let e2 = chain.seal(AuditEvent::new(AuditEventKind::AuthLogout, true));
        let mut tampered = e1;
        tampered.success = false;
        assert!(verify_chain(&[tampered, e2]).is_err());
    }
}
