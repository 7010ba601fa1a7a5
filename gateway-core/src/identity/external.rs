//! External-validator auth mode (§4.5.A).

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::session::Session;

/// Supplied by the embedding application: turns an opaque token into a
/// session, or `None` for an invalid one.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Option<Session>>;
}

/// Optional per-operation permission callback for external-validator mode
/// (§4.6 step 5).
#[async_trait]
pub trait PermissionsCheck: Send + Sync {
    async fn check(&self, session: &Session, operation: &str, resource: &str) -> bool;
}
