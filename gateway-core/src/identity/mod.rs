//! Session & identity (§4.5): external-validator and built-in auth as a
//! sum type selected once at construction (§9 "never branch per request on
//! which mode").

pub mod blacklist;
pub mod builtin;
pub mod external;
pub mod password;
pub mod session;

use std::sync::Arc;

pub use blacklist::Blacklist;
pub use builtin::{AuthEpoch, BuiltinIdentity, SUPERADMIN_USER_ID};
pub use external::{PermissionsCheck, Validator};
pub use password::PasswordHasher;
pub use session::Session;

/// The single authorization strategy a server instance is configured with.
pub enum AuthMode {
    External { validator: Arc<dyn Validator>, permissions: Option<Arc<dyn PermissionsCheck>> },
    BuiltIn(Arc<BuiltinIdentity>),
    None,
}

impl AuthMode {
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        !matches!(self, AuthMode::None)
    }
}
