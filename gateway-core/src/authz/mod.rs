//! Authorization (§4.6): the ordered per-operation admission pipeline.

use crate::error::{Error, Result};
use crate::identity::{AuthMode, BuiltinIdentity, Session};

/// Coarse permission class mapped from roles for external-validator mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Admin,
    Write,
    Read,
    /// Identity mutation ops and `procedures.register|unregister|update`.
    SuperadminOnly,
    /// `procedures.list`, `identity.createUser`, `identity.listUsers`, role
    /// management beyond listing.
    AdminOnly,
}

/// Operations nothing upstream of authorization gates: the handshake,
/// login/logout/whoami, and built-in login variants (§4.6 preamble).
#[must_use]
pub fn is_exempt(operation: &str) -> bool {
    matches!(operation, "auth.login" | "auth.logout" | "auth.whoami") || operation.starts_with("identity.login")
}

fn required_tier(operation: &str) -> Option<Tier> {
    const ADMIN: &[&str] = &["server.stats", "server.connections", "store.defineBucket", "store.dropBucket", "audit.query"];
    const WRITE: &[&str] = &["store.insert", "store.update", "store.delete", "store.clear", "store.transaction", "procedures.call"];
    const READ_PREFIXES: &[&str] = &[
        "store.get", "store.all", "store.where", "store.findOne", "store.count", "store.first", "store.last",
        "store.paginate", "store.sum", "store.avg", "store.min", "store.max", "store.subscribe",
        "store.unsubscribe", "store.buckets", "store.stats",
    ];
    const SUPERADMIN_ONLY: &[&str] = &["procedures.register", "procedures.unregister", "procedures.update"];
    const ADMIN_ONLY: &[&str] = &["procedures.list", "identity.createUser", "identity.listUsers"];
    // Self-service identity ops: they only ever act on the caller's own
    // session, so any authenticated role may call them regardless of tier.
    const IDENTITY_SELF_SERVICE: &[&str] = &["identity.whoami", "identity.myAccess", "identity.logout", "identity.refreshSession"];

    if SUPERADMIN_ONLY.contains(&operation) || (operation.starts_with("identity.") && !IDENTITY_SELF_SERVICE.contains(&operation)) {
        // Role management beyond listing and every other identity mutation
        // defaults to admin; the two explicit superadmin-only buckets above
        // narrow that down first via the early-return below.
        if SUPERADMIN_ONLY.contains(&operation) {
            return Some(Tier::SuperadminOnly);
        }
        return Some(Tier::AdminOnly);
    }
    if ADMIN_ONLY.contains(&operation) {
        return Some(Tier::AdminOnly);
    }
    if ADMIN.contains(&operation) {
        return Some(Tier::Admin);
    }
    if WRITE.contains(&operation) {
        return Some(Tier::Write);
    }
    if READ_PREFIXES.contains(&operation) || operation.starts_with("procedures.") || operation.starts_with("rules.") {
        return Some(Tier::Read);
    }
    None
}

fn roles_map_to_known_tier(roles: &[String]) -> bool {
    roles.iter().any(|r| matches!(r.as_str(), "admin" | "writer" | "reader" | "superadmin"))
}

fn tier_satisfied(tier: Tier, roles: &[String]) -> bool {
    let has = |r: &str| roles.iter().any(|x| x == r);
    match tier {
        Tier::SuperadminOnly => has("superadmin"),
        Tier::AdminOnly => has("superadmin") || has("admin"),
        Tier::Admin => has("superadmin") || has("admin"),
        Tier::Write => has("superadmin") || has("admin") || has("writer"),
        Tier::Read => has("superadmin") || has("admin") || has("writer") || has("reader"),
    }
}

/// True when `operation` targets a store call carrying a `bucket` argument
/// and that bucket name begins with `_` (§4.6 step 3, invariant 5).
#[must_use]
pub fn targets_system_bucket(bucket: Option<&str>) -> bool {
    bucket.is_some_and(|b| b.starts_with('_'))
}

fn acl_permission_for(operation: &str) -> &'static str {
    if operation.starts_with("store.insert") || operation.starts_with("store.update") || operation.starts_with("store.delete") || operation.starts_with("store.clear") {
        "write"
    } else if operation == "store.defineBucket" || operation == "store.dropBucket" {
        "admin"
    } else {
        "read"
    }
}

/// Run the full ordered pipeline for one operation. `bucket` is the
/// store-bucket name the operation names, if any.
pub async fn authorize(
    auth_mode: &AuthMode,
    session: Option<&Session>,
    operation: &str,
    bucket: Option<&str>,
    now_ms: i64,
) -> Result<()> {
    if is_exempt(operation) {
        return Ok(());
    }

    // 1. auth-gate
    if auth_mode.requires_auth() && session.is_none() {
        return Err(Error::Unauthorized("Authentication required".to_string()));
    }

    // 2. expiry recheck
    if let Some(session) = session {
        if session.is_expired(now_ms) {
            return Err(Error::Unauthorized("Session expired".to_string()));
        }
    }

    // 3. system-bucket guard
    if targets_system_bucket(bucket) {
        return Err(Error::Forbidden("system bucket".to_string()));
    }

    match auth_mode {
        AuthMode::None => Ok(()),
        AuthMode::External { validator: _, permissions } => {
            authorize_external(session, operation, bucket, permissions.as_deref()).await
        }
        AuthMode::BuiltIn(identity) => authorize_builtin(identity, session, operation, bucket).await,
    }
}

async fn authorize_external(
    session: Option<&Session>,
    operation: &str,
    bucket: Option<&str>,
    permissions: Option<&(dyn crate::identity::PermissionsCheck)>,
) -> Result<()> {
    // 4. tier/role check
    if let Some(session) = session {
        if roles_map_to_known_tier(&session.roles) {
            if let Some(tier) = required_tier(operation) {
                if !tier_satisfied(tier, &session.roles) {
                    return Err(Error::Forbidden(format!("operation {operation} requires write/admin access")));
                }
            }
        }
        // custom roles (none of admin/writer/reader/superadmin) bypass the
        // tier check entirely and fall through to the permissions callback.
    }

    // 5. permissions callback
    if let (Some(session), Some(permissions)) = (session, permissions) {
        let resource = bucket.unwrap_or("");
        if !permissions.check(session, operation, resource).await {
            return Err(Error::Forbidden(format!("No permission for {operation} on {resource}")));
        }
    }

    Ok(())
}

async fn authorize_builtin(identity: &BuiltinIdentity, session: Option<&Session>, operation: &str, bucket: Option<&str>) -> Result<()> {
    let Some(session) = session else { return Ok(()) };

    if session.is_superadmin() {
        return Ok(());
    }

    if let Some(tier) = required_tier(operation) {
        if !tier_satisfied(tier, &session.roles) {
            return Err(Error::Forbidden(format!("operation {operation} requires write/admin access")));
        }
    }

    // 6. ACL/owner check for store operations against a named bucket.
    if let Some(bucket) = bucket {
        if operation.starts_with("store.") {
            let permission = acl_permission_for(operation);
            let acl_entries = identity.get_acl("bucket", bucket).await?;
            let user_roles: Vec<String> = session.roles.clone();
            let has_acl = acl_entries.iter().any(|entry| {
                let subject_matches = (entry["subjectType"] == "user" && entry["subjectId"] == session.user_id)
                    || (entry["subjectType"] == "role"
                        && entry["subjectId"].as_str().is_some_and(|r| user_roles.iter().any(|x| x == r)));
                let has_permission = entry["operations"].as_array().is_some_and(|ops| {
                    ops.iter().any(|o| o.as_str() == Some(permission))
                });
                subject_matches && has_permission
            });
            if has_acl {
                return Ok(());
            }
            if let Some(owner) = identity.get_owner("bucket", bucket).await? {
                if owner["userId"].as_str() == Some(session.user_id.as_str()) {
                    return Ok(());
                }
            }
            return Err(Error::Forbidden(format!("No permission for {operation} on {bucket}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_login_variants_are_exempt() {
        assert!(is_exempt("identity.login"));
        assert!(is_exempt("identity.loginWithSecret"));
        assert!(is_exempt("auth.logout"));
        assert!(!is_exempt("store.insert"));
    }

    #[test]
    fn reader_role_cannot_satisfy_write_tier() {
        let roles = vec!["reader".to_string()];
        assert!(!tier_satisfied(Tier::Write, &roles));
        assert!(tier_satisfied(Tier::Read, &roles));
    }

    #[test]
    fn admin_role_does_not_satisfy_superadmin_only_tier() {
        let roles = vec!["admin".to_string()];
        assert!(!tier_satisfied(Tier::SuperadminOnly, &roles));
        assert!(tier_satisfied(Tier::AdminOnly, &roles));
    }

    #[test]
    fn system_bucket_names_are_detected() {
        assert!(targets_system_bucket(Some("_users")));
        assert!(!targets_system_bucket(Some("widgets")));
        assert!(!targets_system_bucket(None));
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected_when_auth_required() {
        let mode = AuthMode::External { validator: std::sync::Arc::new(NoopValidator), permissions: None };
        let err = authorize(&mode, None, "store.all", Some("items"), 0).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn no_auth_mode_allows_everything() {
        authorize(&AuthMode::None, None, "store.insert", Some("items"), 0).await.unwrap();
    }

    struct NoopValidator;
    #[async_trait::async_trait]
    impl crate::identity::Validator for NoopValidator {
        async fn validate(&self, _token: &str) -> Result<Option<Session>> {
            Ok(None)
        }
    }
}
