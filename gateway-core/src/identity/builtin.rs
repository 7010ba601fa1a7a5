//! Built-in identity (§4.5.B): users, roles, sessions, ACLs, and ownership
//! persisted through the Store's system buckets (§6.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::password::PasswordHasher;
use crate::identity::session::Session;
use crate::ratelimit::LoginRateLimiter;
use crate::store::{BucketConfig, Store};

pub const SUPERADMIN_USER_ID: &str = "__superadmin__";

const SYSTEM_ROLES: &[&str] = &["superadmin", "admin", "writer", "reader"];

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

/// Constant-time byte comparison, to avoid timing side-channels on the
/// admin-secret check.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Bumped on any identity mutation; connections compare their last-seen
/// value against this to decide whether their authorization cache is stale
/// (§4.5, §9 "per-connection cache invalidation").
#[derive(Default)]
pub struct AuthEpoch(AtomicU64);

impl AuthEpoch {
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Built-in identity subsystem: owns the Store's `_users`/`_roles`/
/// `_sessions`/`_user_roles`/`_acl`/`_resource_owners` buckets.
pub struct BuiltinIdentity {
    store: Arc<dyn Store>,
    hasher: PasswordHasher,
    admin_secret: String,
    session_ttl_secs: Option<u64>,
    pub login_rate_limiter: LoginRateLimiter,
    pub epoch: Arc<AuthEpoch>,
}

impl BuiltinIdentity {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        hasher: PasswordHasher,
        admin_secret: String,
        session_ttl_secs: Option<u64>,
        login_rate_limiter: LoginRateLimiter,
    ) -> Self {
        Self { store, hasher, admin_secret, session_ttl_secs, login_rate_limiter, epoch: Arc::new(AuthEpoch::default()) }
    }

    /// Create the system buckets and seed system roles if absent. Call
    /// once at server start; idempotent.
    pub async fn init_system_buckets(&self) -> Result<()> {
        for bucket in ["_users", "_roles", "_sessions", "_user_roles", "_acl", "_resource_owners"] {
            self.store.define_bucket(bucket, BucketConfig::default()).await?;
        }
        for name in SYSTEM_ROLES {
            if self.store.find_one("_roles", json!({"name": name})).await?.is_none() {
                let permissions = match *name {
                    "superadmin" => json!(["read", "write", "admin"]),
                    "admin" => json!(["read", "write", "admin"]),
                    "writer" => json!(["read", "write"]),
                    _ => json!(["read"]),
                };
                self.store
                    .insert("_roles", json!({"name": name, "permissions": permissions, "system": true}))
                    .await?;
            }
        }
        Ok(())
    }

    // --- auth flows -------------------------------------------------------

    pub async fn login_with_secret(&self, secret: &str) -> Result<Session> {
        if !constant_time_eq(secret.as_bytes(), self.admin_secret.as_bytes()) {
            return Err(Error::Unauthorized("Invalid credentials".to_string()));
        }
        Ok(Session {
            user_id: SUPERADMIN_USER_ID.to_string(),
            roles: vec!["superadmin".to_string()],
            expires_at: self.session_ttl_secs.map(|s| now_ms() + (s as i64) * 1000),
            token: None,
        })
    }

    pub async fn login(&self, username: &str, password: &str, remote_ip: &str) -> Result<Session> {
        self.login_rate_limiter.check(username, remote_ip)?;

        let user = self.store.find_one("_users", json!({"username": username})).await?;
        let Some(user) = user else {
            return Err(Error::Unauthorized("Invalid credentials".to_string()));
        };
        if !user["enabled"].as_bool().unwrap_or(true) {
            return Err(Error::Unauthorized("Account disabled".to_string()));
        }
        let hash = user["passwordHash"].as_str().unwrap_or_default();
        if !self.hasher.verify(password, hash)? {
            return Err(Error::Unauthorized("Invalid credentials".to_string()));
        }

        self.login_rate_limiter.reset_username(username);
        let user_id = user["id"].as_str().unwrap_or_default().to_string();
        let roles = self.role_names_for_user(&user_id).await?;
        let token = new_token();
        let expires_at = self.session_ttl_secs.map(|s| now_ms() + (s as i64) * 1000);
        self.store
            .insert("_sessions", json!({"token": token, "userId": user_id, "expiresAt": expires_at}))
            .await?;
        Ok(Session { user_id, roles, expires_at, token: Some(token) })
    }

    pub async fn resolve_token(&self, token: &str) -> Result<Option<Session>> {
        let Some(row) = self.store.find_one("_sessions", json!({"token": token})).await? else {
            return Ok(None);
        };
        let expires_at = row["expiresAt"].as_i64();
        if expires_at.is_some_and(|exp| exp <= now_ms()) {
            return Ok(None);
        }
        let user_id = row["userId"].as_str().unwrap_or_default().to_string();
        let roles = self.role_names_for_user(&user_id).await?;
        Ok(Some(Session { user_id, roles, expires_at, token: Some(token.to_string()) }))
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        if let Some(row) = self.store.find_one("_sessions", json!({"token": token})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_sessions", id).await?;
            }
        }
        Ok(())
    }

    pub async fn refresh_session(&self, old_token: &str) -> Result<Session> {
        let Some(row) = self.store.find_one("_sessions", json!({"token": old_token})).await? else {
            return Err(Error::Unauthorized("Session expired".to_string()));
        };
        let id = row["id"].as_str().unwrap_or_default().to_string();
        let user_id = row["userId"].as_str().unwrap_or_default().to_string();
        let new = new_token();
        let expires_at = self.session_ttl_secs.map(|s| now_ms() + (s as i64) * 1000);
        self.store.delete("_sessions", &id).await?;
        self.store
            .insert("_sessions", json!({"token": new, "userId": user_id, "expiresAt": expires_at}))
            .await?;
        let roles = self.role_names_for_user(&user_id).await?;
        Ok(Session { user_id, roles, expires_at, token: Some(new) })
    }

    async fn delete_all_sessions_for_user(&self, user_id: &str) -> Result<()> {
        for row in self.store.where_matching("_sessions", json!({"userId": user_id})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_sessions", id).await?;
            }
        }
        Ok(())
    }

    // --- users --------------------------------------------------------

    pub async fn create_user(&self, username: &str, password: &str, display_name: Option<String>, email: Option<String>) -> Result<Value> {
        if self.store.find_one("_users", json!({"username": username})).await?.is_some() {
            return Err(Error::AlreadyExists(format!("user {username}")));
        }
        let hash = self.hasher.hash(password)?;
        let mut user = self
            .store
            .insert("_users", json!({"username": username, "passwordHash": hash, "enabled": true}))
            .await?;
        if let Some(obj) = user.as_object_mut() {
            if let Some(name) = display_name {
                obj.insert("displayName".to_string(), json!(name));
            }
            if let Some(email) = email {
                obj.insert("email".to_string(), json!(email));
            }
        }
        if let Some(id) = user["id"].as_str() {
            user = self.store.update("_users", id, user.clone()).await?;
        }
        Ok(redact_password_hash(user))
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Value> {
        let user = self.store.get("_users", user_id).await?.ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        Ok(redact_password_hash(user))
    }

    pub async fn update_user(&self, user_id: &str, patch: Value) -> Result<Value> {
        let mut patch = patch;
        if let Some(obj) = patch.as_object_mut() {
            obj.remove("passwordHash");
            obj.remove("id");
        }
        let user = self.store.update("_users", user_id, patch).await?;
        Ok(redact_password_hash(user))
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.store.delete("_users", user_id).await?;
        self.delete_all_sessions_for_user(user_id).await?;
        for row in self.store.where_matching("_acl", json!({"subjectType": "user", "subjectId": user_id})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_acl", id).await?;
            }
        }
        for row in self.store.where_matching("_resource_owners", json!({"userId": user_id})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_resource_owners", id).await?;
            }
        }
        for row in self.store.where_matching("_user_roles", json!({"userId": user_id})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_user_roles", id).await?;
            }
        }
        self.epoch.bump();
        Ok(())
    }

    pub async fn list_users(&self, page: usize, page_size: usize) -> Result<Value> {
        let mut page_data = self.store.paginate("_users", page, page_size).await?;
        if let Some(items) = page_data.get_mut("items").and_then(Value::as_array_mut) {
            for item in items.iter_mut() {
                *item = redact_password_hash(item.clone());
            }
        }
        Ok(page_data)
    }

    pub async fn set_user_enabled(&self, user_id: &str, enabled: bool) -> Result<Value> {
        let user = self.store.update("_users", user_id, json!({"enabled": enabled})).await?;
        if !enabled {
            self.delete_all_sessions_for_user(user_id).await?;
        }
        self.epoch.bump();
        Ok(redact_password_hash(user))
    }

    pub async fn change_password(&self, user_id: &str, current: &str, new_password: &str) -> Result<()> {
        let user = self.store.get("_users", user_id).await?.ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        let hash = user["passwordHash"].as_str().unwrap_or_default();
        if !self.hasher.verify(current, hash)? {
            return Err(Error::Unauthorized("Invalid credentials".to_string()));
        }
        let new_hash = self.hasher.hash(new_password)?;
        self.store.update("_users", user_id, json!({"passwordHash": new_hash})).await?;
        self.delete_all_sessions_for_user(user_id).await?;
        Ok(())
    }

    pub async fn reset_password(&self, user_id: &str, new_password: &str) -> Result<()> {
        let new_hash = self.hasher.hash(new_password)?;
        self.store.update("_users", user_id, json!({"passwordHash": new_hash})).await?;
        self.delete_all_sessions_for_user(user_id).await?;
        Ok(())
    }

    // --- roles ----------------------------------------------------------

    pub async fn create_role(&self, name: &str, permissions: Value, description: Option<String>) -> Result<Value> {
        if self.store.find_one("_roles", json!({"name": name})).await?.is_some() {
            return Err(Error::AlreadyExists(format!("role {name}")));
        }
        self.store
            .insert("_roles", json!({"name": name, "permissions": permissions, "system": false, "description": description}))
            .await
    }

    pub async fn update_role(&self, role_id: &str, patch: Value) -> Result<Value> {
        let role = self.store.update("_roles", role_id, patch).await?;
        self.epoch.bump();
        Ok(role)
    }

    pub async fn delete_role(&self, role_id: &str) -> Result<()> {
        let role = self.store.get("_roles", role_id).await?.ok_or_else(|| Error::NotFound(role_id.to_string()))?;
        if role["system"].as_bool().unwrap_or(false) {
            return Err(Error::Forbidden("system role cannot be deleted".to_string()));
        }
        self.store.delete("_roles", role_id).await?;
        for row in self.store.where_matching("_user_roles", json!({"roleId": role_id})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_user_roles", id).await?;
            }
        }
        self.epoch.bump();
        Ok(())
    }

    pub async fn list_roles(&self) -> Result<Vec<Value>> {
        self.store.all("_roles").await
    }

    pub async fn assign_role(&self, user_id: &str, role_id: &str) -> Result<()> {
        if self.store.find_one("_user_roles", json!({"userId": user_id, "roleId": role_id})).await?.is_some() {
            return Ok(());
        }
        self.store.insert("_user_roles", json!({"userId": user_id, "roleId": role_id})).await?;
        self.epoch.bump();
        Ok(())
    }

    pub async fn remove_role(&self, user_id: &str, role_id: &str) -> Result<()> {
        if let Some(row) = self.store.find_one("_user_roles", json!({"userId": user_id, "roleId": role_id})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_user_roles", id).await?;
            }
        }
        self.epoch.bump();
        Ok(())
    }

    pub async fn get_user_roles(&self, user_id: &str) -> Result<Vec<Value>> {
        let links = self.store.where_matching("_user_roles", json!({"userId": user_id})).await?;
        let mut roles = Vec::new();
        for link in links {
            if let Some(role_id) = link["roleId"].as_str() {
                if let Some(role) = self.store.get("_roles", role_id).await? {
                    roles.push(role);
                }
            }
        }
        Ok(roles)
    }

    async fn role_names_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self.get_user_roles(user_id).await?.into_iter().filter_map(|r| r["name"].as_str().map(str::to_string)).collect())
    }

    // --- ACL / ownership --------------------------------------------------

    pub async fn grant(&self, subject_type: &str, subject_id: &str, resource_type: &str, resource_name: &str, operations: &[String]) -> Result<Value> {
        const VALID: &[&str] = &["read", "write", "admin"];
        for op in operations {
            if !VALID.contains(&op.as_str()) {
                return Err(Error::Validation(format!("invalid ACL operation: {op}")));
            }
        }
        let existing = self
            .store
            .find_one(
                "_acl",
                json!({"subjectType": subject_type, "subjectId": subject_id, "resourceType": resource_type, "resourceName": resource_name}),
            )
            .await?;
        let entry = if let Some(existing) = existing {
            let id = existing["id"].as_str().unwrap_or_default().to_string();
            self.store.update("_acl", &id, json!({"operations": operations})).await?
        } else {
            self.store
                .insert(
                    "_acl",
                    json!({
                        "subjectType": subject_type, "subjectId": subject_id,
                        "resourceType": resource_type, "resourceName": resource_name,
                        "operations": operations,
                    }),
                )
                .await?
        };
        self.epoch.bump();
        Ok(entry)
    }

    pub async fn revoke(&self, subject_type: &str, subject_id: &str, resource_type: &str, resource_name: &str) -> Result<()> {
        if let Some(entry) = self
            .store
            .find_one(
                "_acl",
                json!({"subjectType": subject_type, "subjectId": subject_id, "resourceType": resource_type, "resourceName": resource_name}),
            )
            .await?
        {
            if let Some(id) = entry["id"].as_str() {
                self.store.delete("_acl", id).await?;
            }
        }
        self.epoch.bump();
        Ok(())
    }

    pub async fn get_acl(&self, resource_type: &str, resource_name: &str) -> Result<Vec<Value>> {
        self.store.where_matching("_acl", json!({"resourceType": resource_type, "resourceName": resource_name})).await
    }

    pub async fn get_owner(&self, resource_type: &str, resource_name: &str) -> Result<Option<Value>> {
        self.store.find_one("_resource_owners", json!({"resourceType": resource_type, "resourceName": resource_name})).await
    }

    /// Effective permissions for `user_id`: every ACL grant reachable through
    /// their user id or role names, plus resources they own outright.
    pub async fn my_access(&self, user_id: &str, roles: &[String]) -> Result<Value> {
        let grants: Vec<Value> = self
            .store
            .all("_acl")
            .await?
            .into_iter()
            .filter(|entry| {
                (entry["subjectType"] == "user" && entry["subjectId"] == user_id)
                    || (entry["subjectType"] == "role" && entry["subjectId"].as_str().is_some_and(|r| roles.iter().any(|x| x == r)))
            })
            .collect();
        let owned = self.store.where_matching("_resource_owners", json!({"userId": user_id})).await?;
        Ok(json!({ "roles": roles, "grants": grants, "owned": owned }))
    }

    pub async fn transfer_owner(&self, resource_type: &str, resource_name: &str, new_user_id: &str) -> Result<Value> {
        let existing = self.get_owner(resource_type, resource_name).await?;
        let owner = if let Some(existing) = existing {
            let id = existing["id"].as_str().unwrap_or_default().to_string();
            self.store.update("_resource_owners", &id, json!({"userId": new_user_id})).await?
        } else {
            self.store
                .insert("_resource_owners", json!({"resourceType": resource_type, "resourceName": resource_name, "userId": new_user_id}))
                .await?
        };
        self.epoch.bump();
        Ok(owner)
    }

    /// Called when a bucket is dropped: its ACL and ownership rows go too.
    pub async fn drop_bucket_policy(&self, bucket_name: &str) -> Result<()> {
        for row in self.store.where_matching("_acl", json!({"resourceType": "bucket", "resourceName": bucket_name})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_acl", id).await?;
            }
        }
        for row in self.store.where_matching("_resource_owners", json!({"resourceType": "bucket", "resourceName": bucket_name})).await? {
            if let Some(id) = row["id"].as_str() {
                self.store.delete("_resource_owners", id).await?;
            }
        }
        Ok(())
    }
}

fn redact_password_hash(mut user: Value) -> Value {
    if let Some(obj) = user.as_object_mut() {
        obj.remove("passwordHash");
    }
    user
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoginRateLimitConfig, PasswordConfig};
    use crate::store::MemoryStore;

    async fn identity() -> BuiltinIdentity {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hasher = PasswordHasher::new(&PasswordConfig::default());
        let identity = BuiltinIdentity::new(
            store,
            hasher,
            "secret".to_string(),
            Some(3600),
            LoginRateLimiter::new(&LoginRateLimitConfig::default()),
        );
        identity.init_system_buckets().await.unwrap();
        identity
    }

    #[tokio::test]
    async fn create_user_never_returns_password_hash() {
        let identity = identity().await;
        let user = identity.create_user("alice", "supersecret1", None, None).await.unwrap();
        assert!(user.get("passwordHash").is_none());
    }

    #[tokio::test]
    async fn login_succeeds_with_correct_password() {
        let identity = identity().await;
        let created = identity.create_user("alice", "supersecret1", None, None).await.unwrap();
        let session = identity.login("alice", "supersecret1", "1.2.3.4").await.unwrap();
        assert_eq!(session.user_id, created["id"].as_str().unwrap());
        assert!(session.token.is_some());
    }

    #[tokio::test]
    async fn login_rejects_wrong_password_with_generic_message() {
        let identity = identity().await;
        identity.create_user("alice", "supersecret1", None, None).await.unwrap();
        let err = identity.login("alice", "wrongpassword", "1.2.3.4").await.unwrap_err();
        assert_eq!(err.client_message(), "unauthorized: Invalid credentials");
    }

    #[tokio::test]
    async fn login_with_secret_grants_virtual_superadmin() {
        let identity = identity().await;
        let session = identity.login_with_secret("secret").await.unwrap();
        assert!(session.is_superadmin());
        assert_eq!(session.roles, vec!["superadmin".to_string()]);
    }

    #[tokio::test]
    async fn delete_user_cascades_sessions_acl_and_ownership() {
        let identity = identity().await;
        let user = identity.create_user("bob", "supersecret1", None, None).await.unwrap();
        let user_id = user["id"].as_str().unwrap().to_string();
        let session = identity.login("bob", "supersecret1", "1.2.3.4").await.unwrap();
        identity.grant("user", &user_id, "bucket", "widgets", &["read".to_string()]).await.unwrap();
        identity.transfer_owner("bucket", "widgets", &user_id).await.unwrap();

        identity.delete_user(&user_id).await.unwrap();

        assert!(identity.resolve_token(&session.token.unwrap()).await.unwrap().is_none());
        assert!(identity.get_acl("bucket", "widgets").await.unwrap().is_empty());
        assert!(identity.get_owner("bucket", "widgets").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grant_rejects_operations_outside_the_closed_set() {
        let identity = identity().await;
        let err = identity.grant("user", "u1", "bucket", "widgets", &["delete".to_string()]).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
    }
}
