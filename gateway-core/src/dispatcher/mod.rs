//! Per-request dispatch pipeline (§4.10): rate-limit, auth-gate, authorize,
//! route by `type` prefix, encode the reply.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::audit::AuditLogger;
use crate::authz;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::identity::{AuthMode, Blacklist, Session};
use crate::procedures::{self, ProcedureRegistry};
use crate::protocol::{ClientRequest, ServerFrame};
use crate::ratelimit::RateLimiter;
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use crate::rules::RuleEngine;
use crate::store::Store;
use crate::subscriptions::SubscriptionRegistry;

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Everything a dispatched request needs, shared across every connection.
pub struct DispatcherContext {
    pub store: Arc<dyn Store>,
    pub rules: Option<Arc<dyn RuleEngine>>,
    pub auth_mode: Arc<AuthMode>,
    pub procedures: Arc<ProcedureRegistry>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub registry: Arc<ConnectionRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLogger>,
    pub config: Arc<GatewayConfig>,
    /// Shared with [`crate::supervisor::GatewayState`] so a login attempt
    /// for a just-revoked user is rejected before a new session is issued.
    pub blacklist: Arc<Blacklist>,
}

/// Dispatch one decoded request, always returning a frame to send back
/// (never an `Err` — every failure becomes a `ServerFrame::Error`).
pub async fn dispatch(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, request: ClientRequest) -> ServerFrame {
    let outcome = handle(ctx, conn, &request).await;
    ctx.audit.log_operation(&request.op, outcome.is_ok(), conn.user_id(), None);

    match outcome {
        Ok(data) => ServerFrame::Result { id: request.id, data },
        Err(error) => {
            let details = if ctx.config.service.expose_error_details { error_details(&error) } else { None };
            ServerFrame::Error { id: request.id, code: error.code(), message: error.client_message(), details }
        }
    }
}

fn error_details(error: &Error) -> Option<Value> {
    error.retry_after_ms().map(|ms| json!({ "retryAfterMs": ms }))
}

/// True for operations a revoked/blacklisted user could otherwise use to
/// dodge per-IP login throttling by presenting a stale session (§4.3).
fn is_login_op(op: &str) -> bool {
    matches!(op, "auth.login" | "auth.loginWithSecret") || op.starts_with("identity.login")
}

async fn handle(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, request: &ClientRequest) -> Result<Value> {
    let key = if is_login_op(&request.op) {
        format!("ip:{}", conn.remote_addr)
    } else {
        match conn.user_id() {
            Some(user_id) => format!("user:{user_id}"),
            None => format!("ip:{}", conn.remote_addr),
        }
    };
    ctx.rate_limiter.check(&key)?;

    let session = resolve_session(ctx, conn).await?;
    let bucket = request.payload.get("bucket").and_then(Value::as_str);
    authz::authorize(&ctx.auth_mode, session.as_ref(), &request.op, bucket, now_ms()).await?;

    route(ctx, conn, session.as_ref(), request).await
}

/// Build the `Session` a connection currently presents, refreshing it from
/// the cached token when the global auth epoch has moved past what this
/// connection last observed (§4.5 per-connection cache invalidation).
async fn resolve_session(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>) -> Result<Option<Session>> {
    let Some(user_id) = conn.user_id() else { return Ok(None) };

    let current_epoch = match ctx.auth_mode.as_ref() {
        AuthMode::BuiltIn(identity) => identity.epoch.current(),
        _ => return Ok(Some(Session { user_id, roles: conn.roles.read().unwrap().clone(), expires_at: conn.session_expires_at(), token: conn.session_token() })),
    };

    if conn.auth_epoch.load(std::sync::atomic::Ordering::Acquire) == current_epoch {
        return Ok(Some(Session {
            user_id,
            roles: conn.roles.read().unwrap().clone(),
            expires_at: conn.session_expires_at(),
            token: conn.session_token(),
        }));
    }

    let AuthMode::BuiltIn(identity) = ctx.auth_mode.as_ref() else { unreachable!() };
    let Some(token) = conn.session_token() else {
        return Ok(Some(Session { user_id, roles: conn.roles.read().unwrap().clone(), expires_at: None, token: None }));
    };
    match identity.resolve_token(&token).await? {
        Some(session) => {
            conn.set_identity(Some(session.user_id.clone()), session.roles.clone());
            conn.set_session(session.token.clone(), session.expires_at);
            conn.auth_epoch.store(current_epoch, std::sync::atomic::Ordering::Release);
            Ok(Some(session))
        }
        None => Err(Error::SessionRevoked),
    }
}

async fn route(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, session: Option<&Session>, request: &ClientRequest) -> Result<Value> {
    let op = request.op.as_str();
    let payload = &request.payload;

    if let Some(rest) = op.strip_prefix("store.") {
        return store_ops::handle(ctx, conn, rest, payload).await;
    }
    if let Some(rest) = op.strip_prefix("rules.") {
        return rules_ops::handle(ctx, conn, rest, payload).await;
    }
    if let Some(rest) = op.strip_prefix("identity.") {
        return identity_ops::handle(ctx, conn, session, rest, payload).await;
    }
    if let Some(rest) = op.strip_prefix("auth.") {
        return auth_ops::handle(ctx, conn, session, rest, payload).await;
    }
    if let Some(rest) = op.strip_prefix("procedures.") {
        return procedures_ops::handle(ctx, rest, payload).await;
    }
    if let Some(rest) = op.strip_prefix("server.") {
        return server_ops::handle(ctx, rest).await;
    }
    if let Some(rest) = op.strip_prefix("audit.") {
        return audit_ops::handle(ctx, session, rest, payload).await;
    }
    Err(Error::UnknownOperation(op.to_string()))
}

fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a str> {
    payload.get(name).and_then(Value::as_str)
}

fn require_field<'a>(payload: &'a Value, name: &str) -> Result<&'a str> {
    field(payload, name).ok_or_else(|| Error::InvalidRequest(format!("missing `{name}`")))
}

mod store_ops {
    use super::{field, require_field, Error, Result, Value};
    use crate::dispatcher::DispatcherContext;
    use crate::ids::SubscriptionId;
    use crate::registry::ConnectionRecord;
    use crate::store::{BucketConfig, TxOp};
    use std::sync::Arc;

    pub async fn handle(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, op: &str, payload: &Value) -> Result<Value> {
        let store = &ctx.store;
        match op {
            "defineBucket" => {
                let name = require_field(payload, "bucket")?;
                let config: BucketConfig = payload.get("schema").map(|schema| BucketConfig { schema: Some(schema.clone()) }).unwrap_or_default();
                store.define_bucket(name, config).await?;
                Ok(json!({ "bucket": name }))
            }
            "dropBucket" => {
                let name = require_field(payload, "bucket")?;
                store.drop_bucket(name).await?;
                if let crate::identity::AuthMode::BuiltIn(identity) = ctx.auth_mode.as_ref() {
                    identity.drop_bucket_policy(name).await?;
                }
                Ok(Value::Null)
            }
            "buckets" => Ok(json!(store.buckets().await?)),
            "insert" => {
                let bucket = require_field(payload, "bucket")?;
                let data = payload.get("data").cloned().unwrap_or(json!({}));
                Ok(store.insert(bucket, data).await?)
            }
            "get" => {
                let bucket = require_field(payload, "bucket")?;
                let id = require_field(payload, "id")?;
                Ok(store.get(bucket, id).await?.unwrap_or(Value::Null))
            }
            "update" => {
                let bucket = require_field(payload, "bucket")?;
                let id = require_field(payload, "id")?;
                let data = payload.get("data").cloned().unwrap_or(json!({}));
                Ok(store.update(bucket, id, data).await?)
            }
            "delete" => {
                let bucket = require_field(payload, "bucket")?;
                let id = require_field(payload, "id")?;
                store.delete(bucket, id).await?;
                Ok(Value::Null)
            }
            "all" => Ok(json!(store.all(require_field(payload, "bucket")?).await?)),
            "where" => {
                let bucket = require_field(payload, "bucket")?;
                let filter = payload.get("filter").cloned().unwrap_or(json!({}));
                Ok(json!(store.where_matching(bucket, filter).await?))
            }
            "findOne" => {
                let bucket = require_field(payload, "bucket")?;
                let filter = payload.get("filter").cloned().unwrap_or(json!({}));
                Ok(store.find_one(bucket, filter).await?.unwrap_or(Value::Null))
            }
            "count" => {
                let bucket = require_field(payload, "bucket")?;
                Ok(json!(store.count(bucket, payload.get("filter").cloned()).await?))
            }
            "clear" => {
                store.clear(require_field(payload, "bucket")?).await?;
                Ok(Value::Null)
            }
            "first" => Ok(store.first(require_field(payload, "bucket")?).await?.unwrap_or(Value::Null)),
            "last" => Ok(store.last(require_field(payload, "bucket")?).await?.unwrap_or(Value::Null)),
            "paginate" => {
                let bucket = require_field(payload, "bucket")?;
                let page = payload.get("page").and_then(Value::as_u64).unwrap_or(1) as usize;
                let page_size = payload.get("pageSize").and_then(Value::as_u64).unwrap_or(20) as usize;
                Ok(store.paginate(bucket, page, page_size).await?)
            }
            "sum" => Ok(json!(store.sum(require_field(payload, "bucket")?, require_field(payload, "field")?).await?)),
            "avg" => Ok(json!(store.avg(require_field(payload, "bucket")?, require_field(payload, "field")?).await?)),
            "min" => Ok(json!(store.min(require_field(payload, "bucket")?, require_field(payload, "field")?).await?)),
            "max" => Ok(json!(store.max(require_field(payload, "bucket")?, require_field(payload, "field")?).await?)),
            "transaction" => {
                let ops = payload.get("ops").and_then(Value::as_array).ok_or_else(|| Error::InvalidRequest("missing `ops`".to_string()))?;
                let tx_ops = ops.iter().map(parse_tx_op).collect::<Result<Vec<_>>>()?;
                Ok(json!(store.transaction(tx_ops).await?))
            }
            "subscribe" => {
                let query = require_field(payload, "query")?.to_string();
                let params = payload.get("params").cloned().unwrap_or(json!({}));
                let limit = ctx.config.subscriptions.max_store_subscriptions_per_connection;
                if conn.store_subscriptions.read().unwrap().len() >= limit {
                    return Err(Error::Validation("store subscription limit reached".to_string()));
                }
                let snapshot = store.run_query(&query, params.clone()).await?;
                let id = ctx.subscriptions.add_store_subscription(conn.id, query, params, snapshot.clone());
                conn.store_subscriptions.write().unwrap().insert(id);
                Ok(json!({ "subscriptionId": id, "snapshot": snapshot }))
            }
            "unsubscribe" => {
                let id_str = require_field(payload, "subscriptionId")?;
                let id: SubscriptionId = id_str.parse().map_err(|_| Error::InvalidRequest("invalid subscriptionId".to_string()))?;
                if !ctx.subscriptions.remove(conn.id, id) {
                    return Err(Error::NotFound(id_str.to_string()));
                }
                conn.store_subscriptions.write().unwrap().remove(&id);
                Ok(Value::Null)
            }
            "stats" => store.stats().await,
            other => Err(Error::UnknownOperation(format!("store.{other}"))),
        }
    }

    fn parse_tx_op(value: &Value) -> Result<TxOp> {
        let action = field(value, "action").ok_or_else(|| Error::InvalidRequest("transaction op missing `action`".to_string()))?;
        let bucket = require_field(value, "bucket")?.to_string();
        match action {
            "insert" => Ok(TxOp::Insert { bucket, data: value.get("data").cloned().unwrap_or(json!({})) }),
            "update" => Ok(TxOp::Update { bucket, id: require_field(value, "id")?.to_string(), data: value.get("data").cloned().unwrap_or(json!({})) }),
            "delete" => Ok(TxOp::Delete { bucket, id: require_field(value, "id")?.to_string() }),
            "get" => Ok(TxOp::Get { bucket, id: require_field(value, "id")?.to_string() }),
            other => Err(Error::InvalidRequest(format!("unknown transaction op action: {other}"))),
        }
    }

    use serde_json::json;
}

mod rules_ops {
    use super::{require_field, Error, Result, Value};
    use crate::dispatcher::DispatcherContext;
    use crate::ids::SubscriptionId;
    use crate::registry::ConnectionRecord;
    use serde_json::json;
    use std::sync::Arc;

    pub async fn handle(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, op: &str, payload: &Value) -> Result<Value> {
        let Some(rules) = &ctx.rules else { return Err(Error::RulesNotAvailable) };
        match op {
            "subscribe" => {
                let pattern = require_field(payload, "pattern")?.to_string();
                let limit = ctx.config.subscriptions.max_rule_subscriptions_per_connection;
                if conn.rules_subscriptions.read().unwrap().len() >= limit {
                    return Err(Error::Validation("rules subscription limit reached".to_string()));
                }
                let id = ctx.subscriptions.add_rules_subscription(conn.id, pattern);
                conn.rules_subscriptions.write().unwrap().insert(id);
                Ok(json!({ "subscriptionId": id }))
            }
            "unsubscribe" => {
                let id_str = require_field(payload, "subscriptionId")?;
                let id: SubscriptionId = id_str.parse().map_err(|_| Error::InvalidRequest("invalid subscriptionId".to_string()))?;
                if !ctx.subscriptions.remove(conn.id, id) {
                    return Err(Error::NotFound(id_str.to_string()));
                }
                conn.rules_subscriptions.write().unwrap().remove(&id);
                Ok(Value::Null)
            }
            "emit" => {
                let topic = require_field(payload, "topic")?;
                let data = payload.get("data").cloned().unwrap_or(Value::Null);
                let correlation_id = payload.get("correlationId").and_then(Value::as_str).map(str::to_string);
                rules.emit(topic, data, correlation_id).await?;
                Ok(Value::Null)
            }
            "setFact" => {
                let key = require_field(payload, "key")?;
                rules.set_fact(key, payload.get("value").cloned().unwrap_or(Value::Null)).await?;
                Ok(Value::Null)
            }
            "getFact" => Ok(rules.get_fact(require_field(payload, "key")?).await?.unwrap_or(Value::Null)),
            "deleteFact" => {
                rules.delete_fact(require_field(payload, "key")?).await?;
                Ok(Value::Null)
            }
            "queryFacts" => {
                let pattern = require_field(payload, "pattern")?;
                let facts = rules.query_facts(pattern).await?;
                Ok(json!(facts.into_iter().map(|(k, v)| json!({"key": k, "value": v})).collect::<Vec<_>>()))
            }
            "getAllFacts" => {
                let facts = rules.get_all_facts().await?;
                Ok(json!(facts.into_iter().map(|(k, v)| json!({"key": k, "value": v})).collect::<Vec<_>>()))
            }
            "stats" => rules.stats().await,
            other => Err(Error::UnknownOperation(format!("rules.{other}"))),
        }
    }
}

mod identity_ops {
    use super::{require_field, Error, Result, Value};
    use crate::audit::AuditEventKind;
    use crate::dispatcher::DispatcherContext;
    use crate::identity::{AuthMode, Session};
    use crate::registry::ConnectionRecord;
    use serde_json::json;
    use std::sync::Arc;

    fn builtin(ctx: &DispatcherContext) -> Result<&crate::identity::BuiltinIdentity> {
        match ctx.auth_mode.as_ref() {
            AuthMode::BuiltIn(identity) => Ok(identity),
            _ => Err(Error::Forbidden("built-in identity is not configured".to_string())),
        }
    }

    pub async fn handle(
        ctx: &DispatcherContext,
        conn: &Arc<ConnectionRecord>,
        session: Option<&Session>,
        op: &str,
        payload: &Value,
    ) -> Result<Value> {
        match op {
            "login" => login(ctx, conn, payload).await,
            "loginWithSecret" => login_with_secret(ctx, conn, payload).await,
            "logout" => logout(ctx, conn, session).await,
            "whoami" => Ok(whoami(session)),
            "myAccess" => my_access(ctx, session).await,
            "refreshSession" => refresh_session(ctx, conn, payload).await,
            "getOwner" => {
                let identity = builtin(ctx)?;
                Ok(identity
                    .get_owner(require_field(payload, "resourceType")?, require_field(payload, "resourceName")?)
                    .await?
                    .unwrap_or(Value::Null))
            }
            _ => handle_admin(ctx, op, payload).await,
        }
    }

    /// Session-replacing login against built-in identity, mirroring
    /// `auth_ops::login`'s `AuthMode::BuiltIn` branch under the `identity.`
    /// namespace the built-in identity section names explicitly (§4.5.B).
    async fn login(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, payload: &Value) -> Result<Value> {
        let identity = builtin(ctx)?;
        let username = require_field(payload, "username")?;
        let password = require_field(payload, "password")?;
        let remote_ip = conn.remote_addr.to_string();

        let result = identity.login(username, password, &remote_ip).await;
        let kind = if result.is_ok() { AuditEventKind::AuthLoginSuccess } else { AuditEventKind::AuthLoginFailed };
        ctx.audit.log_auth(kind, result.is_ok(), Some(username.to_string()), Some(remote_ip));

        let session = result?;
        if ctx.blacklist.contains(&session.user_id) {
            return Err(Error::SessionRevoked);
        }
        conn.set_identity(Some(session.user_id.clone()), session.roles.clone());
        conn.set_session(session.token.clone(), session.expires_at);
        conn.auth_epoch.store(identity.epoch.current(), std::sync::atomic::Ordering::Release);
        Ok(json!({ "userId": session.user_id, "roles": session.roles, "token": session.token, "expiresAt": session.expires_at }))
    }

    async fn login_with_secret(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, payload: &Value) -> Result<Value> {
        let identity = builtin(ctx)?;
        let secret = require_field(payload, "secret")?;
        let session = identity.login_with_secret(secret).await?;
        conn.set_identity(Some(session.user_id.clone()), session.roles.clone());
        conn.set_session(None, session.expires_at);
        conn.auth_epoch.store(identity.epoch.current(), std::sync::atomic::Ordering::Release);
        Ok(json!({ "userId": session.user_id, "roles": session.roles, "expiresAt": session.expires_at }))
    }

    async fn logout(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, session: Option<&Session>) -> Result<Value> {
        let identity = builtin(ctx)?;
        if let Some(token) = conn.session_token() {
            identity.logout(&token).await?;
        }
        conn.set_identity(None, Vec::new());
        conn.set_session(None, None);
        ctx.audit.log_auth(AuditEventKind::AuthLogout, true, session.map(|s| s.user_id.clone()), None);
        Ok(Value::Null)
    }

    fn whoami(session: Option<&Session>) -> Value {
        match session {
            Some(session) => json!({ "userId": session.user_id, "roles": session.roles }),
            None => Value::Null,
        }
    }

    async fn my_access(ctx: &DispatcherContext, session: Option<&Session>) -> Result<Value> {
        let Some(session) = session else { return Ok(Value::Null) };
        let identity = builtin(ctx)?;
        identity.my_access(&session.user_id, &session.roles).await
    }

    /// Rotate the connection's session token, invalidating the one it replaces.
    async fn refresh_session(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, _payload: &Value) -> Result<Value> {
        let identity = builtin(ctx)?;
        let old_token = conn.session_token().ok_or_else(|| Error::Unauthorized("Authentication required".to_string()))?;
        let session = identity.refresh_session(&old_token).await?;
        conn.set_identity(Some(session.user_id.clone()), session.roles.clone());
        conn.set_session(session.token.clone(), session.expires_at);
        Ok(json!({ "userId": session.user_id, "roles": session.roles, "token": session.token, "expiresAt": session.expires_at }))
    }

    async fn handle_admin(ctx: &DispatcherContext, op: &str, payload: &Value) -> Result<Value> {
        let identity = builtin(ctx)?;
        match op {
            "createUser" => {
                let username = require_field(payload, "username")?;
                let password = require_field(payload, "password")?;
                let display_name = payload.get("displayName").and_then(Value::as_str).map(str::to_string);
                let email = payload.get("email").and_then(Value::as_str).map(str::to_string);
                identity.create_user(username, password, display_name, email).await
            }
            "getUser" => identity.get_user(require_field(payload, "userId")?).await,
            "updateUser" => identity.update_user(require_field(payload, "userId")?, payload.get("patch").cloned().unwrap_or(json!({}))).await,
            "deleteUser" => {
                identity.delete_user(require_field(payload, "userId")?).await?;
                Ok(Value::Null)
            }
            "listUsers" => {
                let page = payload.get("page").and_then(Value::as_u64).unwrap_or(1) as usize;
                let page_size = payload.get("pageSize").and_then(Value::as_u64).unwrap_or(20) as usize;
                identity.list_users(page, page_size).await
            }
            "setUserEnabled" => {
                let enabled = payload.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                identity.set_user_enabled(require_field(payload, "userId")?, enabled).await
            }
            "changePassword" => {
                identity
                    .change_password(require_field(payload, "userId")?, require_field(payload, "currentPassword")?, require_field(payload, "newPassword")?)
                    .await?;
                Ok(Value::Null)
            }
            "resetPassword" => {
                identity.reset_password(require_field(payload, "userId")?, require_field(payload, "newPassword")?).await?;
                Ok(Value::Null)
            }
            "createRole" => {
                let name = require_field(payload, "name")?;
                let permissions = payload.get("permissions").cloned().unwrap_or(json!([]));
                let description = payload.get("description").and_then(Value::as_str).map(str::to_string);
                identity.create_role(name, permissions, description).await
            }
            "updateRole" => identity.update_role(require_field(payload, "roleId")?, payload.get("patch").cloned().unwrap_or(json!({}))).await,
            "deleteRole" => {
                identity.delete_role(require_field(payload, "roleId")?).await?;
                Ok(Value::Null)
            }
            "listRoles" => Ok(json!(identity.list_roles().await?)),
            "assignRole" => {
                identity.assign_role(require_field(payload, "userId")?, require_field(payload, "roleId")?).await?;
                Ok(Value::Null)
            }
            "removeRole" => {
                identity.remove_role(require_field(payload, "userId")?, require_field(payload, "roleId")?).await?;
                Ok(Value::Null)
            }
            "getUserRoles" => Ok(json!(identity.get_user_roles(require_field(payload, "userId")?).await?)),
            "grant" => {
                let operations: Vec<String> = payload
                    .get("operations")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                identity
                    .grant(
                        require_field(payload, "subjectType")?,
                        require_field(payload, "subjectId")?,
                        require_field(payload, "resourceType")?,
                        require_field(payload, "resourceName")?,
                        &operations,
                    )
                    .await
            }
            "revoke" => {
                identity
                    .revoke(
                        require_field(payload, "subjectType")?,
                        require_field(payload, "subjectId")?,
                        require_field(payload, "resourceType")?,
                        require_field(payload, "resourceName")?,
                    )
                    .await?;
                Ok(Value::Null)
            }
            "getAcl" => Ok(json!(identity.get_acl(require_field(payload, "resourceType")?, require_field(payload, "resourceName")?).await?)),
            "transferOwner" => {
                identity
                    .transfer_owner(require_field(payload, "resourceType")?, require_field(payload, "resourceName")?, require_field(payload, "userId")?)
                    .await
            }
            other => Err(Error::UnknownOperation(format!("identity.{other}"))),
        }
    }
}

mod auth_ops {
    use super::{require_field, Error, Result, Value};
    use crate::audit::AuditEventKind;
    use crate::dispatcher::DispatcherContext;
    use crate::identity::AuthMode;
    use crate::registry::ConnectionRecord;
    use serde_json::json;
    use std::sync::Arc;

    pub async fn handle(
        ctx: &DispatcherContext,
        conn: &Arc<ConnectionRecord>,
        session: Option<&crate::identity::Session>,
        op: &str,
        payload: &Value,
    ) -> Result<Value> {
        match op {
            "login" => login(ctx, conn, payload).await,
            "loginWithSecret" => login_with_secret(ctx, conn, payload).await,
            "logout" => {
                if let AuthMode::BuiltIn(identity) = ctx.auth_mode.as_ref() {
                    if let Some(token) = conn.session_token() {
                        identity.logout(&token).await?;
                    }
                }
                conn.set_identity(None, Vec::new());
                conn.set_session(None, None);
                ctx.audit.log_auth(AuditEventKind::AuthLogout, true, session.map(|s| s.user_id.clone()), None);
                Ok(Value::Null)
            }
            "whoami" => Ok(match session {
                Some(session) => json!({ "userId": session.user_id, "roles": session.roles }),
                None => Value::Null,
            }),
            other => Err(Error::UnknownOperation(format!("auth.{other}"))),
        }
    }

    async fn login(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, payload: &Value) -> Result<Value> {
        match ctx.auth_mode.as_ref() {
            AuthMode::BuiltIn(identity) => {
                let username = require_field(payload, "username")?;
                let password = require_field(payload, "password")?;
                let remote_ip = conn.remote_addr.to_string();

                let result = identity.login(username, password, &remote_ip).await;
                let kind = if result.is_ok() { AuditEventKind::AuthLoginSuccess } else { AuditEventKind::AuthLoginFailed };
                ctx.audit.log_auth(kind, result.is_ok(), Some(username.to_string()), Some(remote_ip));

                let session = result?;
                if ctx.blacklist.contains(&session.user_id) {
                    return Err(Error::SessionRevoked);
                }
                conn.set_identity(Some(session.user_id.clone()), session.roles.clone());
                conn.set_session(session.token.clone(), session.expires_at);
                conn.auth_epoch.store(identity.epoch.current(), std::sync::atomic::Ordering::Release);
                Ok(json!({ "userId": session.user_id, "roles": session.roles, "token": session.token, "expiresAt": session.expires_at }))
            }
            AuthMode::External { validator, .. } => {
                let token = require_field(payload, "token")?;
                let remote_ip = conn.remote_addr.to_string();

                let result = login_external(ctx, validator.as_ref(), token).await;
                let kind = if result.is_ok() { AuditEventKind::AuthLoginSuccess } else { AuditEventKind::AuthLoginFailed };
                let user_id = result.as_ref().ok().map(|s: &crate::identity::Session| s.user_id.clone());
                ctx.audit.log_auth(kind, result.is_ok(), user_id, Some(remote_ip));

                let session = result?;
                conn.set_identity(Some(session.user_id.clone()), session.roles.clone());
                conn.set_session(session.token.clone(), session.expires_at);
                Ok(json!({ "userId": session.user_id, "roles": session.roles, "expiresAt": session.expires_at }))
            }
            AuthMode::None => Err(Error::Forbidden("login is not configured".to_string())),
        }
    }

    /// Validate `token` against the blacklist first, then the external
    /// validator, rejecting an already-expired returned session (§4.5.A).
    async fn login_external(ctx: &DispatcherContext, validator: &dyn crate::identity::Validator, token: &str) -> Result<crate::identity::Session> {
        let session = validator.validate(token).await?.ok_or_else(|| Error::Unauthorized("Invalid credentials".to_string()))?;
        if ctx.blacklist.contains(&session.user_id) {
            return Err(Error::SessionRevoked);
        }
        if session.is_expired(super::now_ms()) {
            return Err(Error::Unauthorized("Token has expired".to_string()));
        }
        Ok(session)
    }

    async fn login_with_secret(ctx: &DispatcherContext, conn: &Arc<ConnectionRecord>, payload: &Value) -> Result<Value> {
        let AuthMode::BuiltIn(identity) = ctx.auth_mode.as_ref() else {
            return Err(Error::Forbidden("built-in login is not configured".to_string()));
        };
        let secret = require_field(payload, "secret")?;
        let session = identity.login_with_secret(secret).await?;
        conn.set_identity(Some(session.user_id.clone()), session.roles.clone());
        conn.set_session(None, session.expires_at);
        conn.auth_epoch.store(identity.epoch.current(), std::sync::atomic::Ordering::Release);
        Ok(json!({ "userId": session.user_id, "roles": session.roles, "expiresAt": session.expires_at }))
    }
}

mod procedures_ops {
    use super::{require_field, Error, Result, Value};
    use crate::dispatcher::DispatcherContext;
    use crate::procedures::Procedure;
    use serde_json::json;

    pub async fn handle(ctx: &DispatcherContext, op: &str, payload: &Value) -> Result<Value> {
        match op {
            "register" => {
                let procedure: Procedure = serde_json::from_value(payload.clone()).map_err(|e| Error::Validation(e.to_string()))?;
                ctx.procedures.register(procedure)?;
                Ok(Value::Null)
            }
            "unregister" => {
                ctx.procedures.unregister(require_field(payload, "name")?)?;
                Ok(Value::Null)
            }
            "update" => {
                let name = require_field(payload, "name")?;
                let patch = payload.get("patch").cloned().unwrap_or(json!({}));
                let updated = ctx.procedures.update(name, patch)?;
                Ok(serde_json::to_value(updated.as_ref()).unwrap_or(Value::Null))
            }
            "get" => {
                let name = require_field(payload, "name")?;
                let procedure = ctx.procedures.get(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
                Ok(serde_json::to_value(procedure.as_ref()).unwrap_or(Value::Null))
            }
            "list" => Ok(json!(ctx.procedures.list())),
            "call" => {
                let name = require_field(payload, "name")?;
                let procedure = ctx.procedures.get(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
                let input = payload.get("input").cloned().unwrap_or(json!({}));
                crate::procedures::call(ctx.store.as_ref(), ctx.rules.as_deref(), &procedure, input).await
            }
            other => Err(Error::UnknownOperation(format!("procedures.{other}"))),
        }
    }
}

mod server_ops {
    use super::{Error, Result};
    use crate::dispatcher::DispatcherContext;
    use serde_json::json;

    pub async fn handle(ctx: &DispatcherContext, op: &str) -> Result<serde_json::Value> {
        match op {
            "stats" => Ok(json!({
                "connections": ctx.registry.len(),
                "authenticatedConnections": ctx.registry.authenticated_count(),
                "storeSubscriptions": ctx.registry.total_store_subscriptions(),
                "rulesSubscriptions": ctx.registry.total_rules_subscriptions(),
            })),
            "connections" => {
                let snapshot = ctx.registry.snapshot();
                Ok(json!(snapshot
                    .iter()
                    .map(|c| json!({
                        "connectionId": c.id,
                        "remoteAddr": c.remote_addr.to_string(),
                        "userId": c.user_id(),
                        "connectedAtMs": c.connected_at_ms,
                    }))
                    .collect::<Vec<_>>()))
            }
            other => Err(Error::UnknownOperation(format!("server.{other}"))),
        }
    }
}

mod audit_ops {
    use super::{Error, Result, Value};
    use crate::dispatcher::DispatcherContext;
    use crate::identity::Session;
    use serde_json::json;

    pub async fn handle(ctx: &DispatcherContext, session: Option<&Session>, op: &str, payload: &Value) -> Result<Value> {
        match op {
            "query" => {
                let user_id = payload.get("userId").and_then(Value::as_str);
                let limit = payload.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;
                let _ = session;
                Ok(json!(ctx.audit.query(user_id, limit)))
            }
            other => Err(Error::UnknownOperation(format!("audit.{other}"))),
        }
    }
}
