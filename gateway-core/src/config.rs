//! Configuration, loaded via layered `figment` providers
//!
//! Precedence (highest to lowest), mirroring acton-service's `config.rs`:
//! 1. Environment variables (prefix `GATEWAY_`, `__`-separated for nesting)
//! 2. `./config.toml` in the current working directory
//! 3. Built-in defaults

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionLimitsConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Connection-level and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Allowed `Origin` header values for the WS upgrade. Empty means "allow any".
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Whether `details` is attached to wire error envelopes. Defaults on.
    #[serde(default = "default_true")]
    pub expose_error_details: bool,
    #[serde(default = "default_shutdown_grace_ms")]
    pub default_shutdown_grace_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_message_bytes: default_max_message_bytes(),
            allowed_origins: Vec::new(),
            expose_error_details: true,
            default_shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Authentication mode selection and built-in auth tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// `"external"`, `"built-in"`, or `"none"`.
    #[serde(default = "default_auth_mode")]
    pub mode: String,
    #[serde(default)]
    pub password: PasswordConfig,
    #[serde(default)]
    pub login_rate_limit: LoginRateLimitConfig,
    /// Session token lifetime. `None` means tokens never expire.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: Option<u64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            password: PasswordConfig::default(),
            login_rate_limit: LoginRateLimitConfig::default(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

/// Argon2id tuning, adapted from acton-service's OWASP-aligned defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordConfig {
    #[serde(default = "default_memory_cost")]
    pub memory_cost_kib: u32,
    #[serde(default = "default_time_cost")]
    pub time_cost: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost_kib: default_memory_cost(),
            time_cost: default_time_cost(),
            parallelism: default_parallelism(),
            min_password_length: default_min_password_length(),
        }
    }
}

/// Per-`(username, ip)` login attempt limiting, grounded on
/// `acton-service::lockout::config::LockoutConfig` minus the Redis-specific
/// `key_prefix` field this crate doesn't need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for LoginRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
        }
    }
}

/// Per-operation rate limiting applied by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_ms: default_rate_window_ms(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Heartbeat sweep tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

/// Per-connection subscription caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionLimitsConfig {
    #[serde(default = "default_max_store_subs")]
    pub max_store_subscriptions_per_connection: usize,
    #[serde(default = "default_max_rule_subs")]
    pub max_rule_subscriptions_per_connection: usize,
}

impl Default for SubscriptionLimitsConfig {
    fn default() -> Self {
        Self {
            max_store_subscriptions_per_connection: default_max_store_subs(),
            max_rule_subscriptions_per_connection: default_max_rule_subs(),
        }
    }
}

/// Revoked-session/user blacklist tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default = "default_blacklist_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// How long a revoked user is rejected before the entry expires.
    #[serde(default = "default_blacklist_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_blacklist_sweep_secs(),
            ttl_secs: default_blacklist_ttl_secs(),
        }
    }
}

/// Audit trail tuning, trimmed from `acton-service::audit::config::AuditConfig`
/// down to what a WS-only gateway with no HTTP routes can use: no
/// `audited_routes`/`excluded_routes` glob lists, no syslog/OTLP export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub audit_auth_events: bool,
    #[serde(default = "default_false")]
    pub audit_all_operations: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audit_auth_events: true,
            audit_all_operations: false,
        }
    }
}

// --- defaults -------------------------------------------------------------

fn default_port() -> u16 {
    7890
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_connections() -> usize {
    10_000
}
fn default_max_connections_per_ip() -> usize {
    50
}
fn default_max_message_bytes() -> usize {
    65536
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_auth_mode() -> String {
    "none".to_string()
}
fn default_session_ttl_secs() -> Option<u64> {
    Some(86_400)
}
fn default_memory_cost() -> u32 {
    65536
}
fn default_time_cost() -> u32 {
    3
}
fn default_parallelism() -> u32 {
    4
}
fn default_min_password_length() -> usize {
    8
}
fn default_max_attempts() -> u32 {
    5
}
fn default_window_secs() -> u64 {
    900
}
fn default_max_requests() -> u32 {
    120
}
fn default_rate_window_ms() -> u64 {
    60_000
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_pong_timeout_secs() -> u64 {
    10
}
fn default_max_store_subs() -> usize {
    100
}
fn default_max_rule_subs() -> usize {
    100
}
fn default_blacklist_sweep_secs() -> u64 {
    60
}
fn default_blacklist_ttl_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            subscriptions: SubscriptionLimitsConfig::default(),
            blacklist: BlacklistConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `./config.toml` overlaid with `GATEWAY_`-prefixed
    /// environment variables, both layered on top of [`GatewayConfig::default`].
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load configuration from a specific file, for tests and non-standard
    /// deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = GatewayConfig::default();
        assert_eq!(config.service.port, 7890);
        assert_eq!(config.auth.mode, "none");
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn load_from_missing_file_falls_back_to_defaults() {
        let config = GatewayConfig::load_from("does-not-exist.toml").unwrap();
        assert_eq!(config.service.port, 7890);
    }
}
