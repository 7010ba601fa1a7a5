//! Gateway server façade with graceful shutdown.
//!
//! Grounded on `acton-service::server::Server`'s `serve`/`shutdown_signal`
//! split, trimmed to this gateway's single WebSocket route: no CORS,
//! compression, or tower middleware stack, since those are HTTP-surface
//! concerns this protocol doesn't have.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::config::GatewayConfig;
use crate::dispatcher::DispatcherContext;
use crate::error::{Error, Result};
use crate::heartbeat;
use crate::identity::{AuthMode, Blacklist};
use crate::procedures::ProcedureRegistry;
use crate::ratelimit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::rules::RuleEngine;
use crate::store::Store;
use crate::subscriptions::{self, SubscriptionRegistry};
use crate::supervisor::{self, GatewayState};

/// Collaborators a caller assembles before starting the gateway; everything
/// else (registries, rate limiter, audit log) is built fresh per server.
pub struct GatewayServerBuilder {
    pub config: GatewayConfig,
    pub store: Arc<dyn Store>,
    pub rules: Option<Arc<dyn RuleEngine>>,
    pub auth_mode: Arc<AuthMode>,
}

impl GatewayServerBuilder {
    #[must_use]
    pub fn build(self) -> GatewayServer {
        let config = Arc::new(self.config);
        let blacklist = Arc::new(Blacklist::new());
        let ctx = Arc::new(DispatcherContext {
            store: self.store,
            rules: self.rules,
            auth_mode: self.auth_mode,
            procedures: Arc::new(ProcedureRegistry::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            audit: Arc::new(AuditLogger::new(config.audit.clone())),
            blacklist: blacklist.clone(),
            config,
        });

        GatewayServer {
            state: Arc::new(GatewayState {
                ctx,
                blacklist,
                shutdown: CancellationToken::new(),
                accepting: AtomicBool::new(true),
            }),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            bound_port: Mutex::new(None),
        }
    }
}

/// A running (or stopped) gateway: owns the listener task and exposes the
/// operational surface an embedding process needs (§4.12).
pub struct GatewayServer {
    state: Arc<GatewayState>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
    bound_port: Mutex<Option<u16>>,
}

impl GatewayServer {
    /// Bind and begin accepting connections, returning once the listener is
    /// live. Shutdown happens in the background on SIGINT/SIGTERM or a call
    /// to [`GatewayServer::stop`].
    pub async fn start(&self) -> Result<()> {
        let port = self.state.ctx.config.service.port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_port = listener.local_addr()?.port();

        tracing::info!("gateway listening on {}", listener.local_addr()?);

        let state = self.state.clone();
        let running = self.running.clone();
        let shutdown = self.state.shutdown.clone();
        let app = supervisor::router(state.clone());

        tokio::spawn(heartbeat::run(
            state.ctx.registry.clone(),
            state.ctx.config.heartbeat.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(blacklist_sweep(state.clone()));
        tokio::spawn(subscriptions::store_sub::run(
            state.ctx.store.clone(),
            state.ctx.subscriptions.clone(),
            state.ctx.registry.clone(),
            state.ctx.store.subscribe_changes(),
        ));
        if let Some(rules) = state.ctx.rules.clone() {
            tokio::spawn(subscriptions::rules_sub::run(
                state.ctx.subscriptions.clone(),
                state.ctx.registry.clone(),
                rules.subscribe_events(),
            ));
        }

        let server = tokio::spawn(async move {
            running.store(true, Ordering::Release);
            let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(shutdown_signal(shutdown))
                .await
                .map_err(|e| Error::Internal(e.to_string()));
            running.store(false, Ordering::Release);
            result
        });

        *self.handle.lock().unwrap() = Some(server);
        *self.bound_port.lock().unwrap() = Some(bound_port);
        Ok(())
    }

    /// Stop accepting new connections, announce a shutdown, give existing
    /// connections `grace_period_ms` to drain, then force-close and cancel
    /// the listener (§4.11 graceful shutdown).
    pub async fn stop(&self) -> Result<()> {
        supervisor::stop_accepting(&self.state);
        let grace_period_ms = self.state.ctx.config.service.default_shutdown_grace_ms;
        supervisor::announce_shutdown(&self.state, grace_period_ms);

        let drained = tokio::time::timeout(std::time::Duration::from_millis(grace_period_ms), async {
            let mut poll = tokio::time::interval(std::time::Duration::from_millis(50));
            while !self.state.ctx.registry.is_empty() {
                poll.tick().await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::info!("shutdown grace period elapsed with connections still open, force-closing");
        }
        self.state.shutdown.cancel();

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| Error::Internal(e.to_string()))??;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        *self.bound_port.lock().unwrap()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.ctx.registry.len()
    }

    /// Snapshot of live connections for admin tooling (§4.12 `server.connections`).
    #[must_use]
    pub fn get_connections(&self) -> Value {
        let connections: Vec<Value> = self
            .state
            .ctx
            .registry
            .snapshot()
            .iter()
            .map(|c| {
                json!({
                    "connectionId": c.id.to_string(),
                    "remoteAddr": c.remote_addr.to_string(),
                    "userId": c.user_id(),
                    "connectedAtMs": c.connected_at_ms,
                })
            })
            .collect();
        json!({ "connections": connections })
    }

    #[must_use]
    pub fn get_stats(&self) -> Value {
        json!({
            "connectionCount": self.state.ctx.registry.len(),
            "authenticatedCount": self.state.ctx.registry.authenticated_count(),
            "storeSubscriptionCount": self.state.ctx.registry.total_store_subscriptions(),
            "rulesSubscriptionCount": self.state.ctx.registry.total_rules_subscriptions(),
        })
    }

    /// Force-close every connection authenticated as `user_id`, returning
    /// the number of connections closed (§4.11/§4.12 admin revocation).
    pub fn revoke_session(&self, user_id: &str, reason: &str) -> usize {
        let ttl_ms = self.state.ctx.config.blacklist.ttl_secs as i64 * 1000;
        supervisor::revoke_session(&self.state, user_id, reason, ttl_ms)
    }

    /// Force-close every connection matching `user_id` and/or `role`
    /// (whichever is given), returning the number of connections closed.
    pub fn revoke_sessions(&self, user_id: Option<&str>, role: Option<&str>, reason: &str) -> usize {
        let ttl_ms = self.state.ctx.config.blacklist.ttl_secs as i64 * 1000;
        supervisor::revoke_sessions(&self.state, user_id, role, reason, ttl_ms)
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.state.ctx.config
    }
}

/// Periodically drop expired blacklist entries so the map doesn't grow
/// unbounded across a long-lived server (§3.1 `BlacklistEntry` TTL).
async fn blacklist_sweep(state: Arc<GatewayState>) {
    let interval = std::time::Duration::from_secs(state.ctx.config.blacklist.sweep_interval_secs);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = ticker.tick() => state.blacklist.sweep(),
        }
    }
}

/// Wait for SIGINT/SIGTERM or an explicit cancellation, whichever comes first.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
        _ = cancel.cancelled() => tracing::info!("shutdown requested, starting graceful shutdown"),
    }
}
