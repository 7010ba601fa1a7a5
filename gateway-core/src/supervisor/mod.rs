//! Connection supervisor (§4.11/§4.12): accept loop, per-connection read
//! loop, and admin-initiated revocation.
//!
//! Grounded on `acton-service::websocket::handler`'s `WebSocketConnection`
//! (one struct per live socket, a channel standing in for direct writes) and
//! `server.rs`'s `axum::serve(..).with_graceful_shutdown(..)` lifecycle,
//! generalized from that module's room broadcast to this gateway's
//! dispatch-per-request model.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{self, DispatcherContext};
use crate::error::ErrorCode;
use crate::heartbeat;
use crate::identity::Blacklist;
use crate::protocol::{codec, ClientFrame, ServerFrame, SystemEvent};
use crate::registry::{ConnectionRecord, ConnectionSignal};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

const PROTOCOL_VERSION: u32 = 1;

/// Everything the accept loop and per-connection tasks share.
pub struct GatewayState {
    pub ctx: Arc<DispatcherContext>,
    pub blacklist: Arc<Blacklist>,
    pub shutdown: CancellationToken,
    /// Flipped false the moment shutdown begins, before the drain grace
    /// period starts — new upgrades are refused while already-open
    /// connections still get their grace window (§4.11 "stop-accepting"
    /// happens first, independent of the drain timer).
    pub accepting: AtomicBool,
}

/// Build the single-route axum app this gateway serves.
#[must_use]
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/", get(ws_upgrade_handler)).with_state(state)
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !state.accepting.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let allowed = &state.ctx.config.service.allowed_origins;
    if !allowed.is_empty() {
        let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()).unwrap_or("");
        if !allowed.iter().any(|o| o == origin) {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr.ip()))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<GatewayState>, ip: IpAddr) {
    let config = &state.ctx.config.service;

    if state.ctx.registry.len() >= config.max_connections {
        close_before_registering(socket, 4003, "too_many_connections").await;
        return;
    }
    if state.ctx.registry.count_for_ip(ip) >= config.max_connections_per_ip {
        close_before_registering(socket, 4003, "too_many_connections").await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Arc::new(ConnectionRecord::new(ip, tx));
    state.ctx.registry.add(conn.clone());

    let welcome = codec::encode_welcome(PROTOCOL_VERSION, now_ms(), state.ctx.auth_mode.requires_auth());
    if socket.send(Message::Text(welcome.into())).await.is_err() {
        cleanup(&state, &conn);
        return;
    }

    let (mut write, mut read) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            let outcome = match signal {
                ConnectionSignal::Frame(frame) => write.send(Message::Text(frame.to_text().into())).await,
                ConnectionSignal::Close { code, reason } => {
                    let frame = axum::extract::ws::CloseFrame { code, reason: reason.into() };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if outcome.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                conn.close(1001, "server shutting down");
                break;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_text(&state, &conn, &text),
                    Some(Ok(Message::Binary(_))) => {
                        conn.close(1003, "binary_not_supported");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    drop(read);
    let _ = writer.await;
    cleanup(&state, &conn);
}

fn handle_text(state: &Arc<GatewayState>, conn: &Arc<ConnectionRecord>, text: &str) {
    match codec::decode(text) {
        Ok(ClientFrame::Request(request)) => {
            if let Some(user_id) = conn.user_id() {
                if state.blacklist.contains(&user_id) {
                    conn.push(ServerFrame::Error {
                        id: request.id,
                        code: ErrorCode::SessionRevoked,
                        message: "session revoked".to_string(),
                        details: None,
                    });
                    return;
                }
            }
            let state = state.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let frame = dispatcher::dispatch(&state.ctx, &conn, request).await;
                conn.push(frame);
            });
        }
        Ok(ClientFrame::Pong { timestamp }) => heartbeat::record_pong(conn, timestamp),
        Err(decode_error) => {
            conn.push(ServerFrame::Error {
                id: decode_error.id,
                code: decode_error.error.code(),
                message: decode_error.error.client_message(),
                details: None,
            });
        }
    }
}

fn cleanup(state: &Arc<GatewayState>, conn: &Arc<ConnectionRecord>) {
    state.ctx.subscriptions.remove_all_for_connection(conn.id);
    state.ctx.registry.remove(conn.id);
}

async fn close_before_registering(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = axum::extract::ws::CloseFrame { code, reason: reason.to_string().into() };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Revoke every connection authenticated as `user_id`: push a
/// `session_revoked` system message, close with code 4002, and blacklist the
/// user so a stale client reconnecting with the same token is rejected
/// (§4.11 admin revocation). Returns the number of connections closed;
/// unauthenticated connections are never matched.
pub fn revoke_session(state: &GatewayState, user_id: &str, reason: &str, blacklist_ttl_ms: i64) -> usize {
    let matching = state.ctx.registry.filter(|c| c.user_id().as_deref() == Some(user_id));
    if matching.is_empty() {
        return 0;
    }
    state.blacklist.insert(user_id.to_string(), blacklist_ttl_ms);
    for conn in &matching {
        conn.push(ServerFrame::System {
            event: SystemEvent::SessionRevoked { reason: reason.to_string() },
        });
        conn.close(4002, reason.to_string());
    }
    matching.len()
}

/// Revoke every connection matching `user_id` and/or `role`, whichever of
/// the two is given (both narrow the match when both are set). Returns the
/// number of connections closed.
pub fn revoke_sessions(state: &GatewayState, user_id: Option<&str>, role: Option<&str>, reason: &str, blacklist_ttl_ms: i64) -> usize {
    let matching = state.ctx.registry.filter(|c| {
        let user_matches = user_id.map_or(true, |want| c.user_id().as_deref() == Some(want));
        let role_matches = role.map_or(true, |want| c.roles.read().unwrap().iter().any(|r| r == want));
        c.is_authenticated() && user_matches && role_matches
    });

    let mut blacklisted = std::collections::HashSet::new();
    for conn in &matching {
        if let Some(user_id) = conn.user_id() {
            if blacklisted.insert(user_id.clone()) {
                state.blacklist.insert(user_id, blacklist_ttl_ms);
            }
        }
        conn.push(ServerFrame::System {
            event: SystemEvent::SessionRevoked { reason: reason.to_string() },
        });
        conn.close(4002, reason.to_string());
    }
    matching.len()
}

/// Refuse further upgrades immediately (§4.11 graceful shutdown, step 1).
pub fn stop_accepting(state: &GatewayState) {
    state.accepting.store(false, Ordering::Release);
}

/// Broadcast a shutdown notice to every connection, giving them
/// `grace_period_ms` to drain before the caller force-closes stragglers
/// (§4.11 graceful shutdown, step 2).
pub fn announce_shutdown(state: &GatewayState, grace_period_ms: u64) {
    for conn in state.ctx.registry.snapshot() {
        conn.push(ServerFrame::System {
            event: SystemEvent::Shutdown { grace_period_ms },
        });
    }
}
