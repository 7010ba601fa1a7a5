//! End-to-end scenarios driven over a real TCP socket with a real
//! WebSocket client, exercising the full accept → dispatch → push pipeline
//! rather than any single module in isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use gateway_core::prelude::*;

async fn start_server(store: Arc<dyn Store>, rules: Option<Arc<dyn RuleEngine>>, auth_mode: AuthMode) -> GatewayServer {
    let mut config = GatewayConfig::default();
    config.service.port = 0;
    let server = GatewayServerBuilder { config, store, rules, auth_mode: Arc::new(auth_mode) }.build();
    server.start().await.unwrap();
    server
}

async fn connect(server: &GatewayServer) -> (
    futures::stream::SplitSink<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, Message>,
    futures::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>,
) {
    let port = server.port().unwrap();
    let url = format!("ws://127.0.0.1:{port}/");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.split()
}

async fn send(write: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin), payload: Value) {
    write.send(Message::Text(payload.to_string().into())).await.unwrap();
}

async fn recv_json(read: &mut (impl futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin)) -> Value {
    let next = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .unwrap();
    match next {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Maps a fixed set of opaque tokens to sessions, standing in for an
/// embedding application's own identity provider (§4.5.A).
struct FixedValidator {
    sessions: HashMap<String, Session>,
}

#[async_trait]
impl Validator for FixedValidator {
    async fn validate(&self, token: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(token).cloned())
    }
}

#[tokio::test]
async fn welcome_frame_announces_no_auth_required() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let server = start_server(store, None, AuthMode::None).await;
    let (_write, mut read) = connect(&server).await;

    let welcome = recv_json(&mut read).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["version"], 1);
    assert_eq!(welcome["requiresAuth"], false);
    assert!(welcome["serverTime"].as_i64().unwrap() > 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_json_gets_parse_error_with_id_zero() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let server = start_server(store, None, AuthMode::None).await;
    let (mut write, mut read) = connect(&server).await;
    let _welcome = recv_json(&mut read).await;

    write.send(Message::Text("not valid json{{{".into())).await.unwrap();
    let error = recv_json(&mut read).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], 0);
    assert_eq!(error["code"], "PARSE_ERROR");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn live_query_subscription_pushes_on_matching_insert() {
    let store = Arc::new(MemoryStore::new());
    store.define_bucket("items", BucketConfig::default()).await.unwrap();
    store.define_query("all-items", Arc::new(|buckets, _params| json!(buckets.get("items").cloned().unwrap_or_default())));
    let store: Arc<dyn Store> = store;

    let server = start_server(store, None, AuthMode::None).await;
    let (mut write, mut read) = connect(&server).await;
    let _welcome = recv_json(&mut read).await;

    send(&mut write, json!({"id": 1, "type": "store.subscribe", "query": "all-items", "params": {}})).await;
    let subscribed = recv_json(&mut read).await;
    assert_eq!(subscribed["type"], "result");
    let subscription_id = subscribed["data"]["subscriptionId"].as_str().unwrap().to_string();
    assert_eq!(subscribed["data"]["snapshot"], json!([]));

    send(&mut write, json!({"id": 2, "type": "store.insert", "bucket": "items", "data": {"value": 42}})).await;

    // The insert's own result and the subscription's push come from two
    // independent tasks racing to write the same connection's outbound
    // channel — accept either arrival order.
    let first = recv_json(&mut read).await;
    let second = recv_json(&mut read).await;
    let (insert_result, push) = if first["type"] == "result" { (first, second) } else { (second, first) };

    assert_eq!(insert_result["type"], "result");
    assert_eq!(push["type"], "push");
    assert_eq!(push["channel"], "subscription");
    assert_eq!(push["subscriptionId"], subscription_id);
    let pushed_items = push["data"].as_array().unwrap();
    assert_eq!(pushed_items.len(), 1);
    assert_eq!(pushed_items[0]["value"], 42);
    assert_eq!(pushed_items[0]["_version"], 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn revoked_session_closes_the_connection_and_blacklists_reauth() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut sessions = HashMap::new();
    sessions.insert(
        "writer".to_string(),
        Session { user_id: "writer-1".to_string(), roles: vec!["writer".to_string()], expires_at: None, token: None },
    );
    let auth_mode = AuthMode::External { validator: Arc::new(FixedValidator { sessions }), permissions: None };
    let server = start_server(store, None, auth_mode).await;

    let (mut write, mut read) = connect(&server).await;
    let _welcome = recv_json(&mut read).await;
    send(&mut write, json!({"id": 1, "type": "auth.login", "token": "writer"})).await;
    let login_result = recv_json(&mut read).await;
    assert_eq!(login_result["type"], "result");
    assert_eq!(login_result["data"]["userId"], "writer-1");

    let revoked_count = server.revoke_session("writer-1", "session_revoked");
    assert_eq!(revoked_count, 1);

    let revoked = recv_json(&mut read).await;
    assert_eq!(revoked["type"], "system");
    assert_eq!(revoked["event"], "session_revoked");
    assert_eq!(revoked["reason"], "session_revoked");

    let close = tokio::time::timeout(Duration::from_secs(2), read.next()).await.unwrap().unwrap().unwrap();
    match close {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4002),
        Message::Close(None) => panic!("expected a close frame carrying code 4002"),
        other => panic!("expected a close frame, got {other:?}"),
    }

    let (mut write2, mut read2) = connect(&server).await;
    let _welcome2 = recv_json(&mut read2).await;
    send(&mut write2, json!({"id": 1, "type": "auth.login", "token": "writer"})).await;
    let rejected = recv_json(&mut read2).await;
    assert_eq!(rejected["type"], "error");
    assert_eq!(rejected["code"], "SESSION_REVOKED");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn reader_role_is_blocked_from_writes_but_allowed_reads() {
    let store = Arc::new(MemoryStore::new());
    store.define_bucket("items", BucketConfig::default()).await.unwrap();
    let store: Arc<dyn Store> = store;

    let mut sessions = HashMap::new();
    sessions.insert(
        "reader".to_string(),
        Session { user_id: "reader-1".to_string(), roles: vec!["reader".to_string()], expires_at: None, token: None },
    );
    let auth_mode = AuthMode::External { validator: Arc::new(FixedValidator { sessions }), permissions: None };
    let server = start_server(store, None, auth_mode).await;

    let (mut write, mut read) = connect(&server).await;
    let _welcome = recv_json(&mut read).await;
    send(&mut write, json!({"id": 1, "type": "auth.login", "token": "reader"})).await;
    let _login_result = recv_json(&mut read).await;

    send(&mut write, json!({"id": 2, "type": "store.insert", "bucket": "items", "data": {"value": 1}})).await;
    let forbidden = recv_json(&mut read).await;
    assert_eq!(forbidden["type"], "error");
    assert_eq!(forbidden["code"], "FORBIDDEN");
    assert!(forbidden["message"].as_str().unwrap().contains("requires write"));

    send(&mut write, json!({"id": 3, "type": "store.all", "bucket": "items"})).await;
    let ok = recv_json(&mut read).await;
    assert_eq!(ok["type"], "result");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn transaction_rolls_back_entirely_when_a_later_op_fails() {
    let store = Arc::new(MemoryStore::new());
    store.define_bucket("products", BucketConfig::default()).await.unwrap();
    let product = store.insert("products", json!({"stock": 5})).await.unwrap();
    let product_id = product["id"].as_str().unwrap().to_string();
    let store: Arc<dyn Store> = store;

    let server = start_server(store, None, AuthMode::None).await;
    let (mut write, mut read) = connect(&server).await;
    let _welcome = recv_json(&mut read).await;

    send(
        &mut write,
        json!({
            "id": 1,
            "type": "store.transaction",
            "ops": [
                {"action": "update", "bucket": "products", "id": product_id, "data": {"stock": 4}},
                {"action": "insert", "bucket": "users", "data": {"credits": 100}},
            ],
        }),
    )
    .await;
    let tx_result = recv_json(&mut read).await;
    assert_eq!(tx_result["type"], "error");
    assert_eq!(tx_result["code"], "BUCKET_NOT_DEFINED");

    send(&mut write, json!({"id": 2, "type": "store.get", "bucket": "products", "id": product_id})).await;
    let get_result = recv_json(&mut read).await;
    assert_eq!(get_result["data"]["stock"], 5);

    server.stop().await.unwrap();
}

