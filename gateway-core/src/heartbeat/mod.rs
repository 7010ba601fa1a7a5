//! Heartbeat: one timer sweep over the registry instead of one task per
//! connection.
//!
//! Grounded on the "single scheduler/timer wheel, not one task per
//! connection" design note — the same tradeoff acton-service's background
//! worker agents make for periodic work, generalized here to a plain
//! `tokio::time::interval` loop since the gateway has no actor runtime.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::protocol::ServerFrame;
use crate::registry::ConnectionRegistry;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Drives the heartbeat sweep until `cancel` fires. Intended to be spawned
/// as one background task per running server.
pub async fn run(registry: std::sync::Arc<ConnectionRegistry>, config: HeartbeatConfig, cancel: CancellationToken) {
    if !config.enabled {
        return;
    }
    let mut ticker = tokio::time::interval(config.ping_interval());
    let timeout_ms = config.pong_timeout().as_millis() as i64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sweep(&registry, timeout_ms);
            }
        }
    }
}

fn sweep(registry: &ConnectionRegistry, timeout_ms: i64) {
    let now = now_ms();
    for conn in registry.snapshot() {
        let last_pong = conn.last_pong_ms.load(std::sync::atomic::Ordering::Relaxed);
        if now - last_pong > timeout_ms {
            conn.close(4001, "heartbeat_timeout");
            continue;
        }
        conn.push(ServerFrame::Ping { timestamp: now });
    }
}

/// Record a pong from a connection, updating its liveness timestamp.
pub fn record_pong(record: &crate::registry::ConnectionRecord, timestamp: i64) {
    let _ = timestamp;
    record.last_pong_ms.store(now_ms(), std::sync::atomic::Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRecord;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn record_pong_updates_last_pong_timestamp() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let record = ConnectionRecord::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), tx);
        record.last_pong_ms.store(0, std::sync::atomic::Ordering::Relaxed);
        record_pong(&record, 123);
        assert!(record.last_pong_ms.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }
}
