// Local signal server: lets consumers in other processes join the relay.
//
// GET /healthz     -> "OK"
// GET /version     -> {"name", "version"}
// WS  /ws/signals  -> text frame "updated" per committed snapshot

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use super::{RelayHandle, StateSignal};
use crate::version::{NAME, VERSION};

pub(crate) const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct ServerState {
    relay: RelayHandle,
    ws_connections: Arc<AtomicUsize>,
}

/// Decrements the signal connection count on drop.
struct WsConnectionGuard(Arc<AtomicUsize>);

impl Drop for WsConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn app(relay: &RelayHandle) -> Router {
    let state = ServerState {
        relay: relay.clone(),
        ws_connections: Arc::new(AtomicUsize::new(0)),
    };
    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/version", get(version_handler))
        .route("/ws/signals", get(ws_signals))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

/// Bind the relay address. `Ok(None)` when the address is taken: another relay already owns this machine.
pub async fn try_bind(addr: &str) -> std::io::Result<Option<TcpListener>> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(Some(listener)),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(None),
        Err(e) => Err(e),
    }
}

async fn version_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

async fn ws_signals(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    let rx = state.relay.join();
    let conn_count = state.ws_connections.clone();
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = stream_signals(socket, rx, conn_count).await {
            info!(operation = "ws_signals", error = %e, "signal stream ended with error");
        }
    })
}

async fn stream_signals(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<StateSignal>,
    conn_count: Arc<AtomicUsize>,
) -> anyhow::Result<()> {
    let connected = conn_count.fetch_add(1, Ordering::Relaxed) + 1;
    let _guard = WsConnectionGuard(conn_count);
    info!(operation = "ws_signals", connections = connected, "consumer joined");

    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await;
    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(signal) => {
                    let sent = timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(signal.as_str().into()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // signals carry no payload; one catch-up signal covers everything skipped
                    warn!(operation = "ws_signals", skipped = n, "consumer lagged");
                    let sent = timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(StateSignal::Updated.as_str().into()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            _ = ping_interval.tick() => {
                let sent = timeout(WS_SEND_TIMEOUT, socket.send(Message::Ping(Bytes::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
    Ok(())
}
