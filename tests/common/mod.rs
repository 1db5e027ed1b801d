// Shared test helpers: an in-process mock of the proxy + backend API on 127.0.0.1:0.
#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 1, 2, 3];

#[derive(Clone)]
pub struct MockConfig {
    pub current_version: String,
    pub latest_version: String,
    pub routes: String,
    /// Frames pushed on every /api/routes/subscribe connection, in order.
    pub routes_frames: Vec<String>,
    /// Close the routes socket after the last frame instead of holding it open.
    pub close_routes_after_frames: bool,
    /// Delay before the WebSocket upgrade answers (keeps a subscription in Connecting).
    pub routes_upgrade_delay: Duration,
    /// `data:` payloads of the Docker state event stream.
    pub state_events: Vec<String>,
    pub state_event_gap: Duration,
    /// First N state stream requests answer 503.
    pub state_failures: usize,
    /// First N discovery GETs answer 502.
    pub discover_failures: usize,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            current_version: "1.4.0".into(),
            latest_version: "1.5.0@beta.1".into(),
            routes: routes_json(&[("b.indocker.app", &[("c2", "http://10.0.0.2:80")])]),
            routes_frames: vec![],
            close_routes_after_frames: false,
            routes_upgrade_delay: Duration::ZERO,
            state_events: vec![],
            state_event_gap: Duration::from_millis(20),
            state_failures: 0,
            discover_failures: 0,
        }
    }
}

#[derive(Default)]
pub struct Counters {
    pub discover: AtomicUsize,
    pub version: AtomicUsize,
    pub latest: AtomicUsize,
    pub routes: AtomicUsize,
    pub routes_ws: AtomicUsize,
    pub favicon: AtomicUsize,
    pub state: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct MockState {
    config: Arc<MockConfig>,
    counters: Arc<Counters>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub counters: Arc<Counters>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start(config: MockConfig) -> Self {
        let counters = Arc::new(Counters::default());
        let state = MockState {
            config: Arc::new(config),
            counters: counters.clone(),
        };
        let app = Router::new()
            .route("/x/indocker/discover", any(discover))
            .route("/x/indocker/discover-empty", get(|| async { axum::Json(serde_json::json!({"api": {}})) }))
            .route("/healthz", get(healthz))
            .route("/api/version", get(version))
            .route("/api/version/latest", get(latest))
            .route("/api/routes", get(routes))
            .route("/api/routes/subscribe", get(routes_subscribe))
            .route("/api/favicon/{hostname}", get(favicon))
            .route("/api/docker/state", get(docker_state))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr,
            counters,
            handle,
        }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}/api", self.addr)).unwrap()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn routes_json(entries: &[(&str, &[(&str, &str)])]) -> String {
    let routes: Vec<serde_json::Value> = entries
        .iter()
        .map(|(hostname, urls)| {
            let urls: serde_json::Map<String, serde_json::Value> = urls
                .iter()
                .map(|(id, url)| (id.to_string(), serde_json::Value::String(url.to_string())))
                .collect();
            serde_json::json!({ "hostname": hostname, "urls": urls })
        })
        .collect();
    serde_json::json!({ "routes": routes }).to_string()
}

/// One daemon event: a list with a single snapshot holding `ids` (empty inspect/stats).
pub fn state_event(created_at: &str, ids: &[&str]) -> String {
    let containers: serde_json::Map<String, serde_json::Value> = ids
        .iter()
        .map(|id| {
            (
                id.to_string(),
                serde_json::json!({
                    "inspect": { "Id": id, "Name": format!("/{}", id), "State": { "Status": "running" } },
                    "stats": {}
                }),
            )
        })
        .collect();
    serde_json::json!([{ "created_at": created_at, "containers": containers }]).to_string()
}

fn host_without_port(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.split(':').next())
        .unwrap_or_default()
        .to_string()
}

async fn discover(
    State(state): State<MockState>,
    method: axum::http::Method,
    headers: HeaderMap,
) -> Response {
    let host = host_without_port(&headers);
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://{}", host));
    let cors = [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, origin),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "GET".to_string()),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "*".to_string()),
    ];
    match method.as_str() {
        "OPTIONS" => (StatusCode::NO_CONTENT, cors).into_response(),
        "TRACE" => (StatusCode::OK, cors).into_response(),
        "GET" => {
            let n = state.counters.discover.fetch_add(1, Ordering::SeqCst);
            if n < state.config.discover_failures {
                return (StatusCode::BAD_GATEWAY, "upstream not ready").into_response();
            }
            let marked = headers
                .get("x-indocker")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == "true");
            if !marked {
                return (StatusCode::BAD_REQUEST, "missing marker header").into_response();
            }
            let body = serde_json::json!({ "api": { "base_url": format!("http://{}/api", host) } });
            (StatusCode::OK, cors, axum::Json(body)).into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn healthz(headers: HeaderMap) -> Response {
    let ua = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if ua.starts_with("HealthChecker/") {
        "OK".into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn version(State(state): State<MockState>) -> impl IntoResponse {
    state.counters.version.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    axum::Json(serde_json::json!({ "version": state.config.current_version }))
}

async fn latest(State(state): State<MockState>) -> impl IntoResponse {
    state.counters.latest.fetch_add(1, Ordering::SeqCst);
    axum::Json(serde_json::json!({
        "version": state.config.latest_version,
        "url": "https://github.com/indocker-app/indocker.app/releases/latest",
        "name": "next",
        "body": "changelog",
        "created_at": "2024-05-01T10:00:00Z"
    }))
}

async fn routes(State(state): State<MockState>) -> impl IntoResponse {
    state.counters.routes.fetch_add(1, Ordering::SeqCst);
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.config.routes.clone(),
    )
}

async fn routes_subscribe(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    state.counters.routes_ws.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(state.config.routes_upgrade_delay).await;
    let config = state.config.clone();
    ws.on_upgrade(move |socket| push_route_frames(socket, config))
}

async fn push_route_frames(mut socket: WebSocket, config: Arc<MockConfig>) {
    for frame in &config.routes_frames {
        if socket.send(Message::Text(frame.clone().into())).await.is_err() {
            return;
        }
    }
    if config.close_routes_after_frames {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}

async fn favicon(State(state): State<MockState>, Path(hostname): Path<String>) -> Response {
    state.counters.favicon.fetch_add(1, Ordering::SeqCst);
    match hostname.as_str() {
        "foo.indocker.app" => StatusCode::NO_CONTENT.into_response(),
        "img.indocker.app" => ([(header::CONTENT_TYPE, "image/png")], PNG_BYTES).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn docker_state(State(state): State<MockState>) -> Response {
    let n = state.counters.state.fetch_add(1, Ordering::SeqCst);
    if n < state.config.state_failures {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let gap = state.config.state_event_gap;
    let events = state.config.state_events.clone();
    let stream = futures_util::stream::iter(events)
        .then(move |data| async move {
            tokio::time::sleep(gap).await;
            Ok::<_, Infallible>(format!("data: {}\n\n", data))
        })
        .chain(futures_util::stream::pending());
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}
