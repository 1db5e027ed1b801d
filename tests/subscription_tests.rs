// SubscriptionManager: event streams, reconnect with backoff, cancellation

mod common;

use common::{MockConfig, MockServer, state_event};
use indocker_sync::error::ApiError;
use indocker_sync::models::DockerStateSnapshot;
use indocker_sync::relay::decode_daemon_state;
use indocker_sync::subscription::{
    Backoff, ConnectionState, Endpoint, Handlers, SubscriptionManager,
};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn state_endpoint(server: &MockServer) -> Endpoint {
    Endpoint::EventStream(
        Url::parse(&format!("http://{}/api/docker/state?interval=1s", server.addr)).unwrap(),
    )
}

fn fast_backoff() -> Backoff {
    Backoff {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn event_stream_updates_arrive_in_order() {
    let server = MockServer::start(MockConfig {
        state_events: vec![
            state_event("2024-05-01T10:00:00Z", &["a"]),
            state_event("2024-05-01T10:00:01Z", &["a", "b"]),
            state_event("2024-05-01T10:00:02Z", &["c"]),
        ],
        ..MockConfig::default()
    })
    .await;
    let manager = SubscriptionManager::new(reqwest::Client::new(), CONNECT_TIMEOUT);

    let (tx, mut rx) = mpsc::unbounded_channel::<DockerStateSnapshot>();
    let closer = manager
        .subscribe(
            state_endpoint(&server),
            decode_daemon_state,
            Handlers::new(move |s| {
                let _ = tx.send(s);
            }),
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let s = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(s.ids());
    }
    assert_eq!(
        seen,
        vec![
            vec!["a".to_string()],
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
        ]
    );
    closer.close();
}

#[tokio::test]
async fn first_failure_without_reconnect_is_returned() {
    let server = MockServer::start(MockConfig {
        state_failures: 1,
        ..MockConfig::default()
    })
    .await;
    let manager = SubscriptionManager::new(reqwest::Client::new(), CONNECT_TIMEOUT);

    let err = manager
        .subscribe(
            state_endpoint(&server),
            decode_daemon_state,
            Handlers::new(|_: DockerStateSnapshot| {}),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ApiError::Http { status: 503, .. }), "{:?}", err);
    assert_eq!(server.counters.state.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnecting_manager_retries_until_open() {
    let server = MockServer::start(MockConfig {
        state_failures: 3,
        state_events: vec![state_event("2024-05-01T10:00:00Z", &["a"])],
        ..MockConfig::default()
    })
    .await;
    let manager =
        SubscriptionManager::reconnecting(reqwest::Client::new(), CONNECT_TIMEOUT, fast_backoff());

    let (tx, mut rx) = mpsc::unbounded_channel::<DockerStateSnapshot>();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<ApiError>();
    let closer = manager
        .subscribe(
            state_endpoint(&server),
            decode_daemon_state,
            Handlers::new(move |s| {
                let _ = tx.send(s);
            })
            .on_error(move |e| {
                let _ = err_tx.send(e.clone());
            }),
        )
        .await
        .unwrap();

    let s = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s.ids(), vec!["a".to_string()]);
    assert_eq!(closer.state(), ConnectionState::Open);
    assert_eq!(server.counters.state.load(Ordering::SeqCst), 4);

    let mut errors = 0;
    while err_rx.try_recv().is_ok() {
        errors += 1;
    }
    assert_eq!(errors, 3);
    closer.close();
}

#[tokio::test]
async fn close_cancels_pending_reconnect() {
    let server = MockServer::start(MockConfig {
        state_failures: usize::MAX,
        ..MockConfig::default()
    })
    .await;
    let manager = SubscriptionManager::reconnecting(
        reqwest::Client::new(),
        CONNECT_TIMEOUT,
        Backoff {
            initial: Duration::from_millis(300),
            max: Duration::from_secs(10),
        },
    );

    let closer = manager
        .subscribe(
            state_endpoint(&server),
            decode_daemon_state,
            Handlers::new(|_: DockerStateSnapshot| {}),
        )
        .await
        .unwrap();
    assert_eq!(closer.state(), ConnectionState::Errored);

    closer.close();
    closer.close();
    assert_eq!(closer.state(), ConnectionState::Closed);
    let attempts = server.counters.state.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.counters.state.load(Ordering::SeqCst), attempts);
    assert_eq!(closer.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn closed_subscription_can_be_replaced() {
    let server = MockServer::start(MockConfig::default()).await;
    let manager = SubscriptionManager::new(reqwest::Client::new(), CONNECT_TIMEOUT);
    let url = Url::parse(&format!("ws://{}/api/routes/subscribe", server.addr)).unwrap();
    let subscribe = || {
        manager.subscribe(
            Endpoint::WebSocket(url.clone()),
            |text: &str| Ok(text.to_string()),
            Handlers::new(|_: String| {}),
        )
    };

    assert_eq!(manager.state().await, ConnectionState::Idle);
    let first = subscribe().await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Open);
    first.close();
    assert_eq!(manager.state().await, ConnectionState::Closed);

    let second = subscribe().await.unwrap();
    assert_eq!(second.state(), ConnectionState::Open);
    assert_eq!(first.state(), ConnectionState::Closed);
    assert_eq!(server.counters.routes_ws.load(Ordering::SeqCst), 2);
    second.close();
}
