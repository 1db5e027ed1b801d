// Realtime subscription manager: one physical connection, optional reconnect with capped backoff.
//
// Idle -> Connecting -> Open -> (Closed | Errored); with reconnect enabled Errored -> Connecting
// after a backoff delay. Closed is terminal and only reached through the closer.

mod frames;

pub use frames::Endpoint;

use frames::FrameReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Doubling delay between reconnect attempts, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

type ConnectedFn = Box<dyn FnMut() + Send>;
type UpdateFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(&ApiError) + Send>;

/// Callbacks for one subscription. Called from the subscription task, in receipt order.
pub struct Handlers<T> {
    on_connected: Option<ConnectedFn>,
    on_update: UpdateFn<T>,
    on_error: Option<ErrorFn>,
}

impl<T> Handlers<T> {
    pub fn new(on_update: impl FnMut(T) + Send + 'static) -> Self {
        Self {
            on_connected: None,
            on_update: Box::new(on_update),
            on_error: None,
        }
    }

    /// Called every time the connection opens (including after a reconnect).
    pub fn on_connected(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    /// Called for failures after the subscription resolved: dropped connections and
    /// frames that do not decode.
    pub fn on_error(mut self, f: impl FnMut(&ApiError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn connected(&mut self) {
        if let Some(f) = self.on_connected.as_mut() {
            f();
        }
    }

    fn error(&mut self, e: &ApiError) {
        if let Some(f) = self.on_error.as_mut() {
            f(e);
        }
    }
}

struct CloserInner {
    cancel: watch::Sender<bool>,
    state: watch::Sender<ConnectionState>,
    finished: AtomicBool,
}

/// Handle to a live subscription. Cloneable; `close` is idempotent.
#[derive(Clone)]
pub struct Closer {
    inner: Arc<CloserInner>,
}

impl Closer {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(CloserInner {
                cancel,
                state,
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Close the connection and cancel any pending reconnect. Safe to call any number of times.
    pub fn close(&self) {
        self.inner.cancel.send_replace(true);
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Watch state transitions (e.g. to wait for `Open` after a reconnect).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Still owns (or is about to re-open) a connection.
    fn is_active(&self) -> bool {
        !*self.inner.cancel.borrow() && !self.inner.finished.load(Ordering::Acquire)
    }

    /// Closed is terminal: later transitions from the task are ignored.
    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed || *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
    }
}

/// Owns at most one physical connection at a time.
pub struct SubscriptionManager {
    http: reqwest::Client,
    connect_timeout: Duration,
    reconnect: Option<Backoff>,
    current: Mutex<Option<Closer>>,
}

impl SubscriptionManager {
    /// Manager that ends in `Closed`/`Errored`; the caller decides whether to subscribe again.
    pub fn new(http: reqwest::Client, connect_timeout: Duration) -> Self {
        Self {
            http,
            connect_timeout,
            reconnect: None,
            current: Mutex::new(None),
        }
    }

    /// Manager that reconnects after failures with the given backoff until closed.
    pub fn reconnecting(http: reqwest::Client, connect_timeout: Duration, backoff: Backoff) -> Self {
        Self {
            reconnect: Some(backoff),
            ..Self::new(http, connect_timeout)
        }
    }

    pub async fn state(&self) -> ConnectionState {
        match self.current.lock().await.as_ref() {
            Some(c) => c.state(),
            None => ConnectionState::Idle,
        }
    }

    /// Open the subscription and resolve once the connection is open.
    ///
    /// While a subscription of this manager is connecting, open or waiting to reconnect, this is
    /// a no-op returning the existing closer right away (the new handlers are dropped).
    /// Without reconnect, a failed first connection is returned as `Err`; with reconnect, it is
    /// reported through `on_error` and retried, and the closer is returned.
    /// Closing the manager while the first connection is pending resolves with the closed closer.
    pub async fn subscribe<T, D>(
        &self,
        endpoint: Endpoint,
        decode: D,
        handlers: Handlers<T>,
    ) -> Result<Closer>
    where
        T: Send + 'static,
        D: Fn(&str) -> Result<T> + Send + Sync + 'static,
    {
        let (closer, opened_rx) = {
            let mut current = self.current.lock().await;
            if let Some(existing) = current.as_ref()
                && existing.is_active()
            {
                debug!(
                    operation = "subscribe",
                    url = %endpoint.url(),
                    state = ?existing.state(),
                    "subscription already active; reusing it"
                );
                return Ok(existing.clone());
            }

            let closer = Closer::new();
            let (opened_tx, opened_rx) = oneshot::channel();
            tokio::spawn(run(
                Session {
                    http: self.http.clone(),
                    connect_timeout: self.connect_timeout,
                    endpoint,
                    reconnect: self.reconnect,
                    closer: closer.clone(),
                },
                decode,
                handlers,
                opened_tx,
            ));
            *current = Some(closer.clone());
            (closer, opened_rx)
        };

        match opened_rx.await {
            Ok(Ok(())) => Ok(closer),
            Ok(Err(e)) if self.reconnect.is_some() => {
                warn!(operation = "subscribe", error = %e, "first connection failed; will retry");
                Ok(closer)
            }
            Ok(Err(e)) => Err(e),
            Err(_) if closer.is_closed() => Ok(closer),
            Err(_) => Err(ApiError::Transport(
                "subscription task ended before the connection opened".into(),
            )),
        }
    }

    /// Close the current subscription, if any.
    pub async fn close(&self) {
        if let Some(c) = self.current.lock().await.as_ref() {
            c.close();
        }
    }
}

struct Session {
    http: reqwest::Client,
    connect_timeout: Duration,
    endpoint: Endpoint,
    reconnect: Option<Backoff>,
    closer: Closer,
}

enum SessionEnd {
    Cancelled,
    Failed(ApiError),
}

async fn run<T, D>(
    session: Session,
    decode: D,
    mut handlers: Handlers<T>,
    opened_tx: oneshot::Sender<Result<()>>,
) where
    D: Fn(&str) -> Result<T>,
{
    let Session {
        http,
        connect_timeout,
        endpoint,
        reconnect,
        closer,
    } = session;
    let mut cancel_rx = closer.inner.cancel.subscribe();
    let mut opened_tx = Some(opened_tx);
    let mut attempt: u32 = 0;
    let url = endpoint.url().clone();

    loop {
        closer.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = cancelled(&mut cancel_rx) => break,
            r = FrameReader::connect(&http, &endpoint, connect_timeout) => r,
        };

        let error = match connected {
            Ok(reader) => {
                attempt = 0;
                closer.set_state(ConnectionState::Open);
                info!(operation = "subscribe", url = %url, "subscription open");
                handlers.connected();
                if let Some(tx) = opened_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                match pump(reader, &mut cancel_rx, &decode, &mut handlers).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Failed(e) => e,
                }
            }
            Err(e) => e,
        };

        if *cancel_rx.borrow() {
            break;
        }
        closer.set_state(ConnectionState::Errored);
        warn!(operation = "subscribe", url = %url, error = %error, "subscription failed");
        match opened_tx.take() {
            Some(tx) if reconnect.is_none() => {
                let _ = tx.send(Err(error));
                break;
            }
            Some(tx) => {
                let _ = tx.send(Err(error.clone()));
                handlers.error(&error);
            }
            None => handlers.error(&error),
        }

        let Some(backoff) = reconnect else {
            break;
        };
        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(operation = "subscribe", url = %url, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            _ = cancelled(&mut cancel_rx) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    closer.inner.finished.store(true, Ordering::Release);
    debug!(operation = "subscribe", url = %url, state = ?closer.state(), "subscription task finished");
}

/// Resolves once the closer fired.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    let _ = cancel_rx.wait_for(|c| *c).await;
}

async fn pump<T, D>(
    mut reader: FrameReader,
    cancel_rx: &mut watch::Receiver<bool>,
    decode: &D,
    handlers: &mut Handlers<T>,
) -> SessionEnd
where
    D: Fn(&str) -> Result<T>,
{
    loop {
        tokio::select! {
            _ = cancelled(cancel_rx) => {
                reader.close().await;
                return SessionEnd::Cancelled;
            }
            frame = reader.next_frame() => match frame {
                Some(Ok(text)) => match decode(&text) {
                    Ok(value) => (handlers.on_update)(value),
                    Err(e) => {
                        warn!(operation = "decode_frame", error = %e, "dropping undecodable frame");
                        handlers.error(&e);
                    }
                },
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => {
                    return SessionEnd::Failed(ApiError::Transport(
                        "connection closed by peer".into(),
                    ))
                }
            }
        }
    }
}
