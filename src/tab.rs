// Consumer side ("tab"): views fed by route subscriptions and relay signals.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, broadcast, watch};
use tracing::{debug, warn};
use url::Url;

use crate::api::ApiClient;
use crate::error::{ApiError, Result};
use crate::models::RouteTable;
use crate::relay::StateSignal;
use crate::store::{LocalStore, StoredSnapshot};
use crate::subscription::{Backoff, Closer, Endpoint, Handlers, SubscriptionManager};

/// Last known route table. Every delivered snapshot replaces the previous one wholesale,
/// in delivery order.
#[derive(Clone)]
pub struct RouteView {
    latest: Arc<watch::Sender<Option<RouteTable>>>,
}

impl Default for RouteView {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteView {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            latest: Arc::new(latest),
        }
    }

    pub fn apply(&self, table: RouteTable) {
        self.latest.send_replace(Some(table));
    }

    pub fn current(&self) -> Option<RouteTable> {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<RouteTable>> {
        self.latest.subscribe()
    }

    /// Subscription callbacks that feed this view.
    pub fn handlers(&self) -> Handlers<RouteTable> {
        let view = self.clone();
        Handlers::new(move |table: RouteTable| view.apply(table))
            .on_error(|e| warn!(operation = "routes_subscribe", error = %e, "route stream error"))
    }
}

/// Newest stored Docker state, re-read from the store on every relay signal.
pub struct StateView {
    store: OnceCell<Arc<LocalStore>>,
    /// Opened read-only on first use when the view starts without a store.
    path: Option<String>,
    api: Option<Arc<ApiClient>>,
    latest: watch::Sender<Option<StoredSnapshot>>,
}

impl StateView {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self::with(OnceCell::new_with(Some(store)), None)
    }

    /// View over a store file that may not exist yet. Reads stay empty until a relay creates it.
    pub fn open_lazily(path: impl Into<String>) -> Self {
        Self::with(OnceCell::new(), Some(path.into()))
    }

    fn with(store: OnceCell<Arc<LocalStore>>, path: Option<String>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            store,
            path,
            api: None,
            latest,
        }
    }

    /// Drop the client's cached values on every signal.
    pub fn invalidating(mut self, api: Arc<ApiClient>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn current(&self) -> Option<StoredSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<StoredSnapshot>> {
        self.latest.subscribe()
    }

    async fn store(&self) -> anyhow::Result<Option<&Arc<LocalStore>>> {
        if let Some(store) = self.store.get() {
            return Ok(Some(store));
        }
        let Some(path) = self.path.as_deref() else {
            return Ok(None);
        };
        if !Path::new(path).exists() {
            return Ok(None);
        }
        let store = self
            .store
            .get_or_try_init(|| async { LocalStore::connect_read_only(path).await.map(Arc::new) })
            .await?;
        Ok(Some(store))
    }

    /// Read the newest snapshot from the store. A store that does not exist yet reads as empty.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let Some(store) = self.store().await? else {
            debug!(operation = "state_view", "store not created yet");
            return Ok(());
        };
        let latest = store.latest().await?;
        if let Some(s) = &latest {
            debug!(operation = "state_view", ts = s.ts, containers = s.ids.len(), "state refreshed");
        }
        self.latest.send_replace(latest);
        Ok(())
    }

    /// Follow relay signals until the channel closes.
    pub async fn follow(&self, mut signals: broadcast::Receiver<StateSignal>) {
        if let Err(e) = self.refresh().await {
            warn!(operation = "state_view", error = %e, "initial read failed");
        }
        loop {
            match signals.recv().await {
                Ok(StateSignal::Updated) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(operation = "state_view", skipped = n, "signals coalesced");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            if let Some(api) = &self.api {
                api.invalidate().await;
            }
            if let Err(e) = self.refresh().await {
                warn!(operation = "state_view", error = %e, "store read failed");
            }
        }
    }
}

pub fn decode_signal(text: &str) -> Result<StateSignal> {
    match text.trim() {
        "updated" => Ok(StateSignal::Updated),
        other => Err(ApiError::Protocol(format!("unknown signal {:?}", other))),
    }
}

/// Joins a relay running in another process through its `/ws/signals` endpoint.
pub struct RemoteSignals {
    manager: SubscriptionManager,
    url: Url,
    signals: broadcast::Sender<StateSignal>,
}

impl RemoteSignals {
    /// `listen` is the relay's `host:port`.
    pub fn new(listen: &str, capacity: usize, backoff: Backoff) -> Result<Self> {
        let url = Url::parse(&format!("ws://{}/ws/signals", listen))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let (signals, _) = broadcast::channel(capacity.max(1));
        Ok(Self {
            manager: SubscriptionManager::reconnecting(http, Duration::from_secs(5), backoff),
            url,
            signals,
        })
    }

    /// Connect (reconnecting on failure) and return a receiver of forwarded signals.
    pub async fn join(&self) -> Result<(Closer, broadcast::Receiver<StateSignal>)> {
        let rx = self.signals.subscribe();
        let tx = self.signals.clone();
        let handlers = Handlers::new(move |signal: StateSignal| {
            let _ = tx.send(signal);
        })
        .on_error(|e| warn!(operation = "remote_signals", error = %e, "relay signal stream error"));
        let closer = self
            .manager
            .subscribe(Endpoint::WebSocket(self.url.clone()), decode_signal, handlers)
            .await?;
        Ok((closer, rx))
    }
}
