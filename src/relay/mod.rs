// Cross-tab relay: owns the single upstream Docker-state subscription on this machine.
// Snapshots go through a writer task into the store; each committed write is announced
// as a payload-free `Updated` signal to every joined consumer.

mod maintenance;
pub mod server;

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::config::{MaintenanceConfig, RelayConfig};
use crate::error::{ApiError, Result};
use crate::models::{DaemonSnapshot, DockerStateSnapshot};
use crate::store::{LocalStore, StoreError};
use crate::subscription::{Backoff, Closer, Handlers, SubscriptionManager};

/// Name of the signal channel, also the path segment of the WebSocket fan-out.
pub const SIGNAL_CHANNEL: &str = "docker-state";

/// Writes the upstream may run ahead of the store before snapshots are dropped.
const WRITE_CHANNEL_CAPACITY: usize = 32;

/// Payload-free notification. Consumers read the store to see what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSignal {
    Updated,
}

impl StateSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateSignal::Updated => "updated",
        }
    }
}

/// Counters reported by the periodic stats log.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub snapshots_received: AtomicU64,
    pub snapshots_written: AtomicU64,
    pub writes_dropped: AtomicU64,
    pub signals_sent: AtomicU64,
}

pub struct RelayDeps {
    pub api: Arc<ApiClient>,
    pub store: Arc<LocalStore>,
    pub config: RelayConfig,
    pub maintenance: MaintenanceConfig,
}

struct RelayInner {
    api: Arc<ApiClient>,
    store: Arc<LocalStore>,
    config: RelayConfig,
    maintenance: MaintenanceConfig,
    /// Taken on shutdown so joined receivers observe the channel closing.
    signals: Mutex<Option<broadcast::Sender<StateSignal>>>,
    stats: Arc<RelayStats>,
    upstream: SubscriptionManager,
    started: OnceCell<Closer>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Relay;

impl Relay {
    pub fn new(deps: RelayDeps) -> RelayHandle {
        let (signals, _) = broadcast::channel(deps.config.broadcast_capacity);
        let backoff = Backoff {
            initial: Duration::from_millis(deps.config.reconnect_initial_ms),
            max: Duration::from_millis(deps.config.reconnect_max_ms),
        };
        let upstream = SubscriptionManager::reconnecting(
            deps.api.stream_client().clone(),
            deps.api.connect_timeout(),
            backoff,
        );
        RelayHandle {
            inner: Arc::new(RelayInner {
                api: deps.api,
                store: deps.store,
                config: deps.config,
                maintenance: deps.maintenance,
                signals: Mutex::new(Some(signals)),
                stats: Arc::new(RelayStats::default()),
                upstream,
                started: OnceCell::new(),
                stop: watch::channel(false).0,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Cloneable handle to the relay.
#[derive(Clone)]
pub struct RelayHandle {
    inner: Arc<RelayInner>,
}

impl RelayHandle {
    /// Start the upstream subscription and background tasks. Later calls return the same closer.
    /// A relay that was shut down stays down.
    pub async fn start(&self) -> Result<Closer> {
        if self.is_shut_down() {
            return Err(ApiError::Transport("relay is shut down".into()));
        }
        self.inner
            .started
            .get_or_try_init(|| self.spawn())
            .await
            .cloned()
    }

    async fn spawn(&self) -> Result<Closer> {
        let inner = &self.inner;
        let endpoint = inner.api.docker_state_endpoint(&inner.config.state_interval)?;
        let signals = self
            .signal_sender()
            .ok_or_else(|| ApiError::Transport("relay is shut down".into()))?;
        let (write_tx, write_rx) = mpsc::channel::<DockerStateSnapshot>(WRITE_CHANNEL_CAPACITY);

        let tasks = vec![
            spawn_state_writer(
                write_rx,
                inner.store.clone(),
                signals.clone(),
                inner.stats.clone(),
                inner.stop.subscribe(),
            ),
            spawn_stats_logger(
                inner.stats.clone(),
                signals,
                Duration::from_secs(inner.config.stats_log_interval_secs),
                inner.stop.subscribe(),
            ),
            maintenance::spawn(
                inner.store.clone(),
                inner.maintenance.clone(),
                inner.stop.subscribe(),
            ),
        ];
        self.lock_tasks().extend(tasks);

        let stats = inner.stats.clone();
        let handlers = Handlers::new(move |snapshot: DockerStateSnapshot| {
            stats.snapshots_received.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = write_tx.try_send(snapshot) {
                stats.writes_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(operation = "relay_write", error = %e, "store writer is behind; snapshot dropped");
            }
        })
        .on_connected(|| info!(operation = "relay", "upstream state stream open"))
        .on_error(|e| warn!(operation = "relay", error = %e, "upstream state stream error"));

        info!(operation = "relay", url = %endpoint.url(), "starting relay");
        inner
            .upstream
            .subscribe(endpoint, decode_daemon_state, handlers)
            .await
    }

    /// A consumer joins: receives every signal sent from now on. After shutdown the
    /// receiver reports the channel as closed.
    pub fn join(&self) -> broadcast::Receiver<StateSignal> {
        match self.signal_sender() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Number of joined consumers.
    pub fn consumers(&self) -> usize {
        self.signal_sender().map_or(0, |tx| tx.receiver_count())
    }

    pub fn stats(&self) -> &RelayStats {
        &self.inner.stats
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Stop the upstream subscription and every background task, then close the signal
    /// channel. Waits for a running cleanup or VACUUM to finish. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.stop.send_replace(true);
        self.inner.upstream.close().await;
        self.inner
            .signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(operation = "relay", error = %e, "relay task ended abnormally");
            }
        }
        info!(operation = "relay", "relay stopped");
    }

    fn signal_sender(&self) -> Option<broadcast::Sender<StateSignal>> {
        self.inner
            .signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves once the relay is shutting down (or dropped).
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|s| *s).await;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DaemonPayload {
    Many(Vec<DaemonSnapshot>),
    One(DaemonSnapshot),
}

/// Decodes one daemon event into the newest snapshot it carries.
pub fn decode_daemon_state(text: &str) -> Result<DockerStateSnapshot> {
    let payload: DaemonPayload = serde_json::from_str(text)
        .map_err(|e| ApiError::Protocol(format!("docker state payload: {}", e)))?;
    let newest = match payload {
        DaemonPayload::One(s) => s,
        DaemonPayload::Many(list) => list
            .into_iter()
            .enumerate()
            .max_by_key(|(i, s)| (s.created_at, *i))
            .map(|(_, s)| s)
            .ok_or_else(|| ApiError::Protocol("docker state payload is an empty list".into()))?,
    };
    Ok(DockerStateSnapshot {
        containers: newest.containers,
    })
}

/// Receives snapshots from the subscription callback and persists them one by one.
/// A signal goes out only after the write committed.
fn spawn_state_writer(
    mut write_rx: mpsc::Receiver<DockerStateSnapshot>,
    store: Arc<LocalStore>,
    signals: broadcast::Sender<StateSignal>,
    stats: Arc<RelayStats>,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                next = write_rx.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };
            match store.put(&snapshot).await {
                Ok(ts) => {
                    stats.snapshots_written.fetch_add(1, Ordering::Relaxed);
                    // no receivers is fine: nobody is looking right now
                    if signals.send(StateSignal::Updated).is_ok() {
                        stats.signals_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(operation = "relay_write", ts, "snapshot stored");
                }
                Err(StoreError::Constraint { ts }) => {
                    stats.writes_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(operation = "relay_write", ts, "duplicate snapshot key; write dropped");
                }
                Err(e) => {
                    stats.writes_dropped.fetch_add(1, Ordering::Relaxed);
                    error!(operation = "relay_write", error = %e, "storing snapshot failed");
                }
            }
        }
        debug!(operation = "relay_write", "state writer stopped");
    })
}

fn spawn_stats_logger(
    stats: Arc<RelayStats>,
    signals: broadcast::Sender<StateSignal>,
    every: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                _ = tick.tick() => {}
            }
            info!(
                operation = "relay_stats",
                received = stats.snapshots_received.load(Ordering::Relaxed),
                written = stats.snapshots_written.load(Ordering::Relaxed),
                dropped = stats.writes_dropped.load(Ordering::Relaxed),
                signals = stats.signals_sent.load(Ordering::Relaxed),
                consumers = signals.receiver_count(),
                "relay stats"
            );
        }
    })
}
