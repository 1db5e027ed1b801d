// Store maintenance for the relay: periodic VACUUM on a cron schedule (local time) or fixed
// interval, plus a TTL sweep so the store shrinks even when the upstream goes quiet.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stopped;
use crate::config::MaintenanceConfig;
use crate::store::LocalStore;

/// Runs until the relay stops; a cleanup or VACUUM in progress finishes first.
pub(super) fn spawn(
    store: Arc<LocalStore>,
    config: MaintenanceConfig,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (vacuum_tx, mut vacuum_rx) = mpsc::channel::<()>(1);
        let scheduler = tokio::spawn(vacuum_scheduler(config, vacuum_tx));
        loop {
            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                due = vacuum_rx.recv() => {
                    if due.is_none() {
                        break;
                    }
                }
            }
            match store.cleanup().await {
                Ok(removed) if removed.snapshots > 0 => info!(
                    operation = "cleanup",
                    snapshots = removed.snapshots,
                    labels = removed.labels,
                    usage = removed.usage,
                    "expired records removed"
                ),
                Ok(_) => {}
                Err(e) => warn!(operation = "cleanup", error = %e, "cleanup failed"),
            }
            if let Err(e) = store.vacuum().await {
                warn!(operation = "vacuum", error = %e, "vacuum failed");
            } else {
                info!(operation = "vacuum", "vacuum complete");
            }
        }
        scheduler.abort();
        debug!(operation = "maintenance", "maintenance stopped");
    })
}

/// Next VACUUM delay for a cron expression, measured from `now`.
pub(super) fn next_cron_delay(
    schedule: &cron::Schedule,
    now: chrono::DateTime<chrono::Local>,
) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or(Duration::from_secs(1)))
}

async fn vacuum_scheduler(config: MaintenanceConfig, tx: mpsc::Sender<()>) {
    if let Some(cron_str) = config.vacuum_schedule.as_deref() {
        let schedule = match cron::Schedule::from_str(cron_str) {
            Ok(s) => s,
            Err(e) => {
                warn!(cron = %cron_str, error = %e, "invalid vacuum_schedule; VACUUM will not run");
                return;
            }
        };
        loop {
            match next_cron_delay(&schedule, chrono::Local::now()) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
                None => tokio::time::sleep(Duration::from_secs(3600)).await,
            }
        }
    } else {
        let interval = Duration::from_secs(config.vacuum_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    }
}
