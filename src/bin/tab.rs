// Consumer process: follows routes and relay signals, logs what it sees.

use anyhow::Result;
use indocker_sync::config;
use indocker_sync::context::{AppContext, Role};
use indocker_sync::subscription::Backoff;
use indocker_sync::tab::{RemoteSignals, RouteView, StateView};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app_config = config::AppConfig::load()?;
    let ctx = AppContext::create(app_config, Role::Tab).await?;
    let api = ctx.api.clone();

    // version info degrades to "unknown" instead of blocking
    match tokio::try_join!(api.current_version(false), api.latest_release(false)) {
        Ok((current, latest)) => tracing::info!(
            current = %current,
            latest = %latest.version(),
            update_available = current < *latest.version(),
            "backend version"
        ),
        Err(e) => tracing::warn!(error = %e, "backend version unknown"),
    }

    let routes = RouteView::new();
    match api.routes_list().await {
        Ok(table) => routes.apply(table),
        Err(e) => tracing::warn!(error = %e, operation = "routes_list", "initial route list failed"),
    }
    let routes_closer = api.routes_subscribe(routes.handlers()).await?;

    let remote = RemoteSignals::new(
        &ctx.config.relay.listen,
        ctx.config.relay.broadcast_capacity,
        Backoff {
            initial: Duration::from_millis(ctx.config.relay.reconnect_initial_ms),
            max: Duration::from_millis(ctx.config.relay.reconnect_max_ms),
        },
    )?;
    let (signals_closer, signals) = remote.join().await?;
    let state = match ctx.store.clone() {
        Some(store) => StateView::new(store),
        None => StateView::open_lazily(ctx.config.store.path.clone()),
    };
    let state = Arc::new(state.invalidating(api.clone()));
    let follower = {
        let state = state.clone();
        tokio::spawn(async move { state.follow(signals).await })
    };

    let mut route_rx = routes.watch();
    let mut state_rx = state.watch();
    loop {
        tokio::select! {
            changed = route_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = route_rx.borrow_and_update().as_ref().map_or(0, |t| t.len());
                tracing::info!(hostnames = count, "routes updated");
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(s) = state_rx.borrow_and_update().as_ref() {
                    tracing::info!(ts = s.ts, containers = s.ids.len(), "docker state updated");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    routes_closer.close();
    signals_closer.close();
    follower.abort();
    ctx.close().await;
    Ok(())
}
