// Explicit application context: everything a process needs, built once and passed around.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::api::ApiClient;
use crate::config::AppConfig;
use crate::discovery::Discovery;
use crate::relay::{Relay, RelayDeps, RelayHandle};
use crate::store::LocalStore;

/// Which execution context the process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the upstream subscription and is the only store writer.
    Relay,
    /// Reads the store after relay signals; may subscribe to routes itself.
    Tab,
}

pub struct AppContext {
    pub config: AppConfig,
    pub role: Role,
    pub discovery: Arc<Discovery>,
    pub api: Arc<ApiClient>,
    /// `None` for a tab started before any relay created the store file.
    pub store: Option<Arc<LocalStore>>,
    pub relay: Option<RelayHandle>,
}

impl AppContext {
    /// Resolve the API (configured base URL or discovery), open the store and, for
    /// [`Role::Relay`], build the relay without starting it.
    pub async fn create(config: AppConfig, role: Role) -> anyhow::Result<Self> {
        let discovery = Arc::new(Discovery::new(config.discovery.clone())?);
        let base_url = match config.api.base_url.as_deref() {
            Some(raw) => Url::parse(raw)?,
            None => discovery.base_url().await?,
        };
        info!(operation = "context", role = ?role, base_url = %base_url, "API resolved");
        let api = Arc::new(ApiClient::new(base_url, &config.api)?);

        let (store, relay) = match role {
            Role::Relay => {
                let store = LocalStore::connect(
                    &config.store.path,
                    Duration::from_secs(config.store.ttl_secs),
                    config.store.max_pool_size,
                )
                .await?;
                store.init().await?;
                let store = Arc::new(store);
                let relay = Relay::new(RelayDeps {
                    api: api.clone(),
                    store: store.clone(),
                    config: config.relay.clone(),
                    maintenance: config.maintenance.clone(),
                });
                (Some(store), Some(relay))
            }
            Role::Tab if Path::new(&config.store.path).exists() => (
                Some(Arc::new(LocalStore::connect_read_only(&config.store.path).await?)),
                None,
            ),
            Role::Tab => {
                info!(
                    operation = "context",
                    path = %config.store.path,
                    "store not created yet; no relay has run on this machine"
                );
                (None, None)
            }
        };

        Ok(Self {
            config,
            role,
            discovery,
            api,
            store,
            relay,
        })
    }

    /// Stop subscriptions and close the store pool.
    pub async fn close(&self) {
        if let Some(relay) = &self.relay {
            relay.shutdown().await;
        }
        self.api.close().await;
        if let Some(store) = &self.store {
            store.close().await;
        }
        info!(operation = "context", role = ?self.role, "context closed");
    }
}
