use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// "http" or "https"; the scheme the app itself is served under.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Wildcard-DNS zone; any `<label>.<root_domain>` must reach the proxy.
    #[serde(default = "default_root_domain")]
    pub root_domain: String,
    #[serde(default = "default_discovery_path")]
    pub path: String,
    #[serde(default = "default_marker_header")]
    pub marker_header: String,
    #[serde(default = "default_discovery_timeout_secs")]
    pub timeout_secs: u64,
    /// Send discovery traffic to this address instead of resolving the random host.
    #[serde(default)]
    pub connect_to: Option<SocketAddr>,
}

fn default_scheme() -> String {
    "https".into()
}

fn default_root_domain() -> String {
    "indocker.app".into()
}

fn default_discovery_path() -> String {
    "/x/indocker/discover".into()
}

fn default_marker_header() -> String {
    "X-InDocker".into()
}

fn default_discovery_timeout_secs() -> u64 {
    10
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            root_domain: default_root_domain(),
            path: default_discovery_path(),
            marker_header: default_marker_header(),
            timeout_secs: default_discovery_timeout_secs(),
            connect_to: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Skip discovery and use this base URL (e.g. "http://127.0.0.1:8080/api").
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_favicon_timeout_secs")]
    pub favicon_timeout_secs: u64,
    /// Max hostnames kept in the favicon cache (least recently used evicted first).
    #[serde(default = "default_favicon_cache_capacity")]
    pub favicon_cache_capacity: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_favicon_timeout_secs() -> u64 {
    10
}

fn default_favicon_cache_capacity() -> usize {
    256
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            favicon_timeout_secs: default_favicon_timeout_secs(),
            favicon_cache_capacity: default_favicon_cache_capacity(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    /// Records older than this are deleted on every write.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_store_path() -> String {
    "data/state.db".into()
}

fn default_max_pool_size() -> u32 {
    4
}

fn default_ttl_secs() -> u64 {
    15 * 60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_pool_size: default_max_pool_size(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Local address for /healthz and /ws/signals. In use = another relay already runs.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Max pending signals per joined consumer (slow consumers may lag).
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Refresh interval requested from the daemon, Go duration syntax ("1s", "500ms").
    #[serde(default = "default_state_interval")]
    pub state_interval: String,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Backoff ceiling between reconnect attempts.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// How often to log relay stats (signals sent, writes dropped) at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

fn default_listen() -> String {
    "127.0.0.1:7790".into()
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_state_interval() -> String {
    "1s".into()
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_stats_log_interval_secs() -> u64 {
    60
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            broadcast_capacity: default_broadcast_capacity(),
            state_interval: default_state_interval(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *"). Uses local time.
    #[serde(default)]
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every N seconds when vacuum_schedule is not set.
    #[serde(default = "default_vacuum_interval_secs")]
    pub vacuum_interval_secs: u64,
}

fn default_vacuum_interval_secs() -> u64 {
    3600
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            vacuum_schedule: None,
            vacuum_interval_secs: default_vacuum_interval_secs(),
        }
    }
}

impl AppConfig {
    /// Reads `CONFIG_FILE` (default `config.toml`). A missing default file means all defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").ok();
        let s = match &path {
            Some(p) => std::fs::read_to_string(p)?,
            None => match std::fs::read_to_string("config.toml") {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            },
        };
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(self.discovery.scheme.as_str(), "http" | "https"),
            "discovery.scheme must be \"http\" or \"https\", got {:?}",
            self.discovery.scheme
        );
        anyhow::ensure!(
            !self.discovery.root_domain.is_empty() && !self.discovery.root_domain.starts_with('.'),
            "discovery.root_domain must be a non-empty domain, got {:?}",
            self.discovery.root_domain
        );
        anyhow::ensure!(
            self.discovery.path.starts_with('/'),
            "discovery.path must start with '/', got {:?}",
            self.discovery.path
        );
        anyhow::ensure!(
            !self.discovery.marker_header.is_empty(),
            "discovery.marker_header must be non-empty"
        );
        anyhow::ensure!(
            self.discovery.timeout_secs > 0,
            "discovery.timeout_secs must be > 0, got {}",
            self.discovery.timeout_secs
        );
        if let Some(base_url) = &self.api.base_url {
            anyhow::ensure!(
                url::Url::parse(base_url).is_ok(),
                "api.base_url must be an absolute URL, got {:?}",
                base_url
            );
        }
        anyhow::ensure!(
            self.api.favicon_timeout_secs > 0,
            "api.favicon_timeout_secs must be > 0, got {}",
            self.api.favicon_timeout_secs
        );
        anyhow::ensure!(
            self.api.request_timeout_secs > 0,
            "api.request_timeout_secs must be > 0, got {}",
            self.api.request_timeout_secs
        );
        anyhow::ensure!(
            self.api.favicon_cache_capacity > 0,
            "api.favicon_cache_capacity must be > 0, got {}",
            self.api.favicon_cache_capacity
        );
        anyhow::ensure!(!self.store.path.is_empty(), "store.path must be non-empty");
        anyhow::ensure!(
            self.store.max_pool_size > 0,
            "store.max_pool_size must be > 0, got {}",
            self.store.max_pool_size
        );
        anyhow::ensure!(
            self.store.ttl_secs > 0,
            "store.ttl_secs must be > 0, got {}",
            self.store.ttl_secs
        );
        anyhow::ensure!(
            self.relay.listen.parse::<SocketAddr>().is_ok(),
            "relay.listen must be host:port, got {:?}",
            self.relay.listen
        );
        anyhow::ensure!(
            self.relay.broadcast_capacity > 0,
            "relay.broadcast_capacity must be > 0, got {}",
            self.relay.broadcast_capacity
        );
        anyhow::ensure!(
            !self.relay.state_interval.is_empty(),
            "relay.state_interval must be non-empty"
        );
        anyhow::ensure!(
            self.relay.reconnect_initial_ms > 0
                && self.relay.reconnect_initial_ms <= self.relay.reconnect_max_ms,
            "relay.reconnect_initial_ms must be in 1..=reconnect_max_ms, got {}",
            self.relay.reconnect_initial_ms
        );
        anyhow::ensure!(
            self.relay.stats_log_interval_secs > 0,
            "relay.stats_log_interval_secs must be > 0, got {}",
            self.relay.stats_log_interval_secs
        );
        if let Some(schedule) = &self.maintenance.vacuum_schedule {
            anyhow::ensure!(
                cron::Schedule::from_str(schedule).is_ok(),
                "maintenance.vacuum_schedule must be a cron expression (sec min hour dom mon dow), got {:?}",
                schedule
            );
        }
        anyhow::ensure!(
            self.maintenance.vacuum_interval_secs > 0,
            "maintenance.vacuum_interval_secs must be > 0, got {}",
            self.maintenance.vacuum_interval_secs
        );
        Ok(())
    }
}
