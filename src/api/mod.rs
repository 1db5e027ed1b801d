// Typed client for the backend HTTP/WebSocket API.
// All paths are relative to the discovered base URL (which already ends in `/api`).

pub mod cache;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ApiConfig;
use crate::error::{ApiError, Result};
use crate::models::{
    CurrentVersionResponse, FaviconCacheEntry, LatestRelease, LatestVersionResponse, RouteTable,
    RoutesResponse, Version, favicon_key,
};
use crate::subscription::{Closer, ConnectionState, Endpoint, Handlers, SubscriptionManager};
use crate::version::user_agent;
use cache::ValueCache;

pub struct ApiClient {
    base_url: Url,
    http: reqwest::Client,
    stream_http: reqwest::Client,
    connect_timeout: Duration,
    favicon_timeout: Duration,
    current_version: ValueCache<(), Version>,
    latest_release: ValueCache<(), LatestRelease>,
    favicons: ValueCache<String, FaviconCacheEntry>,
    routes: SubscriptionManager,
}

impl ApiClient {
    pub fn new(base_url: Url, config: &ApiConfig) -> Result<Self> {
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(format!(
                "{} is not an http(s) base URL",
                base_url
            )));
        }
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let builder = || {
            reqwest::Client::builder()
                .user_agent(user_agent())
                .connect_timeout(connect_timeout)
        };
        let http = builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        // long-lived streams must not inherit the per-request timeout
        let stream_http = builder()
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            routes: SubscriptionManager::new(stream_http.clone(), connect_timeout),
            base_url,
            http,
            stream_http,
            connect_timeout,
            favicon_timeout: Duration::from_secs(config.favicon_timeout_secs),
            current_version: ValueCache::new(1),
            latest_release: ValueCache::new(1),
            favicons: ValueCache::new(config.favicon_cache_capacity),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Client without a total request timeout, for streaming subscriptions to the same backend.
    pub fn stream_client(&self) -> &reqwest::Client {
        &self.stream_http
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// `base_url` with `segments` appended (each one percent-encoded).
    pub fn url_for(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.text().await.map_err(ApiError::from_reqwest)?;
        serde_json::from_str(&body)
            .map_err(|e| ApiError::Protocol(format!("{}: malformed body: {}", url, e)))
    }

    /// Running backend version. Cached unless `force`.
    pub async fn current_version(&self, force: bool) -> Result<Version> {
        self.current_version
            .get_or_fetch((), force, || async {
                let url = self.url_for(&["version"])?;
                debug!(operation = "current_version", url = %url, "fetching");
                let resp: CurrentVersionResponse = self.get_json(url).await?;
                Version::parse(&resp.version)
            })
            .await
    }

    /// Latest published release. Shares its cache slot with [`ApiClient::latest_version`].
    pub async fn latest_release(&self, force: bool) -> Result<LatestRelease> {
        self.latest_release
            .get_or_fetch((), force, || async {
                let url = self.url_for(&["version", "latest"])?;
                debug!(operation = "latest_release", url = %url, "fetching");
                let resp: LatestVersionResponse = self.get_json(url).await?;
                LatestRelease::from_response(resp)
            })
            .await
    }

    pub async fn latest_version(&self, force: bool) -> Result<Version> {
        Ok(self.latest_release(force).await?.version().clone())
    }

    /// True when the published version is newer than the running one. Uses cached values.
    pub async fn update_available(&self) -> Result<bool> {
        let (current, latest) =
            tokio::try_join!(self.current_version(false), self.latest_version(false))?;
        Ok(current < latest)
    }

    #[instrument(skip(self), fields(operation = "routes_list"))]
    pub async fn routes_list(&self) -> Result<RouteTable> {
        let resp: RoutesResponse = self.get_json(self.url_for(&["routes"])?).await?;
        RouteTable::from_response(resp)
    }

    /// WebSocket URL of the routes stream (http -> ws, https -> wss).
    pub fn routes_subscribe_url(&self) -> Result<Url> {
        let mut url = self.url_for(&["routes", "subscribe"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::InvalidUrl(format!("cannot use {} as {}", url, scheme)))?;
        Ok(url)
    }

    /// Subscribe to route table snapshots. Resolves once the socket is open. No reconnect:
    /// after a failure the state is `Errored` and the caller subscribes again.
    pub async fn routes_subscribe(&self, handlers: Handlers<RouteTable>) -> Result<Closer> {
        let endpoint = Endpoint::WebSocket(self.routes_subscribe_url()?);
        self.routes
            .subscribe(endpoint, RouteTable::from_json, handlers)
            .await
    }

    pub async fn routes_state(&self) -> ConnectionState {
        self.routes.state().await
    }

    /// Base64 favicon for `hostname`, `None` when the host has none. Cached unless `force`.
    pub async fn favicon_for(&self, hostname: &str, force: bool) -> Result<Option<String>> {
        let key = favicon_key(hostname);
        if key.is_empty() {
            return Err(ApiError::InvalidUrl(format!(
                "empty hostname {:?}",
                hostname
            )));
        }
        let entry = self
            .favicons
            .get_or_fetch(key.clone(), force, || self.fetch_favicon(key))
            .await?;
        Ok(entry.data)
    }

    /// Cached favicon entry, without fetching.
    pub async fn favicon_entry(&self, hostname: &str) -> Option<FaviconCacheEntry> {
        self.favicons.get(&favicon_key(hostname)).await
    }

    async fn fetch_favicon(&self, hostname: String) -> Result<FaviconCacheEntry> {
        let url = self.url_for(&["favicon", hostname.as_str()])?;
        let resp = self
            .http
            .get(url.clone())
            .timeout(self.favicon_timeout)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let status = resp.status();
        let data = if status == StatusCode::NO_CONTENT {
            None
        } else if status.is_success() {
            let bytes = resp.bytes().await.map_err(ApiError::from_reqwest)?;
            (!bytes.is_empty()).then(|| STANDARD.encode(&bytes))
        } else {
            return Err(ApiError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        };
        debug!(operation = "favicon", hostname = %hostname, found = data.is_some(), "favicon fetched");
        Ok(FaviconCacheEntry {
            hostname,
            data,
            fetched_at: chrono::Utc::now(),
        })
    }

    /// Drop every cached version and favicon.
    pub async fn invalidate(&self) {
        self.current_version.invalidate_all().await;
        self.latest_release.invalidate_all().await;
        self.favicons.invalidate_all().await;
    }

    /// Event stream of Docker state snapshots, refreshed every `interval` (Go duration syntax).
    pub fn docker_state_endpoint(&self, interval: &str) -> Result<Endpoint> {
        let mut url = self.url_for(&["docker", "state"])?;
        url.query_pairs_mut().append_pair("interval", interval);
        Ok(Endpoint::EventStream(url))
    }

    /// Close the routes subscription, if open.
    pub async fn close(&self) {
        self.routes.close().await;
    }
}
