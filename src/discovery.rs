// API discovery over wildcard DNS.
//
// The client knows only the root domain. It asks `<random label>.<root>` for the API base URL;
// any label resolves because the zone is wildcarded, and a fresh label every time keeps CDN and
// browser caches out of the way.

use rand::Rng;
use reqwest::{Method, StatusCode, header};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DiscoveryConfig;
use crate::error::{ApiError, Result};
use crate::version::user_agent;

const LABEL_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LABEL_MIN_LEN: usize = 8;
const LABEL_MAX_LEN: usize = 20;

pub const HEALTH_CHECK_USER_AGENT: &str = "HealthChecker/indocker";

/// Random DNS label, 8 to 20 chars of `[a-z0-9]`.
pub fn random_label() -> String {
    let mut rng = rand::rng();
    let len = rng.random_range(LABEL_MIN_LEN..=LABEL_MAX_LEN);
    (0..len)
        .map(|_| LABEL_CHARSET[rng.random_range(0..LABEL_CHARSET.len())] as char)
        .collect()
}

/// Body of a discovery answer. Older proxies answer `{"base_url": ...}`, current ones nest it under `api`.
#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api: Option<DiscoverApi>,
}

#[derive(Debug, Deserialize)]
struct DiscoverApi {
    #[serde(default)]
    base_url: Option<String>,
}

/// Extracts and validates the base URL from a discovery body.
pub fn parse_discovery_body(body: &str) -> Result<Url> {
    let resp: DiscoverResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::Discovery(format!("malformed discovery body: {}", e)))?;
    let raw = resp
        .api
        .and_then(|a| a.base_url)
        .or(resp.base_url)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Discovery("discovery body has no base_url".into()))?;
    let url = Url::parse(&raw)
        .map_err(|e| ApiError::Discovery(format!("base_url {:?} is not a URL: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::Discovery(format!(
            "base_url {:?} must be http or https",
            raw
        )));
    }
    Ok(url)
}

/// Preflight probe verbs understood by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Options,
    Trace,
}

impl ProbeMethod {
    fn as_method(self) -> Method {
        match self {
            ProbeMethod::Options => Method::OPTIONS,
            ProbeMethod::Trace => Method::TRACE,
        }
    }
}

/// CORS headers returned by a preflight-style probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub status: u16,
    pub allow_origin: Option<String>,
    pub allow_methods: Option<String>,
    pub allow_headers: Option<String>,
}

pub struct Discovery {
    http: reqwest::Client,
    config: DiscoveryConfig,
    resolved: OnceCell<Url>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let http = Self::client_builder(&config)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            config,
            resolved: OnceCell::new(),
        })
    }

    fn client_builder(config: &DiscoveryConfig) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(user_agent())
            .timeout(Duration::from_secs(config.timeout_secs))
    }

    /// `<label>.<root_domain>`.
    pub fn host_for(&self, label: &str) -> String {
        format!("{}.{}", label, self.config.root_domain)
    }

    /// URL for `path` on `<label>.<root_domain>`; keeps the `connect_to` port when one is set.
    pub fn url_for(&self, label: &str, path: &str) -> Result<Url> {
        let host = self.host_for(label);
        let raw = match self.config.connect_to {
            Some(addr) => format!("{}://{}:{}{}", self.config.scheme, host, addr.port(), path),
            None => format!("{}://{}{}", self.config.scheme, host, path),
        };
        Ok(Url::parse(&raw)?)
    }

    /// Origin the proxy is expected to echo back for `label`.
    pub fn origin_for(&self, label: &str) -> String {
        format!("{}://{}", self.config.scheme, self.host_for(label))
    }

    /// Client for one request to `host`. With `connect_to`, the host is pinned to that address.
    fn client_for(&self, host: &str) -> Result<reqwest::Client> {
        match self.config.connect_to {
            Some(addr) => Self::client_builder(&self.config)
                .resolve(host, addr)
                .build()
                .map_err(|e| ApiError::Transport(e.to_string())),
            None => Ok(self.http.clone()),
        }
    }

    /// Memoized base URL. Only a successful discovery is remembered; a failure is returned
    /// to the caller and the next call tries again.
    pub async fn base_url(&self) -> Result<Url> {
        self.resolved
            .get_or_try_init(|| self.discover())
            .await
            .cloned()
    }

    /// One discovery round-trip.
    pub async fn discover(&self) -> Result<Url> {
        let label = random_label();
        let url = self.url_for(&label, &self.config.path)?;
        let client = self.client_for(&self.host_for(&label))?;
        debug!(operation = "discover", url = %url, "discovering API");

        let resp = client
            .get(url.clone())
            .header(self.config.marker_header.as_str(), "true")
            .send()
            .await
            .map_err(|e| {
                warn!(operation = "discover", error = %e, "discovery request failed");
                ApiError::Discovery(format!("request to {} failed: {}", url, e))
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Discovery(format!(
                "unexpected status {} from {}",
                status.as_u16(),
                url
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ApiError::Discovery(format!("reading body from {}: {}", url, e)))?;
        let base_url = parse_discovery_body(&body)?;
        info!(operation = "discover", base_url = %base_url, "API discovered");
        Ok(base_url)
    }

    /// Preflight-style probe: confirms the proxy answers on a random subdomain and
    /// advertises the CORS headers the marker header needs.
    pub async fn probe(&self, method: ProbeMethod) -> Result<ProbeReport> {
        let label = random_label();
        let url = self.url_for(&label, &self.config.path)?;
        let client = self.client_for(&self.host_for(&label))?;
        let origin = self.origin_for(&label);

        let resp = client
            .request(method.as_method(), url.clone())
            .header(header::ORIGIN, origin.as_str())
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .header(
                header::ACCESS_CONTROL_REQUEST_HEADERS,
                self.config.marker_header.to_lowercase(),
            )
            .send()
            .await
            .map_err(|e| ApiError::Discovery(format!("probe to {} failed: {}", url, e)))?;

        let header_str = |name: header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let report = ProbeReport {
            status: resp.status().as_u16(),
            allow_origin: header_str(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            allow_methods: header_str(header::ACCESS_CONTROL_ALLOW_METHODS),
            allow_headers: header_str(header::ACCESS_CONTROL_ALLOW_HEADERS),
        };
        self.check_probe(&report)?;
        Ok(report)
    }

    fn check_probe(&self, report: &ProbeReport) -> Result<()> {
        if report.status != StatusCode::OK.as_u16()
            && report.status != StatusCode::NO_CONTENT.as_u16()
        {
            return Err(ApiError::Discovery(format!(
                "probe answered with status {}",
                report.status
            )));
        }
        let origin = report
            .allow_origin
            .as_deref()
            .ok_or_else(|| ApiError::Discovery("probe: missing Access-Control-Allow-Origin".into()))?;
        let scheme_prefix = format!("{}://", self.config.scheme);
        let root_suffix = format!(".{}", self.config.root_domain);
        let host = origin.strip_prefix(&scheme_prefix).unwrap_or_default();
        let host = host.split(':').next().unwrap_or_default();
        if !host.ends_with(&root_suffix) || host.len() == root_suffix.len() {
            return Err(ApiError::Discovery(format!(
                "probe: Access-Control-Allow-Origin {:?} is not a {}*{} origin",
                origin, scheme_prefix, root_suffix
            )));
        }
        if report.allow_methods.as_deref().is_none_or(str::is_empty) {
            return Err(ApiError::Discovery(
                "probe: missing Access-Control-Allow-Methods".into(),
            ));
        }
        let marker = self.config.marker_header.to_lowercase();
        let headers_ok = report.allow_headers.as_deref().is_some_and(|h| {
            h.split(',')
                .map(|s| s.trim().to_lowercase())
                .any(|s| s == "*" || s == marker)
        });
        if !headers_ok {
            return Err(ApiError::Discovery(format!(
                "probe: Access-Control-Allow-Headers does not allow {}",
                self.config.marker_header
            )));
        }
        Ok(())
    }

    /// Liveness of the proxy layer: `GET /healthz` on any subdomain must answer `200 OK`.
    pub async fn health_check(&self) -> Result<()> {
        let label = random_label();
        let url = self.url_for(&label, "/healthz")?;
        let client = self.client_for(&self.host_for(&label))?;
        let resp = client
            .get(url.clone())
            .header(header::USER_AGENT, HEALTH_CHECK_USER_AGENT)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(ApiError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.text().await.map_err(ApiError::from_reqwest)?;
        if body.trim() != "OK" {
            return Err(ApiError::Protocol(format!(
                "health check body {:?}, expected \"OK\"",
                body
            )));
        }
        Ok(())
    }
}
