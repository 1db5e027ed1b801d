use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::error::ApiError;

/// Wire shape shared by `GET /api/routes` and every `/api/routes/subscribe` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesResponse {
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub hostname: String,
    /// container id -> reachable URL
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
}

/// Full routing snapshot: hostname -> (container id -> URL), keys sorted.
///
/// Always delivered whole; an empty inner map means the hostname is known
/// but nothing currently serves it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: BTreeMap<String, BTreeMap<String, Url>>,
}

impl RouteTable {
    pub fn from_response(resp: RoutesResponse) -> Result<Self, ApiError> {
        let mut routes = BTreeMap::new();
        for entry in resp.routes {
            let mut urls = BTreeMap::new();
            for (container_id, raw) in entry.urls {
                let url = Url::parse(&raw).map_err(|e| {
                    ApiError::Protocol(format!(
                        "route {} / {}: bad url {:?}: {}",
                        entry.hostname, container_id, raw, e
                    ))
                })?;
                urls.insert(container_id, url);
            }
            // duplicated hostnames: last entry wins, same as a map built in order
            routes.insert(entry.hostname, urls);
        }
        Ok(Self { routes })
    }

    /// Parses one JSON document (HTTP body or WebSocket frame).
    pub fn from_json(text: &str) -> Result<Self, ApiError> {
        let resp: RoutesResponse = serde_json::from_str(text)
            .map_err(|e| ApiError::Protocol(format!("routes payload: {}", e)))?;
        Self::from_response(resp)
    }

    pub fn get(&self, hostname: &str) -> Option<&BTreeMap<String, Url>> {
        self.routes.get(hostname)
    }

    /// Hostnames in sorted order.
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, Url>)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True when the hostname is known but has no serving container.
    pub fn is_unroutable(&self, hostname: &str) -> bool {
        self.routes.get(hostname).is_some_and(BTreeMap::is_empty)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
