use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cached favicon lookup. `data == None` is a valid "host has no favicon" answer (HTTP 204).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaviconCacheEntry {
    pub hostname: String,
    /// Base64 (standard alphabet) image bytes.
    pub data: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Cache key for a hostname: trailing slashes removed.
pub fn favicon_key(hostname: &str) -> String {
    hostname.trim().trim_end_matches('/').to_string()
}
