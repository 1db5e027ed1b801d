use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;

/// Semantic version as reported by the backend. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(semver::Version);

impl Version {
    /// Tolerant parse: trims, drops a leading `v`, and rewrites `@` to `-`
    /// (one backend build encodes the prerelease as `1.2.3@beta`). Missing minor or patch
    /// components are filled with zero, so `1.2` reads as `1.2.0`.
    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let normalized = coerce_core(&trimmed.replace('@', "-"));
        semver::Version::parse(&normalized)
            .map(Version)
            .map_err(|e| ApiError::Protocol(format!("invalid version {:?}: {}", raw, e)))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Prerelease identifier, empty when none.
    pub fn pre(&self) -> &str {
        self.0.pre.as_str()
    }

    /// Build metadata, empty when none.
    pub fn build(&self) -> &str {
        self.0.build.as_str()
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }
}

/// Pads a numeric `major` or `major.minor` core to three components; prerelease and build
/// suffixes are kept. Anything else is returned unchanged for the strict parser to judge.
fn coerce_core(version: &str) -> String {
    let split = version.find(['-', '+']).unwrap_or(version.len());
    let (core, rest) = version.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();
    let numeric = parts
        .iter()
        .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if !numeric || parts.len() >= 3 {
        return version.to_string();
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);
    padded
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // build metadata only breaks ties
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Version {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Wire shape of `GET /api/version`.
#[derive(Debug, Deserialize)]
pub(crate) struct CurrentVersionResponse {
    pub version: String,
}

/// Wire shape of `GET /api/version/latest`.
#[derive(Debug, Deserialize)]
pub(crate) struct LatestVersionResponse {
    pub version: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Latest published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestRelease {
    version: Version,
    url: String,
    name: String,
    body: String,
    created_at: DateTime<Utc>,
}

impl LatestRelease {
    pub(crate) fn from_response(resp: LatestVersionResponse) -> Result<Self, ApiError> {
        Ok(Self {
            version: Version::parse(&resp.version)?,
            url: resp.url,
            name: resp.name,
            body: resp.body,
            created_at: resp.created_at,
        })
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
