// Client error taxonomy. Errors carry strings so they can be cloned into callbacks.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Backend address could not be resolved. Terminal for the session.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// HTTP succeeded but the payload failed validation.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Connection-level failure (request, WebSocket or stream).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status} from {url}")]
    Http { status: u16, url: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Maps a reqwest failure onto the taxonomy (timeouts are kept apart from other transport errors).
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::Http {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<url::ParseError> for ApiError {
    fn from(e: url::ParseError) -> Self {
        ApiError::InvalidUrl(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
