//! Remote failure taxonomy

use thiserror::Error;

/// Failure classes for calls against the remote site.
///
/// Everything below the component contracts speaks this type; the components
/// themselves flatten it into `bool`/`Option` results before it reaches a loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// Timeout or connection failure, worth retrying with backoff
    #[error("transient network failure: {0}")]
    Transient(String),

    /// HTTP 429 or equivalent
    #[error("remote throttled the request")]
    Throttled,

    /// Item already locked or already part of another trade
    #[error("remote conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("daily quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("unexpected status {status}")]
    Status { status: u16 },

    /// Response arrived but a required field was missing or unparsable
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Whether a bounded retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Map a non-success HTTP status onto the taxonomy
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => RemoteError::Throttled,
            404 => RemoteError::NotFound("remote returned 404".to_string()),
            422 => RemoteError::Conflict("remote returned 422".to_string()),
            _ => RemoteError::Status { status },
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            RemoteError::Transient(err.to_string())
        } else if err.is_decode() || err.is_body() {
            RemoteError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::from_status(status.as_u16())
        } else {
            RemoteError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Malformed(err.to_string())
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;
