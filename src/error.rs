//! Error taxonomy shared by every layer of the crate.
//!
//! Upstream failures are split by whether retrying can help:
//! [`Error::TransientUpstream`] is retried by the backoff executor and absorbed by
//! stale cache data or registered fallbacks, while [`Error::PermanentUpstream`]
//! propagates verbatim. Local decisions ([`Error::RateLimited`],
//! [`Error::CircuitOpen`], [`Error::Unauthorized`]) never reach the upstream at all.

use std::time::Duration;

use thiserror::Error;

/// A failure reported by the upstream record API itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// The upstream could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// One attempt exceeded its deadline.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// The upstream answered with a non-success status.
    #[error("upstream responded with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The upstream refused the payload.
    #[error("upstream rejected the request: {0}")]
    Validation(String),
}

impl UpstreamError {
    /// Returns `true` for network failures, timeouts, 5xx responses and upstream
    /// throttling (429). Everything else is a caller-side problem.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Validation(_) => false,
        }
    }
}

/// Errors produced by the caching and resilience layer.
///
/// # Examples
///
/// ```
/// use upguard::{Error, UpstreamError};
///
/// let outage: Error = UpstreamError::Http { status: 503, message: "down".into() }.into();
/// assert!(outage.is_retryable());
///
/// let missing: Error = UpstreamError::Http { status: 404, message: "gone".into() }.into();
/// assert!(!missing.is_retryable());
/// assert_eq!(missing.upstream_status(), Some(404));
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// Worth retrying: network failure, timeout, 5xx or upstream 429.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(UpstreamError),

    /// Retrying cannot help. Propagated to the caller unchanged.
    #[error("permanent upstream failure: {0}")]
    PermanentUpstream(UpstreamError),

    /// The request gate throttled the caller.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The breaker rejected the call without contacting the upstream.
    #[error("circuit open")]
    CircuitOpen,

    /// The credential was missing or wrong. Never says which.
    #[error("unauthorized")]
    Unauthorized,

    /// A durable cache file could not be decoded. Treated as a miss.
    #[error("corrupt cache entry for {key}: {reason}")]
    CacheCorruption { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An environment value is missing or unusable.
    #[error("invalid configuration for {field}: {reason}")]
    Config { field: &'static str, reason: String },
}

impl Error {
    /// Whether the default retry predicate should try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientUpstream(_))
    }

    /// The HTTP status of an upstream failure, if the upstream answered at all.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::TransientUpstream(UpstreamError::Http { status, .. })
            | Self::PermanentUpstream(UpstreamError::Http { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

impl From<UpstreamError> for Error {
    fn from(err: UpstreamError) -> Self {
        if err.is_transient() {
            Self::TransientUpstream(err)
        } else {
            Self::PermanentUpstream(err)
        }
    }
}

/// Crate-wide result, defaulting to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
