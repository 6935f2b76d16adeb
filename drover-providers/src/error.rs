//! Typed error handling for provider sends.
//!
//! Adapters classify their own failures; the dispatch engine is the only
//! retry-policy owner and bases everything on the variant alone:
//! - `Transient` - retriable with backoff
//! - `Permanent` - do not retry
//! - `Auth` - do not retry; the message becomes AUTH_ERROR
//! - `RateLimited` - defer, honoring the provider's retry-after hint

use std::time::Duration;

use thiserror::Error;

/// Failure of a provider send or probe.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Provider 5xx, network failure, or timeout; retriable.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Provider rejected the address or content; not retriable.
    #[error("permanent rejection: {0}")]
    Permanent(String),

    /// Credentials rejected; not retriable without operator action.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The provider throttled us; defer and try again later.
    #[error("rate limited by provider: {message}")]
    RateLimited {
        message: String,
        /// Provider-supplied hint, from a Retry-After header when present
        retry_after: Option<Duration>,
    },
}

impl SendError {
    /// Whether a retry with backoff may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the failure is terminal for the message
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Classify an HTTP response the way every adapter does.
    ///
    /// - 401/403 -> `Auth`
    /// - 429 -> `RateLimited` (with the Retry-After hint when parseable)
    /// - other 4xx -> `Permanent`
    /// - everything else (5xx and oddities) -> `Transient`
    #[must_use]
    pub fn from_http(status: reqwest::StatusCode, body: &str, retry_after: Option<u64>) -> Self {
        let summary = format!("{} {}", status.as_u16(), body.trim());

        match status.as_u16() {
            401 | 403 => Self::Auth(summary),
            429 => Self::RateLimited {
                message: summary,
                retry_after: retry_after.map(Duration::from_secs),
            },
            400..=499 => Self::Permanent(summary),
            _ => Self::Transient(summary),
        }
    }
}

/// Network-level failures are transient: the request may never have reached
/// the provider, and retrying is the only safe interpretation.
impl From<reqwest::Error> for SendError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Transient(format!("request timed out: {error}"))
        } else {
            Self::Transient(format!("request failed: {error}"))
        }
    }
}

/// Failure to construct a provider adapter from configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The provider's backend kind does not match the adapter.
    #[error("provider {provider} has backend '{actual}', expected '{expected}'")]
    BackendMismatch {
        provider: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The HTTP client could not be constructed.
    #[error("HTTP client construction failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A rewrite rule carries an invalid regex condition.
    #[error("invalid rewrite condition for header '{header}': {error}")]
    InvalidCondition { header: String, error: String },

    /// A credential cannot be carried in an HTTP header.
    #[error("invalid credential for provider {provider}: {error}")]
    InvalidCredential { provider: String, error: String },
}
