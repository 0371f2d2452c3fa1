//! Client error taxonomy.

use std::time::Duration;
use thiserror::Error;

use crate::domain::ValidationError;

/// Failure of a single HTTP exchange below the retry layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Why a fetch failed.
///
/// `Transient`, `RateLimited` and `Timeout` are worth retrying later;
/// `Permanent` and `Malformed` will not fix themselves.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("transient upstream failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("permanent upstream failure (HTTP {status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("fetch budget of {budget:?} exhausted")]
    Timeout { budget: Duration },

    #[error("circuit open; upstream calls suspended for {remaining:?}")]
    CircuitOpen { remaining: Duration },
}

impl FetchError {
    /// Whether another attempt within the same fetch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. } | FetchError::RateLimited { .. })
    }

    /// Upstream rejected our credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, FetchError::Permanent { status: 401 | 403, .. })
    }

    /// Short stable label for logs and cache entries.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transient { .. } => "transient",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Permanent { .. } => "permanent",
            FetchError::Malformed(_) => "malformed",
            FetchError::Timeout { .. } => "timeout",
            FetchError::CircuitOpen { .. } => "circuit_open",
        }
    }
}

impl From<ValidationError> for FetchError {
    fn from(e: ValidationError) -> Self {
        FetchError::Malformed(e.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Malformed(e.to_string())
    }
}
