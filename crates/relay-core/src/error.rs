use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-visible error classification. Every [`RelayError`] maps to exactly
/// one kind; the orchestrator's fallback decision is a single switch on
/// [`RelayError::retryable`], never on raw HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "AUTHENTICATION_ERROR")]
    Authentication,
    #[serde(rename = "INSUFFICIENT_FUNDS")]
    InsufficientFunds,
    #[serde(rename = "CONFIGURATION_ERROR")]
    Configuration,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimit,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "API_ERROR")]
    Api,
    #[serde(rename = "NO_PROVIDERS")]
    NoProviders,
    #[serde(rename = "ALL_PROVIDERS_FAILED")]
    AllProvidersFailed,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::Configuration => "CONFIGURATION_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Api => "API_ERROR",
            ErrorKind::NoProviders => "NO_PROVIDERS",
            ErrorKind::AllProvidersFailed => "ALL_PROVIDERS_FAILED",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

/// Unified error type for the entire Relay gateway.
#[derive(Error, Debug)]
pub enum RelayError {
    // ── Caller-side errors ─────────────────────────────────────
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("insufficient funds: balance {balance:.6}, required {required:.6}")]
    InsufficientFunds { balance: f64, required: f64 },

    // ── Upstream errors ────────────────────────────────────────
    #[error("adapter configuration error: {0}")]
    Configuration(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream api error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    // ── Selection / orchestration errors ───────────────────────
    #[error("no providers available for model: {0}")]
    NoProviders(String),

    #[error("all providers failed: {last}")]
    AllProvidersFailed { last: Box<RelayError> },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Validation(_) => ErrorKind::Validation,
            RelayError::Authentication(_) => ErrorKind::Authentication,
            RelayError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            RelayError::Configuration(_) | RelayError::Config(_) => ErrorKind::Configuration,
            RelayError::RateLimited { .. } => ErrorKind::RateLimit,
            RelayError::Timeout { .. } => ErrorKind::Timeout,
            RelayError::Network(_) | RelayError::Io(_) => ErrorKind::Network,
            RelayError::Api { .. } => ErrorKind::Api,
            RelayError::NoProviders(_) => ErrorKind::NoProviders,
            RelayError::AllProvidersFailed { .. } => ErrorKind::AllProvidersFailed,
            RelayError::Serialization(_) => ErrorKind::Api,
            RelayError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the orchestrator may advance to the next ranked provider.
    /// Only a semantically-bad request blocks fallback; it would fail
    /// everywhere.
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration
                | ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Api
                | ErrorKind::Unknown
        )
    }

    /// HTTP status surfaced to the caller when this error terminates a request.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::NoProviders => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::InsufficientFunds => 402,
            ErrorKind::RateLimit => 429,
            ErrorKind::AllProvidersFailed => 502,
            _ => 500,
        }
    }

    /// Classify an upstream HTTP failure into the taxonomy.
    ///
    /// 400 means the request is semantically bad and blocks fallback; 404
    /// indicates a missing deployment/endpoint (misconfiguration, fallback
    /// allowed); everything 5xx is a provider-side API error.
    pub fn from_upstream_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => RelayError::Validation(message),
            401 | 403 => RelayError::Configuration(format!("upstream rejected credentials: {message}")),
            404 => RelayError::Configuration(format!("upstream endpoint not found: {message}")),
            408 => RelayError::Timeout { ms: 0 },
            429 => RelayError::RateLimited { retry_after_secs: 30 },
            s if s >= 500 => RelayError::Api { status, message },
            s => RelayError::Api { status: s, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_400_is_not_retryable() {
        let err = RelayError::from_upstream_status(400, "invalid role");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.retryable());
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn upstream_404_allows_fallback() {
        let err = RelayError::from_upstream_status(404, "deployment missing");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.retryable());
    }

    #[test]
    fn upstream_5xx_allows_fallback() {
        let err = RelayError::from_upstream_status(503, "overloaded");
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.retryable());
    }

    #[test]
    fn exhaustion_surfaces_last_cause() {
        let last = RelayError::from_upstream_status(503, "overloaded");
        let err = RelayError::AllProvidersFailed { last: Box::new(last) };
        assert_eq!(err.status_code(), 502);
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn kind_strings_match_wire_names() {
        assert_eq!(ErrorKind::Validation.as_str(), "VALIDATION_ERROR");
        assert_eq!(ErrorKind::AllProvidersFailed.as_str(), "ALL_PROVIDERS_FAILED");
    }
}
