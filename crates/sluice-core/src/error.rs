//! Error taxonomy for outbound API calls.
//!
//! Defines every error condition the resource-control core can surface:
//! transport and HTTP failures classified at the endpoint boundary, plus
//! the control-plane rejections (circuit open, backpressure, invalid state).
//! Errors carry enough context for retry decisions and for callers to
//! inspect provider responses.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for resource-control operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors produced while mediating outbound API calls.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Transport-level connectivity failure (DNS, connect, TLS, broken pipe).
    #[error("transport failure: {message}")]
    Transport {
        /// Description of the transport failure
        message: String,
    },

    /// Request or response exceeded its time budget.
    #[error("request timed out after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the request was abandoned
        timeout_seconds: u64,
    },

    /// Provider rejected the call with HTTP 429.
    #[error("rate limited by provider")]
    RateLimit {
        /// Seconds to wait before retrying, from the Retry-After header
        retry_after_seconds: Option<u64>,
        /// Response body returned by the provider
        body: String,
    },

    /// Authentication or authorization failure (HTTP 401/403).
    #[error("authentication failed: HTTP {status_code}")]
    Auth {
        /// HTTP status code (401 or 403)
        status_code: u16,
        /// Response body returned by the provider
        body: String,
    },

    /// Requested resource does not exist (HTTP 404).
    #[error("not found: {message}")]
    NotFound {
        /// Description of the missing resource
        message: String,
    },

    /// Request was malformed or rejected (4xx other than 401/403/404/408/429).
    #[error("bad request: HTTP {status_code}")]
    BadRequest {
        /// HTTP status code
        status_code: u16,
        /// Response body returned by the provider
        body: String,
    },

    /// Provider-side failure (HTTP 5xx).
    #[error("server error: HTTP {status_code}")]
    Server {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body returned by the provider
        body: String,
    },

    /// Provider returned a 2xx response whose body could not be decoded.
    #[error("undecodable response: {message}")]
    BadResponse {
        /// Description of the decode failure
        message: String,
    },

    /// Circuit breaker is open, call rejected without reaching the provider.
    #[error("circuit breaker open, retry after {retry_after_seconds:.2}s")]
    CircuitOpen {
        /// Seconds until the breaker may admit a probe
        retry_after_seconds: f64,
    },

    /// Downstream queue is saturated and refused the work item.
    #[error("backpressure: {message}")]
    Backpressure {
        /// Description of the saturated stage
        message: String,
    },

    /// Operation attempted against a resource in the wrong lifecycle state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the state violation
        message: String,
    },

    /// Construction or configuration parameter was invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid parameter
        message: String,
    },

    /// The call was cancelled before reaching a natural terminal state.
    #[error("cancelled: {message}")]
    Cancelled {
        /// Description of the cancellation
        message: String,
    },
}

impl ApiError {
    /// Creates a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a rate-limit error with an optional Retry-After hint.
    pub fn rate_limited(retry_after_seconds: Option<u64>, body: impl Into<String>) -> Self {
        Self::RateLimit { retry_after_seconds, body: body.into() }
    }

    /// Creates an authentication error from an HTTP response.
    pub fn auth(status_code: u16, body: impl Into<String>) -> Self {
        Self::Auth { status_code, body: body.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates a bad-request error from an HTTP response.
    pub fn bad_request(status_code: u16, body: impl Into<String>) -> Self {
        Self::BadRequest { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server(status_code: u16, body: impl Into<String>) -> Self {
        Self::Server { status_code, body: body.into() }
    }

    /// Creates a bad-response error for undecodable 2xx bodies.
    pub fn bad_response(message: impl Into<String>) -> Self {
        Self::BadResponse { message: message.into() }
    }

    /// Creates a circuit-open rejection.
    pub fn circuit_open(retry_after_seconds: f64) -> Self {
        Self::CircuitOpen { retry_after_seconds }
    }

    /// Creates a backpressure rejection.
    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::Backpressure { message: message.into() }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Creates a cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled { message: message.into() }
    }

    /// Returns the classification kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::BadRequest { .. } => ErrorKind::BadRequest,
            Self::Server { .. } => ErrorKind::Server,
            Self::BadResponse { .. } => ErrorKind::BadResponse,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Backpressure { .. } => ErrorKind::Backpressure,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Determines if this error represents a temporary failure worth retrying.
    ///
    /// Returns `true` for transport failures, timeouts, provider rate limits,
    /// and server errors. Everything else is either a caller mistake or a
    /// control-plane rejection that retrying would not fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Server
        )
    }

    /// Returns the provider-suggested retry delay in seconds, if any.
    pub fn retry_after_seconds(&self) -> Option<f64> {
        match self {
            Self::RateLimit { retry_after_seconds, .. } => {
                retry_after_seconds.map(|s| s as f64)
            },
            Self::CircuitOpen { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

/// Classification kind of an [`ApiError`].
///
/// Used to express retry and exclusion predicates as sets, and for metrics
/// labels. The kind intentionally drops all payload context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level connectivity failure.
    Transport,
    /// Request timed out.
    Timeout,
    /// Provider rate limit (HTTP 429 or 408-adjacent throttling).
    RateLimit,
    /// Authentication failure (HTTP 401/403).
    Auth,
    /// Resource not found (HTTP 404).
    NotFound,
    /// Malformed request (other 4xx).
    BadRequest,
    /// Provider failure (HTTP 5xx).
    Server,
    /// Undecodable 2xx response.
    BadResponse,
    /// Circuit breaker rejection.
    CircuitOpen,
    /// Queue saturation.
    Backpressure,
    /// Lifecycle state violation.
    InvalidState,
    /// Invalid construction parameter.
    InvalidArgument,
    /// Call cancelled.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::Server => "server",
            Self::BadResponse => "bad_response",
            Self::CircuitOpen => "circuit_open",
            Self::Backpressure => "backpressure",
            Self::InvalidState => "invalid_state",
            Self::InvalidArgument => "invalid_argument",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(ApiError::transport("connection refused").is_retryable());
        assert!(ApiError::timeout(30).is_retryable());
        assert!(ApiError::server(500, "internal server error").is_retryable());
        assert!(ApiError::rate_limited(Some(60), "slow down").is_retryable());

        assert!(!ApiError::auth(401, "bad key").is_retryable());
        assert!(!ApiError::not_found("no such model").is_retryable());
        assert!(!ApiError::bad_request(400, "missing field").is_retryable());
        assert!(!ApiError::bad_response("not json").is_retryable());
        assert!(!ApiError::circuit_open(12.5).is_retryable());
        assert!(!ApiError::backpressure("queue full").is_retryable());
        assert!(!ApiError::invalid_state("stopped").is_retryable());
        assert!(!ApiError::invalid_argument("rate must be positive").is_retryable());
        assert!(!ApiError::cancelled("shutdown").is_retryable());
    }

    #[test]
    fn retry_after_hint_extracted() {
        let error = ApiError::rate_limited(Some(120), "");
        assert_eq!(error.retry_after_seconds(), Some(120.0));

        let error = ApiError::rate_limited(None, "");
        assert_eq!(error.retry_after_seconds(), None);

        let error = ApiError::circuit_open(7.5);
        assert_eq!(error.retry_after_seconds(), Some(7.5));

        assert_eq!(ApiError::timeout(30).retry_after_seconds(), None);
    }

    #[test]
    fn kinds_mapped_correctly() {
        assert_eq!(ApiError::transport("x").kind(), ErrorKind::Transport);
        assert_eq!(ApiError::auth(403, "x").kind(), ErrorKind::Auth);
        assert_eq!(ApiError::server(503, "x").kind(), ErrorKind::Server);
        assert_eq!(ApiError::backpressure("x").kind(), ErrorKind::Backpressure);
    }

    #[test]
    fn error_display_format() {
        let error = ApiError::timeout(30);
        assert_eq!(error.to_string(), "request timed out after 30s");

        let error = ApiError::circuit_open(2.0);
        assert_eq!(error.to_string(), "circuit breaker open, retry after 2.00s");

        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit");
    }
}
