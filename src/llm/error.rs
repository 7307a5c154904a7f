//! Error classification and retry policy for LLM requests.

use std::fmt;
use std::time::Duration;

/// Broad category of an LLM request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// HTTP 429 or provider-specific quota signal
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// HTTP 4xx other than 429 (bad request, auth, unknown model)
    ClientError,
    /// Timeout, DNS, connection reset
    NetworkError,
    /// Response body did not match the expected shape
    ParseError,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
            Self::ServerError => write!(f, "server error"),
            Self::ClientError => write!(f, "client error"),
            Self::NetworkError => write!(f, "network error"),
            Self::ParseError => write!(f, "parse error"),
        }
    }
}

/// Classify an HTTP status code into an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

/// A failed LLM request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, status: Option<u16>, message: String) -> Self {
        Self {
            kind,
            message,
            status,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, Some(429), message)
        }
    }

    pub fn server_error(status: u16, message: String) -> Self {
        Self::new(LlmErrorKind::ServerError, Some(status), message)
    }

    pub fn client_error(status: u16, message: String) -> Self {
        Self::new(LlmErrorKind::ClientError, Some(status), message)
    }

    pub fn network_error(message: String) -> Self {
        Self::new(LlmErrorKind::NetworkError, None, message)
    }

    pub fn parse_error(message: String) -> Self {
        Self::new(LlmErrorKind::ParseError, None, message)
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            LlmErrorKind::RateLimited => Self::rate_limited(body, retry_after),
            LlmErrorKind::ClientError => Self::client_error(status, body),
            _ => Self::server_error(status, body),
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }

    /// Delay before the next attempt: the server's Retry-After when given,
    /// otherwise exponential backoff starting at one second.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(after) = self.retry_after {
            return after;
        }
        let base = Duration::from_secs(1);
        base.saturating_mul(2u32.saturating_pow(attempt.min(6)))
    }
}

/// Retry limits applied by the HTTP clients.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// No retries at all; used by tests and by callers with their own fallback.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            max_retry_duration: Duration::ZERO,
        }
    }

    pub fn should_retry(&self, error: &LlmError) -> bool {
        self.max_retries > 0 && error.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let config = RetryConfig::default();
        assert!(!config.should_retry(&LlmError::client_error(401, "bad key".into())));
        assert!(config.should_retry(&LlmError::server_error(502, "bad gateway".into())));
        assert!(!RetryConfig::none().should_retry(&LlmError::network_error("reset".into())));
    }

    #[test]
    fn test_suggested_delay_prefers_retry_after() {
        let err = LlmError::rate_limited("slow down".into(), Some(Duration::from_secs(7)));
        assert_eq!(err.suggested_delay(3), Duration::from_secs(7));

        let err = LlmError::network_error("timeout".into());
        assert_eq!(err.suggested_delay(0), Duration::from_secs(1));
        assert_eq!(err.suggested_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_display_includes_status() {
        let err = LlmError::client_error(404, "model not found".into());
        assert_eq!(err.to_string(), "client error (404): model not found");
    }
}
