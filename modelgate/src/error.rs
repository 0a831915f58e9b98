use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Vendor-independent failure classification.
///
/// Retry and UX decisions branch on this, never on vendor strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    RateLimited,
    Validation,
    ContextLengthExceeded,
    ContentBlocked,
    ServerError,
    Timeout,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::ServerError | ErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Validation => "validation",
            ErrorKind::ContextLengthExceeded => "context_length_exceeded",
            ErrorKind::ContentBlocked => "content_blocked",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// A failure reported by (or about) a vendor API, already classified.
    #[error("{provider} {kind}: {message}")]
    Api {
        provider: String,
        kind: ErrorKind,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("{provider}: unsupported model {model:?} (supported: {})", .supported.join(", "))]
    InvalidModel {
        provider: String,
        model: String,
        supported: Vec<String>,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    Timeout,

    #[error("{provider}: provider is closed")]
    Closed { provider: String },
}

impl ProviderError {
    pub fn api(provider: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        ProviderError::Api {
            provider: provider.to_string(),
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Api { kind, .. } => *kind,
            ProviderError::Network(e) => {
                if e.is_timeout() {
                    ErrorKind::Timeout
                } else if e.is_builder() {
                    ErrorKind::Validation
                } else {
                    ErrorKind::ServerError
                }
            }
            ProviderError::Json(_) => ErrorKind::ServerError,
            ProviderError::InvalidOption(_) | ProviderError::InvalidModel { .. } => {
                ErrorKind::Validation
            }
            ProviderError::Cancelled => ErrorKind::Cancelled,
            ProviderError::Timeout => ErrorKind::Timeout,
            ProviderError::Closed { .. } => ErrorKind::Validation,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status, .. } => *status,
            ProviderError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Vendor-supplied delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Human-facing message without the provider/kind prefix.
    pub fn message(&self) -> String {
        match self {
            ProviderError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        for kind in [
            ErrorKind::Authentication,
            ErrorKind::Validation,
            ErrorKind::ContextLengthExceeded,
            ErrorKind::ContentBlocked,
            ErrorKind::Cancelled,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.is_retryable(), "{kind} must be terminal");
        }
    }

    #[test]
    fn local_errors_have_kinds() {
        assert_eq!(ProviderError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(ProviderError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            ProviderError::InvalidOption("max_tokens".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn invalid_model_lists_supported() {
        let err = ProviderError::InvalidModel {
            provider: "openai".into(),
            model: "gpt-9".into(),
            supported: vec!["gpt-4".into(), "gpt-3.5-turbo".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("gpt-9"));
        assert!(msg.contains("gpt-4, gpt-3.5-turbo"));
    }

    #[test]
    fn api_error_display() {
        let err = ProviderError::api("anthropic", ErrorKind::RateLimited, "slow down");
        assert_eq!(err.to_string(), "anthropic rate_limited: slow down");
        assert_eq!(err.message(), "slow down");
    }
}
