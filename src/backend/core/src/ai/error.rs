//! Error taxonomy for the AI provider.

use std::time::Duration;
use thiserror::Error;

use crate::error::{ErrorCode, InspectorError};

#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("AI provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("AI provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("AI provider request timed out")]
    Timeout,

    #[error("AI provider unavailable (status {status})")]
    Unavailable { status: u16 },

    #[error("AI provider unreachable: {0}")]
    Network(String),

    #[error("Invalid AI request: {0}")]
    InvalidRequest(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Content policy violation: {0}")]
    ContentPolicy(String),

    #[error("AI request cancelled")]
    Cancelled,
}

impl AiError {
    /// Rate limits, timeouts, unavailability and network failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout | Self::Unavailable { .. } | Self::Network(_)
        )
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::Unavailable { .. } => "unavailable",
            Self::Network(_) => "network",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidImage(_) => "invalid_image",
            Self::ContentPolicy(_) => "content_policy",
            Self::Cancelled => "cancelled",
        }
    }

    /// Minimum wait the provider asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-2xx response. `message` is the provider's error text.
    pub fn from_status(status: u16, message: &str, retry_after: Option<Duration>) -> Self {
        let lower = message.to_lowercase();
        match status {
            401 | 403 => Self::Unauthorized(message.to_string()),
            429 => Self::RateLimited { retry_after },
            408 | 504 => Self::Timeout,
            500 | 502 | 503 | 529 => Self::Unavailable { status },
            400 | 413 | 422 => {
                if lower.contains("content policy") || lower.contains("safety") {
                    Self::ContentPolicy(message.to_string())
                } else if lower.contains("image") {
                    Self::InvalidImage(message.to_string())
                } else {
                    Self::InvalidRequest(message.to_string())
                }
            }
            500..=599 => Self::Unavailable { status },
            _ => Self::InvalidRequest(format!("unexpected status {}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(error.to_string())
        }
    }
}

impl From<AiError> for InspectorError {
    fn from(error: AiError) -> Self {
        let code = match &error {
            AiError::RateLimited { .. } => ErrorCode::AiRateLimited,
            AiError::Timeout => ErrorCode::AiTimeout,
            AiError::Unavailable { .. } => ErrorCode::AiUnavailable,
            AiError::Network(_) => ErrorCode::NetworkError,
            AiError::Cancelled => ErrorCode::JobTimeout,
            AiError::Unauthorized(_)
            | AiError::InvalidRequest(_)
            | AiError::InvalidImage(_)
            | AiError::ContentPolicy(_) => ErrorCode::AiApiError,
        };
        InspectorError::new(code, error.to_string()).with_source(error)
    }
}
