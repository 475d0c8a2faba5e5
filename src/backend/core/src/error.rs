//! Error handling for Inspector Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and context chaining
//! - Retryability classification used by job handlers at their boundary
//! - User-facing vs internal messages (job rows store the user message)
//! - Error logging with tracing integration and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use inspector_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn load() -> Result<Vec<u8>> {
//!     std::fs::read("image.jpg").with_error_code(ErrorCode::StorageError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Inspector operations.
pub type Result<T> = std::result::Result<T, InspectorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    UnknownJobType,
    InvalidJobPayload,
    InvalidStateTransition,
    JobTimeout,

    // Domain Errors (1100-1199)
    InspectionNotFound,
    PreconditionFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    DatabaseTransactionFailed,
    RecordNotFound,
    DuplicateRecord,

    // Storage Errors (2100-2199)
    StorageError,
    ObjectNotFound,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // External Service Errors (3000-3099)
    AiApiError,
    AiRateLimited,
    AiTimeout,
    AiUnavailable,
    RenderFailed,
    ExternalServiceError,
    NetworkError,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    TimeLimitExceeded,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::UnknownJobType => 1001,
            Self::InvalidJobPayload => 1002,
            Self::InvalidStateTransition => 1003,
            Self::JobTimeout => 1004,

            Self::InspectionNotFound => 1100,
            Self::PreconditionFailed => 1101,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::DatabaseTransactionFailed => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::StorageError => 2100,
            Self::ObjectNotFound => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::AiApiError => 3000,
            Self::AiRateLimited => 3001,
            Self::AiTimeout => 3002,
            Self::AiUnavailable => 3003,
            Self::RenderFailed => 3004,
            Self::ExternalServiceError => 3005,
            Self::NetworkError => 3006,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::TimeLimitExceeded => 9001,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Handlers use this to classify errors that reach their boundary as
    /// transient or permanent.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::DatabaseTransactionFailed
                | Self::StorageError
                | Self::AiRateLimited
                | Self::AiTimeout
                | Self::AiUnavailable
                | Self::RenderFailed
                | Self::ExternalServiceError
                | Self::NetworkError
                | Self::JobTimeout
                | Self::TimeLimitExceeded
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "domain",
            2000..=2099 => "database",
            2100..=2199 => "storage",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input, missing records
    Low,
    /// Operational issues (rate limits, timeouts)
    Medium,
    /// System errors (database failures, bugs)
    High,
    /// The process cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::InvalidJobPayload
            | ErrorCode::JobNotFound
            | ErrorCode::InspectionNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::ObjectNotFound
            | ErrorCode::PreconditionFailed
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::AiRateLimited
            | ErrorCode::AiTimeout
            | ErrorCode::AiUnavailable
            | ErrorCode::JobTimeout
            | ErrorCode::TimeLimitExceeded
            | ErrorCode::NetworkError
            | ErrorCode::ExternalServiceError
            | ErrorCode::AiApiError
            | ErrorCode::RenderFailed
            | ErrorCode::UnknownJobType => Self::Medium,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::ConfigurationError => Self::Critical,

            _ => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details attached to an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Type of the entity involved (e.g. "inspection", "job")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Identifier of the entity involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Free-form context values
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub context: HashMap<String, serde_json::Value>,

    /// Suggested wait before retrying, when the upstream told us
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Inspector Core.
#[derive(Error, Debug)]
pub struct InspectorError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to store on job rows and show to operators
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for InspectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl InspectorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "inspector_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error carrying `message`.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| InspectorError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| InspectorError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| InspectorError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| InspectorError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for InspectorError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for InspectorError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for InspectorError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::AiTimeout, "External service request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to external service")
        } else if let Some(status) = error.status() {
            match status.as_u16() {
                429 => (ErrorCode::AiRateLimited, "Rate limited by external service"),
                401 | 403 => (
                    ErrorCode::AiApiError,
                    "Authentication failed with external service",
                ),
                500..=599 => (
                    ErrorCode::AiUnavailable,
                    "External service is temporarily unavailable",
                ),
                _ => (
                    ErrorCode::ExternalServiceError,
                    "External service returned an error",
                ),
            }
        } else {
            (ErrorCode::NetworkError, "Network error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for InspectorError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::TimeLimitExceeded,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for InspectorError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::ObjectNotFound, "File or object not found"),
            ErrorKind::TimedOut => (ErrorCode::TimeLimitExceeded, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::StorageError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for InspectorError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<InspectorError>() {
            Ok(inspector_error) => inspector_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for InspectorError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl InspectorError {
    /// Create a job not found error.
    pub fn job_not_found(job_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    /// Create an unknown job type error.
    pub fn unknown_job_type(job_type: impl Into<String>) -> Self {
        let job_type = job_type.into();
        Self::new(
            ErrorCode::UnknownJobType,
            format!("No handler registered for job type: {}", job_type),
        )
        .with_context("job_type", &job_type)
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(job_type: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidJobPayload,
            format!("Invalid payload for {}: {}", job_type, reason.into()),
        )
    }

    /// Create an inspection not found error.
    pub fn inspection_not_found(inspection_id: uuid::Uuid) -> Self {
        Self::new(
            ErrorCode::InspectionNotFound,
            format!("Inspection not found: {}", inspection_id),
        )
        .with_details(ErrorDetails::new().with_entity("inspection", inspection_id.to_string()))
    }

    /// Create a failed precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message.into())
    }

    /// Create a storage object not found error.
    pub fn object_not_found(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorCode::ObjectNotFound, format!("Object not found: {}", key))
            .with_details(ErrorDetails::new().with_entity("object", &key))
    }

    /// Create a rate limited error.
    pub fn rate_limited(provider: impl Into<String>, retry_after_secs: u64) -> Self {
        let provider_name = provider.into();
        Self::new(
            ErrorCode::AiRateLimited,
            format!("Rate limited by {}: retry after {}s", provider_name, retry_after_secs),
        )
        .with_context("provider", &provider_name)
        .with_details(ErrorDetails::new().with_retry_after(retry_after_secs))
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::AiRateLimited.is_retryable());
        assert!(ErrorCode::DatabaseConnectionFailed.is_retryable());
        assert!(ErrorCode::JobTimeout.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::InspectionNotFound.is_retryable());
        assert!(!ErrorCode::UnknownJobType.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::UnknownJobType.category(), "job");
        assert_eq!(ErrorCode::PreconditionFailed.category(), "domain");
        assert_eq!(ErrorCode::DatabaseQueryFailed.category(), "database");
        assert_eq!(ErrorCode::ObjectNotFound.category(), "storage");
        assert_eq!(ErrorCode::AiTimeout.category(), "external_service");
    }

    #[test]
    fn test_error_creation() {
        let error = InspectorError::inspection_not_found(uuid::Uuid::new_v4());
        assert_eq!(error.code(), ErrorCode::InspectionNotFound);
        assert!(!error.is_retryable());
        assert_eq!(error.details().entity_type.as_deref(), Some("inspection"));
    }

    #[test]
    fn test_error_context() {
        let error = InspectorError::new(ErrorCode::ValidationError, "Invalid input")
            .with_context("field", "job_type")
            .with_context("reason", "empty");

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("reason"));
    }

    #[test]
    fn test_error_context_trait() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let err = io.with_error_code(ErrorCode::StorageError).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageError);
        assert!(err.user_message().contains("disk gone"));

        let missing: Option<u32> = None;
        let err = missing.context("image row missing").unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_io_not_found_maps_to_object_not_found() {
        let err = InspectorError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert_eq!(err.code(), ErrorCode::ObjectNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ValidationError),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::AiRateLimited),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = InspectorError::with_internal(
            ErrorCode::DatabaseError,
            "Database connection failed",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Database connection failed"));
        assert!(display.contains("Connection refused"));
    }
}
