//! Job definitions.
//!
//! This module provides the core abstractions shared by the store, the
//! enqueuer and the worker pool:
//!
//! - **Job**: A persisted unit of deferred work
//! - **JobStatus**: Lifecycle states of a job row
//! - **JobError**: Permanent vs transient failure classification
//! - **JobContext**: Context handed to handlers during execution
//! - **ExponentialBackoff**: Retry delay schedule

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorCode, InspectorError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` and a free worker
    Pending,
    /// Leased by a worker
    Running,
    /// Handler succeeded
    Completed,
    /// Permanent error or retries exhausted
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = InspectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(InspectorError::new(
                ErrorCode::InvalidInput,
                format!("Unknown job status: {}", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Named priority tiers. Rows store the raw integer, higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Get the numeric value used for queue ordering.
    pub const fn value(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Normal => 100,
            Self::High => 200,
            Self::Critical => 300,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl From<JobPriority> for i32 {
    fn from(priority: JobPriority) -> Self {
        priority.value()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted unit of deferred work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    /// Opaque bytes, JSON by convention; only the handler interprets them
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `pending` job with zero attempts.
    pub fn new(
        job_type: impl Into<String>,
        payload: Vec<u8>,
        priority: i32,
        max_attempts: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            priority,
            scheduled_at,
            attempts: 0,
            max_attempts,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether another attempt is allowed after a transient failure.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Payload decoded as JSON, for display.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a handler. The variant decides what the worker does next.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Retrying can never succeed; the job fails immediately.
    #[error("{0}")]
    Permanent(#[source] BoxError),

    /// A retry might succeed; the job is requeued until `max_attempts`.
    #[error("{0}")]
    Transient(#[source] BoxError),
}

impl JobError {
    pub fn permanent(error: impl Into<BoxError>) -> Self {
        Self::Permanent(error.into())
    }

    pub fn transient(error: impl Into<BoxError>) -> Self {
        Self::Transient(error.into())
    }

    /// Transient error for a handler that overran its deadline.
    pub fn timeout(limit: Duration) -> Self {
        Self::transient(InspectorError::new(
            ErrorCode::JobTimeout,
            format!("Job exceeded timeout of {:?}", limit),
        ))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Permanent(_) => "permanent",
            Self::Transient(_) => "transient",
        }
    }
}

impl From<InspectorError> for JobError {
    fn from(error: InspectorError) -> Self {
        if error.is_retryable() {
            Self::Transient(Box::new(error))
        } else {
            Self::Permanent(Box::new(error))
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Exponential delay schedule: `base * 2^(attempt-1)`, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base, max: None }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Delay before the retry following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX);

        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    job_type: String,
    attempt: i32,
    max_attempts: i32,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(job: &Job, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Fires when the job's deadline passes. Handlers must stop starting new work.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let uuid = Uuid::new_v4();
        assert_eq!(JobId::from(uuid).0, uuid);
    }

    #[test]
    fn test_job_status() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());

        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("dead".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High.value() > JobPriority::Normal.value());
        assert_eq!(i32::from(JobPriority::default()), 100);
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new("analyze_inspection", b"{}".to_vec(), 100, 3, Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.can_retry());
        assert_eq!(job.payload_json(), Some(serde_json::json!({})));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_capped() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(30))
            .with_max(Duration::from_secs(300));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(300));
        assert_eq!(backoff.delay_for_attempt(64), Duration::from_secs(300));
    }

    #[test]
    fn test_job_error_from_inspector_error() {
        let transient: JobError =
            InspectorError::new(ErrorCode::DatabaseConnectionFailed, "db down").into();
        assert!(!transient.is_permanent());

        let permanent: JobError = InspectorError::inspection_not_found(Uuid::new_v4()).into();
        assert!(permanent.is_permanent());
        assert!(permanent.to_string().contains("Inspection not found"));
    }

    #[test]
    fn test_job_error_timeout_is_transient() {
        let error = JobError::timeout(Duration::from_secs(5));
        assert_eq!(error.kind(), "transient");
    }

    #[test]
    fn test_job_context() {
        let mut job = Job::new("generate_report", Vec::new(), 100, 5, Utc::now());
        job.attempts = 2;
        let token = CancellationToken::new();
        let ctx = JobContext::new(&job, token.clone());

        assert_eq!(ctx.job_id(), job.id);
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(ctx.max_attempts(), 5);
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
