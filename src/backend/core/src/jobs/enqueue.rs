//! Building and persisting jobs from typed payloads.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::{Job, JobStore};
use crate::config::JobDefaults;
use crate::error::{ErrorCode, InspectorError, Result};

/// Per-call overrides. Unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Writes new `pending` jobs to the store.
#[derive(Clone)]
pub struct JobEnqueuer {
    store: Arc<dyn JobStore>,
    defaults: JobDefaults,
}

impl JobEnqueuer {
    pub fn new(store: Arc<dyn JobStore>, defaults: JobDefaults) -> Self {
        Self { store, defaults }
    }

    /// Serialize `payload` as JSON and persist a new job.
    ///
    /// Nothing is written if serialization or validation fails.
    pub async fn enqueue<P>(&self, job_type: &str, payload: &P, options: EnqueueOptions) -> Result<Job>
    where
        P: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(payload).map_err(|e| {
            InspectorError::with_internal(
                ErrorCode::SerializationError,
                format!("Failed to serialize payload for {}", job_type),
                e.to_string(),
            )
        })?;
        self.enqueue_raw(job_type, bytes, options).await
    }

    /// Persist a job whose payload is already encoded.
    pub async fn enqueue_raw(
        &self,
        job_type: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<Job> {
        if job_type.trim().is_empty() {
            return Err(InspectorError::validation("Job type must not be empty"));
        }

        let max_attempts = options.max_attempts.unwrap_or(self.defaults.max_attempts);
        if max_attempts < 1 {
            return Err(InspectorError::validation("max_attempts must be at least 1")
                .with_context("max_attempts", max_attempts));
        }

        let priority = options.priority.unwrap_or(self.defaults.priority);
        let delay = options.delay.unwrap_or(self.defaults.delay);
        let delay = chrono::Duration::from_std(delay).map_err(|e| {
            InspectorError::validation("Enqueue delay out of range").with_source(e)
        })?;

        let job = Job::new(job_type, payload, priority, max_attempts, Utc::now() + delay);
        self.store.insert(&job).await?;

        tracing::debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            scheduled_at = %job.scheduled_at,
            "Job enqueued"
        );

        Ok(job)
    }
}
