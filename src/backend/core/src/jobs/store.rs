//! Durable job storage with atomic leasing.
//!
//! Two backends implement [`JobStore`]:
//!
//! - [`PgJobStore`]: PostgreSQL, leasing with `FOR UPDATE SKIP LOCKED`
//! - [`InMemoryJobStore`]: mutex-guarded map for tests and local runs
//!
//! Status transitions out of `running` are guarded: completing, failing or
//! requeueing a job that is no longer `running` (for example because
//! recovery reclaimed it) is rejected with `InvalidStateTransition`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{Job, JobId, JobStatus};
use crate::error::{ErrorCode, InspectorError, Result};

/// Trait for job store backends.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job row.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Atomically claim the next eligible job, marking it `running`,
    /// stamping `started_at` and incrementing `attempts`.
    ///
    /// Eligible means `pending` with `scheduled_at <= now`, ordered by
    /// priority descending then `scheduled_at` ascending.
    async fn lease_next(&self) -> Result<Option<Job>>;

    /// `running` -> `completed`.
    async fn mark_completed(&self, id: JobId) -> Result<()>;

    /// `running` -> `failed`, recording the error message.
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<()>;

    /// `running` -> `pending` with a new `scheduled_at`, recording the error message.
    async fn retry(&self, id: JobId, error: &str, scheduled_at: DateTime<Utc>) -> Result<()>;

    /// Reset `running` jobs started more than `threshold` ago to `pending`.
    /// Attempts are preserved. Returns the number of reclaimed jobs.
    async fn recover_stale(&self, threshold: Duration) -> Result<u64>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Most recently created jobs first, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>>;

    /// Backend name used in logs.
    fn backend_name(&self) -> &'static str;
}

fn stale_cutoff(threshold: Duration) -> Result<DateTime<Utc>> {
    let threshold = chrono::Duration::from_std(threshold).map_err(|e| {
        InspectorError::new(ErrorCode::InvalidConfiguration, "Stale job threshold out of range")
            .with_source(e)
    })?;
    Ok(Utc::now() - threshold)
}

fn not_running(id: JobId, operation: &str) -> InspectorError {
    InspectorError::new(
        ErrorCode::InvalidStateTransition,
        format!("Cannot {} job {}: not running", operation, id),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory job store for testing and development.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition<F>(&self, id: JobId, operation: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| InspectorError::job_not_found(id.0))?;
        if job.status != JobStatus::Running {
            return Err(not_running(id, operation));
        }
        apply(job);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(InspectorError::new(
                ErrorCode::DuplicateRecord,
                format!("Job already exists: {}", job.id),
            ));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn lease_next(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();

        let next = jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.scheduled_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| InspectorError::job_not_found(id.0))?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: JobId) -> Result<()> {
        self.transition(id, "complete", |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
        })
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<()> {
        self.transition(id, "fail", |job| {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error_message = Some(error.to_string());
        })
    }

    async fn retry(&self, id: JobId, error: &str, scheduled_at: DateTime<Utc>) -> Result<()> {
        self.transition(id, "retry", |job| {
            job.status = JobStatus::Pending;
            job.scheduled_at = scheduled_at;
            job.error_message = Some(error.to_string());
        })
    }

    async fn recover_stale(&self, threshold: Duration) -> Result<u64> {
        let cutoff = stale_cutoff(threshold)?;
        let now = Utc::now();
        let mut jobs = self.jobs.lock();
        let mut recovered = 0;

        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.started_at.map_or(false, |started| started < cutoff);
            if stale {
                job.status = JobStatus::Pending;
                job.scheduled_at = now;
                job.updated_at = now;
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock();
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL Backend
// ═══════════════════════════════════════════════════════════════════════════════

const JOB_COLUMNS: &str = "id, job_type, payload, status, priority, scheduled_at, attempts, \
     max_attempts, started_at, completed_at, error_message, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: Vec<u8>,
    status: String,
    priority: i32,
    scheduled_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = InspectorError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: JobId(row.id),
            job_type: row.job_type,
            payload: row.payload,
            status: row.status.parse()?,
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn ensure_transitioned(rows_affected: u64, id: JobId, operation: &str) -> Result<()> {
        if rows_affected == 0 {
            return Err(not_running(id, operation));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, payload, status, priority, scheduled_at,
                              attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lease_next(&self) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'pending'
              AND scheduled_at <= NOW()
            ORDER BY priority DESC, scheduled_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            // Nothing eligible; dropping the transaction rolls it back
            return Ok(None);
        };

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = NOW(),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(Job::try_from(row)?))
    }

    async fn mark_completed(&self, id: JobId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Self::ensure_transitioned(result.rows_affected(), id, "complete")
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', completed_at = NOW(), error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Self::ensure_transitioned(result.rows_affected(), id, "fail")
    }

    async fn retry(&self, id: JobId, error: &str, scheduled_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', scheduled_at = $2, error_message = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(scheduled_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Self::ensure_transitioned(result.rows_affected(), id, "retry")
    }

    async fn recover_stale(&self, threshold: Duration) -> Result<u64> {
        let cutoff = stale_cutoff(threshold)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', scheduled_at = NOW(), updated_at = NOW()
            WHERE status = 'running' AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
