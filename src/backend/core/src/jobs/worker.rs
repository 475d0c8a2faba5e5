//! Worker pool: independent polling loops that lease, execute and resolve jobs.
//!
//! Each loop runs the cycle **Lease → Execute → Resolve**:
//!
//! 1. Lease the next eligible job (a short store transaction).
//! 2. Dispatch it to its handler under `job_timeout`, outside any transaction.
//! 3. Record completion, failure or a backoff retry.
//!
//! After a successful lease the loop polls again immediately; otherwise it
//! sleeps for `poll_interval`. Stopping the pool cancels the loops, never the
//! context of a job that is already executing.

use chrono::Utc;
use futures::FutureExt;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::recovery::{recover_stale_jobs, spawn_periodic_recovery};
use super::{ExponentialBackoff, HandlerRegistry, Job, JobContext, JobError, JobResult, JobStore};
use crate::error::{InspectorError, Result};
use crate::telemetry::metrics::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the worker pool.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of independent polling loops
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sleep between lease attempts when the queue is empty
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Deadline for a single handler execution
    #[serde(default = "default_job_timeout", with = "humantime_serde")]
    pub job_timeout: Duration,

    /// How long `stop()` waits for loops to finish
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// `running` jobs started longer ago than this are presumed orphaned
    #[serde(default = "default_stale_job_threshold", with = "humantime_serde")]
    pub stale_job_threshold: Duration,

    /// Run the stale-job sweep periodically as well as at startup
    #[serde(default, with = "humantime_serde")]
    pub recovery_interval: Option<Duration>,

    /// Backoff after the first transient failure; doubles per attempt
    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,

    #[serde(default = "default_retry_max_delay", with = "humantime_serde")]
    pub retry_max_delay: Duration,

    /// Worker name/identifier
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            job_timeout: default_job_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            stale_job_threshold: default_stale_job_threshold(),
            recovery_interval: None,
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            name: default_name(),
        }
    }
}

impl WorkerConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.retry_base_delay).with_max(self.retry_max_delay)
    }
}

fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_job_timeout() -> Duration { Duration::from_secs(600) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_stale_job_threshold() -> Duration { Duration::from_secs(1800) }
fn default_retry_base_delay() -> Duration { Duration::from_secs(10) }
fn default_retry_max_delay() -> Duration { Duration::from_secs(600) }
fn default_name() -> String { "inspector-worker".to_string() }

// ═══════════════════════════════════════════════════════════════════════════════
// State & Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a polling loop currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Leasing = 1,
    Executing = 2,
    Resolving = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Leasing,
            2 => Self::Executing,
            3 => Self::Resolving,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Relaxed))
    }
}

/// Statistics for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs leased and executed
    pub processed: Arc<AtomicU64>,
    /// Jobs that completed successfully
    pub succeeded: Arc<AtomicU64>,
    /// Jobs requeued after a transient failure
    pub retried: Arc<AtomicU64>,
    /// Jobs marked failed
    pub failed: Arc<AtomicU64>,
    /// Currently executing jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// What the pool did with a leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried { delay: Duration },
    Failed { permanent: bool },
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retried { .. } => "retried",
            Self::Failed { .. } => "failed",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

struct Shared {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    stats: WorkerStats,
}

/// Pool of polling loops sharing one store and one handler registry.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                registry,
                config,
                stats: WorkerStats::new(),
            }),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.shared.stats
    }

    /// Recover stale jobs, then spawn `concurrency` polling loops.
    pub async fn start(&self) -> Result<WorkerHandle> {
        let config = &self.shared.config;
        if config.concurrency == 0 {
            return Err(InspectorError::configuration("worker.concurrency must be at least 1"));
        }
        if config.recovery_interval.is_some() && config.stale_job_threshold <= config.job_timeout {
            // A sweep would otherwise requeue jobs that are still executing.
            return Err(InspectorError::configuration(format!(
                "worker.stale_job_threshold ({:?}) must exceed worker.job_timeout ({:?}) when periodic recovery is enabled",
                config.stale_job_threshold, config.job_timeout
            )));
        }
        if config.stale_job_threshold <= config.job_timeout {
            tracing::warn!(
                stale_job_threshold = ?config.stale_job_threshold,
                job_timeout = ?config.job_timeout,
                "Stale-job threshold does not exceed the job timeout; startup recovery may requeue jobs other workers are still running"
            );
        }

        recover_stale_jobs(self.shared.store.as_ref(), config.stale_job_threshold).await?;

        let shutdown = CancellationToken::new();
        let states: Arc<Vec<StateCell>> =
            Arc::new((0..config.concurrency).map(|_| StateCell::default()).collect());

        let loops = (0..config.concurrency)
            .map(|index| {
                let shared = self.shared.clone();
                let states = states.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { run_loop(shared, states, index, shutdown).await })
            })
            .collect();

        let recovery = config.recovery_interval.map(|interval| {
            spawn_periodic_recovery(
                self.shared.store.clone(),
                config.stale_job_threshold,
                interval,
                shutdown.clone(),
            )
        });

        tracing::info!(
            worker = %config.name,
            concurrency = config.concurrency,
            store = self.shared.store.backend_name(),
            job_types = ?self.shared.registry.job_types(),
            poll_interval = ?config.poll_interval,
            job_timeout = ?config.job_timeout,
            "Job worker started"
        );

        Ok(WorkerHandle {
            shutdown,
            loops,
            recovery,
            states,
            stats: self.shared.stats.clone(),
            shutdown_timeout: config.shutdown_timeout,
            name: config.name.clone(),
        })
    }

    /// Lease and fully process at most one job on the caller's task.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>> {
        let state = StateCell::default();
        process_next(&self.shared, &state).await
    }
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
    states: Arc<Vec<StateCell>>,
    stats: WorkerStats,
    shutdown_timeout: Duration,
    name: String,
}

impl WorkerHandle {
    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Current state of every loop, indexed by loop number.
    pub fn states(&self) -> Vec<WorkerState> {
        self.states.iter().map(StateCell::get).collect()
    }

    /// Signal loops to exit after their current iteration and wait up to
    /// `shutdown_timeout`. Returns `false` if some loops were abandoned.
    pub async fn stop(self) -> bool {
        tracing::info!(worker = %self.name, "Worker shutting down");
        self.shutdown.cancel();

        let mut handles = self.loops;
        handles.extend(self.recovery);

        match tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                tracing::info!(worker = %self.name, "Worker stopped");
                true
            }
            Err(_) => {
                // Dropped JoinHandles detach the remaining tasks
                tracing::warn!(
                    worker = %self.name,
                    timeout = ?self.shutdown_timeout,
                    active = self.stats.active(),
                    "Shutdown timeout elapsed, abandoning in-flight jobs"
                );
                false
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Loop Internals
// ═══════════════════════════════════════════════════════════════════════════════

async fn run_loop(
    shared: Arc<Shared>,
    states: Arc<Vec<StateCell>>,
    index: usize,
    shutdown: CancellationToken,
) {
    let state = &states[index];
    tracing::debug!(worker = %shared.config.name, loop_index = index, "Polling loop started");

    while !shutdown.is_cancelled() {
        let leased = match process_next(&shared, state).await {
            Ok(outcome) => outcome.is_some(),
            Err(e) => {
                tracing::error!(
                    worker = %shared.config.name,
                    loop_index = index,
                    error = %e,
                    "Worker iteration failed"
                );
                false
            }
        };
        state.set(WorkerState::Idle);

        if leased {
            continue;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
        }
    }

    tracing::debug!(worker = %shared.config.name, loop_index = index, "Polling loop stopped");
}

async fn process_next(shared: &Shared, state: &StateCell) -> Result<Option<JobOutcome>> {
    state.set(WorkerState::Leasing);
    let Some(job) = shared.store.lease_next().await? else {
        state.set(WorkerState::Idle);
        return Ok(None);
    };

    tracing::debug!(
        job_id = %job.id,
        job_type = %job.job_type,
        attempt = job.attempts,
        max_attempts = job.max_attempts,
        "Job leased"
    );

    state.set(WorkerState::Executing);
    shared.stats.processed.fetch_add(1, Ordering::Relaxed);
    shared.stats.active.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = execute(shared, &job).await;
    let elapsed = started.elapsed();
    shared.stats.active.fetch_sub(1, Ordering::Relaxed);

    state.set(WorkerState::Resolving);
    let outcome = resolve(shared, &job, result).await?;

    JobMetrics::record_outcome(&job.job_type, outcome.as_str(), elapsed);
    state.set(WorkerState::Idle);
    Ok(Some(outcome))
}

async fn execute(shared: &Shared, job: &Job) -> JobResult {
    let Some(handler) = shared.registry.get(&job.job_type) else {
        return Err(JobError::permanent(InspectorError::unknown_job_type(&job.job_type)));
    };

    let token = CancellationToken::new();
    let ctx = JobContext::new(job, token.clone());
    let timeout = shared.config.job_timeout;
    let handling = AssertUnwindSafe(handler.handle(&ctx, &job.payload)).catch_unwind();

    tokio::select! {
        result = handling => match result {
            Ok(result) => result,
            Err(_) => Err(JobError::permanent(InspectorError::internal(format!(
                "Handler for {} panicked",
                job.job_type
            )))),
        },
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            Err(JobError::timeout(timeout))
        }
    }
}

async fn resolve(shared: &Shared, job: &Job, result: JobResult) -> Result<JobOutcome> {
    let stats = &shared.stats;

    let error = match result {
        Ok(()) => {
            shared.store.mark_completed(job.id).await?;
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                "Job completed"
            );
            return Ok(JobOutcome::Completed);
        }
        Err(error) => error,
    };

    let message = error.to_string();

    if error.is_permanent() {
        shared.store.mark_failed(job.id, &message).await?;
        stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            error = %message,
            "Job failed permanently"
        );
        return Ok(JobOutcome::Failed { permanent: true });
    }

    if job.can_retry() {
        let delay = shared.config.backoff().delay_for_attempt(job.attempts.max(1) as u32);
        let scheduled_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        shared.store.retry(job.id, &message, scheduled_at).await?;
        stats.retried.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            retry_in = ?delay,
            error = %message,
            "Job failed, scheduled for retry"
        );
        return Ok(JobOutcome::Retried { delay });
    }

    let message = format!("Retries exhausted after {} attempts: {}", job.attempts, message);
    shared.store.mark_failed(job.id, &message).await?;
    stats.failed.fetch_add(1, Ordering::Relaxed);
    tracing::error!(
        job_id = %job.id,
        job_type = %job.job_type,
        attempt = job.attempts,
        error = %message,
        "Job failed, retries exhausted"
    );
    Ok(JobOutcome::Failed { permanent: false })
}
