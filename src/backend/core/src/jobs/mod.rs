//! Durable background job system.
//!
//! This module provides:
//!
//! - **Job Definitions**: Job rows, statuses, permanent/transient errors
//! - **Store**: PostgreSQL (`SKIP LOCKED` leasing) and in-memory backends
//! - **Enqueuer**: Typed payloads to `pending` rows with configured defaults
//! - **Handlers**: Immutable registry keyed by job type
//! - **Worker Pool**: Polling loops with per-job timeout and backoff retries
//! - **Recovery**: Startup and periodic reclamation of orphaned jobs
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Enqueuer   │───▶│   JobStore   │◀───│ WorkerPool   │───▶│   Handler    │
//! │ (typed JSON) │    │ (jobs table) │    │ lease/resolve│    │  Registry    │
//! └──────────────┘    └──────────────┘    └──────────────┘    └──────────────┘
//!                            ▲
//!                            │ recover_stale
//!                     ┌──────────────┐
//!                     │   Recovery   │
//!                     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
//! let registry = HandlerRegistry::builder()
//!     .register(Arc::new(MyHandler))
//!     .build();
//!
//! let pool = WorkerPool::new(store.clone(), Arc::new(registry), WorkerConfig::default());
//! let handle = pool.start().await?;
//!
//! JobEnqueuer::new(store, JobDefaults::default())
//!     .enqueue("my_job", &payload, EnqueueOptions::new())
//!     .await?;
//!
//! handle.stop().await;
//! ```

pub mod enqueue;
pub mod handler;
pub mod job;
pub mod recovery;
pub mod store;
pub mod worker;

pub use enqueue::{EnqueueOptions, JobEnqueuer};
pub use handler::{HandlerRegistry, HandlerRegistryBuilder, JobHandler};
pub use job::{
    BoxError, ExponentialBackoff, Job, JobContext, JobError, JobId, JobPriority, JobResult,
    JobStatus,
};
pub use recovery::{recover_stale_jobs, spawn_periodic_recovery};
pub use store::{InMemoryJobStore, JobStore, PgJobStore};
pub use worker::{JobOutcome, WorkerConfig, WorkerHandle, WorkerPool, WorkerState, WorkerStats};
