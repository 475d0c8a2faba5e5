#![allow(clippy::result_large_err)]
//! # Inspector Core
//!
//! Durable background-job engine for inspection photo analysis and report
//! generation.
//!
//! ## Architecture
//!
//! - **Jobs**: PostgreSQL job store with `SKIP LOCKED` leasing, enqueuer,
//!   handler registry, worker pool with timeouts and backoff retries, and
//!   stale-job recovery
//! - **Handlers**: `analyze_inspection` (bounded fan-out of AI calls) and
//!   `generate_report` (external document rendering)
//! - **AI**: Retrying client for a rate-limited image-analysis API
//! - **Collaborators**: Object storage, repositories, document generator, mailer
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod ai;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod inspections;
pub mod jobs;
pub mod notify;
pub mod reports;
pub mod storage;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, InspectorError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::ai::{AiClient, AiConfig, AiError, AnalysisContext, ImageAnalysis, ImageAnalyzer};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, InspectorError, Result};
    pub use crate::handlers::{
        AnalyzeInspectionHandler, AnalyzeInspectionPayload, GenerateReportHandler,
        GenerateReportPayload, ANALYZE_INSPECTION, GENERATE_REPORT,
    };
    pub use crate::inspections::{InspectionRepository, InspectionStatus};
    pub use crate::jobs::{
        EnqueueOptions, HandlerRegistry, Job, JobContext, JobEnqueuer, JobError, JobHandler,
        JobId, JobPriority, JobResult, JobStatus, JobStore, WorkerConfig, WorkerHandle, WorkerPool,
    };
    pub use crate::reports::{DocumentGenerator, ReportFormat, ReportRepository};
    pub use crate::storage::ObjectStorage;
}
