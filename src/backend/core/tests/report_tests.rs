//! Tests for the `generate_report` handler, alone and through the worker pool.
//!
//! Tests cover:
//! - Successful generation: storage key, checksum, record, notification
//! - Status preconditions enforced before any side effect
//! - Renderer failures retried as transient
//! - End-to-end processing through the worker pool

use async_trait::async_trait;
use inspector_core::ai::{BoundingBox, Confidence, Severity};
use inspector_core::config::JobDefaults;
use inspector_core::error::{ErrorCode, InspectorError, Result};
use inspector_core::handlers::{GenerateReportHandler, GenerateReportPayload, GENERATE_REPORT};
use inspector_core::inspections::{
    InMemoryInspectionRepository, Inspection, InspectionImage, InspectionRepository,
    InspectionStatus, NewViolation,
};
use inspector_core::jobs::{
    EnqueueOptions, HandlerRegistry, InMemoryJobStore, Job, JobContext, JobEnqueuer, JobOutcome,
    JobPriority, JobStatus, JobStore, WorkerConfig, WorkerPool,
};
use inspector_core::notify::LogMailer;
use inspector_core::reports::{
    DocumentGenerator, InMemoryReportRepository, ReportData, ReportFormat, ReportRepository,
};
use inspector_core::storage::{InMemoryStorage, ObjectStorage, PutOptions};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Renders a short summary and remembers what it was given.
#[derive(Default)]
struct RecordingGenerator {
    rendered: Mutex<Vec<ReportData>>,
    fail: bool,
}

#[async_trait]
impl DocumentGenerator for RecordingGenerator {
    async fn render(&self, data: &ReportData) -> Result<Vec<u8>> {
        if self.fail {
            return Err(InspectorError::new(ErrorCode::RenderFailed, "renderer crashed"));
        }
        self.rendered.lock().push(data.clone());
        Ok(format!(
            "{} report for {}: {} violations",
            data.format.as_str(),
            data.inspection.name,
            data.severity_counts.total()
        )
        .into_bytes())
    }
}

struct Fixture {
    inspections: Arc<InMemoryInspectionRepository>,
    reports: Arc<InMemoryReportRepository>,
    storage: Arc<InMemoryStorage>,
    generator: Arc<RecordingGenerator>,
    mailer: Arc<LogMailer>,
    inspection: Inspection,
}

impl Fixture {
    async fn new(status: InspectionStatus, generator: RecordingGenerator) -> Self {
        let inspections = Arc::new(InMemoryInspectionRepository::new());
        let storage = Arc::new(InMemoryStorage::new());

        let mut inspection = Inspection::new(Uuid::new_v4(), "Pier 4 rebuild");
        inspection.status = status;
        inspections.insert_inspection(inspection.clone());

        let key = format!("inspections/{}/001.jpg", inspection.id);
        storage
            .put(&key, b"jpeg".to_vec(), PutOptions::with_content_type("image/jpeg"))
            .await
            .unwrap();
        let image = InspectionImage::new(inspection.id, key, "image/jpeg");
        inspections.insert_image(image.clone());
        // Image row whose object was never uploaded
        inspections.insert_image(InspectionImage::new(inspection.id, "inspections/lost.jpg", "image/jpeg"));

        for severity in [Severity::Critical, Severity::Minor, Severity::Minor] {
            inspections
                .insert_violation(NewViolation {
                    inspection_id: inspection.id,
                    image_id: image.id,
                    description: "Missing toe board".to_string(),
                    location: "Deck edge".to_string(),
                    bounding_box: Some(BoundingBox {
                        x: 0.1,
                        y: 0.1,
                        width: 0.2,
                        height: 0.2,
                    }),
                    confidence: Confidence::Medium,
                    category: "fall_protection".to_string(),
                    severity,
                })
                .await
                .unwrap();
        }

        Self {
            inspections,
            reports: Arc::new(InMemoryReportRepository::new()),
            storage,
            generator: Arc::new(generator),
            mailer: Arc::new(LogMailer::new()),
            inspection,
        }
    }

    fn handler(&self) -> GenerateReportHandler {
        GenerateReportHandler::new(
            self.inspections.clone(),
            self.reports.clone(),
            self.storage.clone(),
            self.generator.clone(),
            self.mailer.clone(),
        )
        .with_download_url_ttl(Duration::from_secs(3 * 24 * 3600))
    }

    fn payload(&self, format: ReportFormat, notify_email: Option<&str>) -> GenerateReportPayload {
        GenerateReportPayload {
            inspection_id: self.inspection.id,
            user_id: self.inspection.user_id,
            format,
            notify_email: notify_email.map(str::to_string),
        }
    }
}

fn job_context() -> JobContext {
    let mut job = Job::new(GENERATE_REPORT, Vec::new(), JobPriority::Normal.value(), 3, chrono::Utc::now());
    job.attempts = 1;
    JobContext::new(&job, CancellationToken::new())
}

// ============================================================================
// Generation
// ============================================================================

#[tokio::test]
async fn test_report_stored_with_checksum_and_record() {
    let fixture = Fixture::new(InspectionStatus::Review, RecordingGenerator::default()).await;

    let report = fixture
        .handler()
        .generate(&job_context(), &fixture.payload(ReportFormat::Pdf, None))
        .await
        .unwrap();

    assert_eq!(
        report.storage_key,
        format!("reports/{}/{}.pdf", fixture.inspection.id, report.id)
    );

    let stored = fixture.storage.get(&report.storage_key).await.unwrap();
    assert_eq!(stored.content_type, "application/pdf");
    assert_eq!(stored.bytes.len() as i64, report.size_bytes);
    assert_eq!(report.checksum, hex::encode(Sha256::digest(&stored.bytes)));
    assert_eq!(report.checksum.len(), 64);

    let records = fixture.reports.list_reports(fixture.inspection.id).await.unwrap();
    assert_eq!(records, vec![report]);
}

#[tokio::test]
async fn test_report_data_collects_images_and_severities() {
    let fixture = Fixture::new(InspectionStatus::Completed, RecordingGenerator::default()).await;

    fixture
        .handler()
        .generate(&job_context(), &fixture.payload(ReportFormat::Docx, None))
        .await
        .unwrap();

    let rendered = fixture.generator.rendered.lock();
    assert_eq!(rendered.len(), 1);
    let data = &rendered[0];
    assert_eq!(data.format, ReportFormat::Docx);
    assert_eq!(data.images.len(), 2);
    assert_eq!(data.images.iter().filter(|i| i.url.is_some()).count(), 1);
    assert_eq!(data.violations.len(), 3);
    assert_eq!(data.severity_counts.critical, 1);
    assert_eq!(data.severity_counts.major, 0);
    assert_eq!(data.severity_counts.minor, 2);
}

#[tokio::test]
async fn test_notification_sent_with_download_link() {
    let fixture = Fixture::new(InspectionStatus::Review, RecordingGenerator::default()).await;

    let report = fixture
        .handler()
        .generate(
            &job_context(),
            &fixture.payload(ReportFormat::Pdf, Some("owner@example.com")),
        )
        .await
        .unwrap();

    let sent = fixture.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "owner@example.com");
    assert!(sent[0].subject.contains("Pier 4 rebuild"));
    assert!(sent[0].body.contains(&report.storage_key));
    assert!(sent[0].body.contains("3 days"));
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_job() {
    let fixture = Fixture::new(InspectionStatus::Review, RecordingGenerator::default()).await;

    let result = fixture
        .handler()
        .generate(&job_context(), &fixture.payload(ReportFormat::Pdf, Some("not-an-address")))
        .await;

    assert!(result.is_ok());
    assert!(fixture.mailer.sent().is_empty());
    assert_eq!(fixture.reports.len(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_draft_inspection_rejected_permanently() {
    let fixture = Fixture::new(InspectionStatus::Draft, RecordingGenerator::default()).await;

    let error = fixture
        .handler()
        .generate(&job_context(), &fixture.payload(ReportFormat::Pdf, None))
        .await
        .unwrap_err();

    assert!(error.is_permanent());
    assert!(error.to_string().contains("review or completed"));
    assert!(fixture.reports.is_empty());
    assert!(fixture.generator.rendered.lock().is_empty());
}

#[tokio::test]
async fn test_renderer_failure_is_transient() {
    let generator = RecordingGenerator {
        fail: true,
        ..Default::default()
    };
    let fixture = Fixture::new(InspectionStatus::Review, generator).await;
    let objects_before = fixture.storage.len();

    let error = fixture
        .handler()
        .generate(&job_context(), &fixture.payload(ReportFormat::Pdf, None))
        .await
        .unwrap_err();

    assert!(!error.is_permanent());
    assert!(fixture.reports.is_empty());
    assert_eq!(fixture.storage.len(), objects_before);
}

// ============================================================================
// Through the Worker Pool
// ============================================================================

async fn run_through_pool(fixture: &Fixture, format: ReportFormat) -> (Arc<InMemoryJobStore>, JobOutcome, Uuid) {
    let store = Arc::new(InMemoryJobStore::new());
    let registry = HandlerRegistry::builder()
        .register(Arc::new(fixture.handler()))
        .build();
    let pool = WorkerPool::new(
        store.clone(),
        Arc::new(registry),
        WorkerConfig {
            retry_base_delay: Duration::ZERO,
            retry_max_delay: Duration::ZERO,
            ..Default::default()
        },
    );

    let job = JobEnqueuer::new(store.clone(), JobDefaults::default())
        .enqueue(GENERATE_REPORT, &fixture.payload(format, None), EnqueueOptions::new())
        .await
        .unwrap();

    let outcome = pool.process_next().await.unwrap().unwrap();
    (store, outcome, job.id.0)
}

#[tokio::test]
async fn test_worker_fails_draft_report_job_without_record() {
    let fixture = Fixture::new(InspectionStatus::Draft, RecordingGenerator::default()).await;

    let (store, outcome, job_id) = run_through_pool(&fixture, ReportFormat::Pdf).await;

    assert_eq!(outcome, JobOutcome::Failed { permanent: true });
    let job = store
        .get(inspector_core::jobs::JobId(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error_message.unwrap().contains("current: draft"));
    assert!(fixture.reports.is_empty());
}

#[tokio::test]
async fn test_worker_completes_report_job() {
    let fixture = Fixture::new(InspectionStatus::Review, RecordingGenerator::default()).await;

    let (store, outcome, job_id) = run_through_pool(&fixture, ReportFormat::Docx).await;

    assert_eq!(outcome, JobOutcome::Completed);
    let job = store
        .get(inspector_core::jobs::JobId(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(fixture.reports.len(), 1);
}
