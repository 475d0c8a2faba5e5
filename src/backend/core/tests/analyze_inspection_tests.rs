//! Tests for the `analyze_inspection` handler with in-memory collaborators.
//!
//! Tests cover:
//! - Mixed per-image success and failure
//! - Transient storage outages surfacing as job retries
//! - End-to-end processing through the worker pool
//! - Bounded fan-out for small and large inspections
//! - Idempotent re-runs
//! - Permanent rejections (owner, status, payload)
//! - Regulation linking by cited number and by full-text fallback
//! - Cancellation

use async_trait::async_trait;
use inspector_core::ai::{
    AiError, AnalysisContext, Confidence, DetectedViolation, ImageAnalysis, ImageAnalyzer,
    Severity, Usage,
};
use inspector_core::config::JobDefaults;
use inspector_core::error::InspectorError;
use inspector_core::handlers::{
    AnalyzeInspectionHandler, AnalyzeInspectionPayload, ANALYZE_INSPECTION, MAX_CONCURRENT_ANALYSES,
};
use inspector_core::inspections::{
    ImageAnalysisStatus, InMemoryInspectionRepository, Inspection, InspectionImage,
    InspectionRepository, InspectionStatus, Regulation,
};
use inspector_core::jobs::{
    EnqueueOptions, HandlerRegistry, InMemoryJobStore, Job, JobContext, JobEnqueuer, JobHandler,
    JobOutcome, JobPriority, JobStatus, JobStore, WorkerConfig, WorkerPool,
};
use inspector_core::storage::{InMemoryStorage, ObjectStorage, PutOptions, StoredObject};
use inspector_core::ErrorCode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Test Fixtures
// ============================================================================

const BAD_IMAGE: &[u8] = b"not-an-image";

/// Analyzer that rejects [`BAD_IMAGE`] and tracks peak concurrency.
struct MockAnalyzer {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    findings: Mutex<Vec<DetectedViolation>>,
}

impl MockAnalyzer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            findings: Mutex::new(Vec::new()),
        }
    }

    fn with_findings(self, findings: Vec<DetectedViolation>) -> Self {
        *self.findings.lock() = findings;
        self
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageAnalyzer for MockAnalyzer {
    async fn analyze_image(
        &self,
        image: &[u8],
        _content_type: &str,
        _context: &AnalysisContext,
        cancel: &CancellationToken,
    ) -> Result<ImageAnalysis, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AiError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {
                if image == BAD_IMAGE {
                    Err(AiError::InvalidImage("Could not process image".to_string()))
                } else {
                    Ok(ImageAnalysis {
                        violations: self.findings.lock().clone(),
                        observations: "Scaffold on east side".to_string(),
                        notes: None,
                        usage: Usage {
                            input_tokens: 1200,
                            output_tokens: 300,
                        },
                        cost: 0.0081,
                        model: "mock".to_string(),
                    })
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Storage whose downloads fail with a transient error while `down` is set.
struct FlakyStorage {
    inner: Arc<InMemoryStorage>,
    down: AtomicBool,
}

#[async_trait]
impl ObjectStorage for FlakyStorage {
    async fn get(&self, key: &str) -> inspector_core::Result<StoredObject> {
        if self.down.load(Ordering::SeqCst) {
            return Err(InspectorError::new(ErrorCode::StorageError, "object store unreachable"));
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, options: PutOptions) -> inspector_core::Result<()> {
        self.inner.put(key, bytes, options).await
    }

    async fn url(&self, key: &str, ttl: Duration) -> inspector_core::Result<String> {
        self.inner.url(key, ttl).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

struct Fixture {
    repo: Arc<InMemoryInspectionRepository>,
    storage: Arc<InMemoryStorage>,
    analyzer: Arc<MockAnalyzer>,
    handler: AnalyzeInspectionHandler,
    inspection: Inspection,
}

impl Fixture {
    fn new(analyzer: MockAnalyzer) -> Self {
        let repo = Arc::new(InMemoryInspectionRepository::new());
        let storage = Arc::new(InMemoryStorage::new());
        let analyzer = Arc::new(analyzer);
        let handler = AnalyzeInspectionHandler::new(repo.clone(), storage.clone(), analyzer.clone());

        let inspection = Inspection::new(Uuid::new_v4(), "Harbor Street site walk");
        repo.insert_inspection(inspection.clone());

        Self {
            repo,
            storage,
            analyzer,
            handler,
            inspection,
        }
    }

    async fn add_image(&self, index: usize, bytes: &[u8]) -> InspectionImage {
        let key = format!("inspections/{}/{:03}.jpg", self.inspection.id, index);
        self.storage
            .put(&key, bytes.to_vec(), PutOptions::with_content_type("image/jpeg"))
            .await
            .unwrap();
        let image = InspectionImage::new(self.inspection.id, key, "image/jpeg");
        self.repo.insert_image(image.clone());
        image
    }

    fn payload(&self) -> AnalyzeInspectionPayload {
        AnalyzeInspectionPayload {
            inspection_id: self.inspection.id,
            user_id: self.inspection.user_id,
        }
    }

    async fn status(&self) -> InspectionStatus {
        self.repo
            .get_inspection(self.inspection.id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn images_with(&self, status: ImageAnalysisStatus) -> Vec<InspectionImage> {
        self.repo
            .list_images(self.inspection.id, Some(status))
            .await
            .unwrap()
    }
}

fn job_context(attempt: i32) -> JobContext {
    let mut job = Job::new(
        "analyze_inspection",
        Vec::new(),
        JobPriority::Normal.value(),
        3,
        chrono::Utc::now(),
    );
    job.attempts = attempt;
    JobContext::new(&job, CancellationToken::new())
}

fn finding(description: &str, numbers: &[&str]) -> DetectedViolation {
    DetectedViolation {
        description: description.to_string(),
        location: "east elevation".to_string(),
        bounding_box: None,
        confidence: Confidence::High,
        category: "fall_protection".to_string(),
        severity: Severity::Critical,
        regulation_numbers: numbers.iter().map(|n| n.to_string()).collect(),
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn test_partial_failures_still_reach_review() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::from_millis(5)));
    for i in 0..5 {
        let bytes: &[u8] = if i == 1 || i == 3 { BAD_IMAGE } else { b"jpeg" };
        fixture.add_image(i, bytes).await;
    }

    let summary = fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 2);
    assert_eq!(fixture.status().await, InspectionStatus::Review);

    let completed = fixture.images_with(ImageAnalysisStatus::Completed).await;
    assert_eq!(completed.len(), 3);
    for image in &completed {
        assert_eq!(image.tokens_used, Some(1500));
        assert!(image.analysis_cost.unwrap() > 0.0);
        assert!(image.analyzed_at.is_some());
    }

    let failed = fixture.images_with(ImageAnalysisStatus::Failed).await;
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|image| image.analysis_error.is_some()));
}

#[tokio::test]
async fn test_every_image_failing_still_succeeds() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    fixture.add_image(0, BAD_IMAGE).await;
    fixture.add_image(1, BAD_IMAGE).await;

    let summary = fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(fixture.status().await, InspectionStatus::Review);
}

#[tokio::test]
async fn test_missing_object_fails_only_that_image() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    fixture.add_image(0, b"jpeg").await;
    let orphan = InspectionImage::new(fixture.inspection.id, "inspections/missing.jpg", "image/jpeg");
    fixture.repo.insert_image(orphan.clone());

    let summary = fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    let orphan = fixture.repo.image(orphan.id).unwrap();
    assert_eq!(orphan.analysis_status, ImageAnalysisStatus::Failed);
    assert_eq!(fixture.analyzer.calls(), 1);
}

#[tokio::test]
async fn test_storage_outage_retries_job_and_resumes_images() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    fixture.add_image(0, b"jpeg").await;
    fixture.add_image(1, b"jpeg").await;
    let storage = Arc::new(FlakyStorage {
        inner: fixture.storage.clone(),
        down: AtomicBool::new(true),
    });
    let handler = AnalyzeInspectionHandler::new(fixture.repo.clone(), storage.clone(), fixture.analyzer.clone());
    let payload = serde_json::to_vec(&fixture.payload()).unwrap();

    let error = handler.handle(&job_context(1), &payload).await.unwrap_err();
    assert!(!error.is_permanent());
    assert!(error.to_string().contains("object store unreachable"));
    assert!(fixture.images_with(ImageAnalysisStatus::Failed).await.is_empty());
    assert_eq!(fixture.images_with(ImageAnalysisStatus::Analyzing).await.len(), 2);
    assert_eq!(fixture.analyzer.calls(), 0);
    assert_eq!(fixture.status().await, InspectionStatus::Analyzing);

    storage.down.store(false, Ordering::SeqCst);
    handler.handle(&job_context(2), &payload).await.unwrap();

    assert_eq!(fixture.images_with(ImageAnalysisStatus::Completed).await.len(), 2);
    assert_eq!(fixture.analyzer.calls(), 2);
    assert_eq!(fixture.status().await, InspectionStatus::Review);
}

#[tokio::test]
async fn test_no_images_goes_straight_to_review() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));

    let summary = fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();

    assert_eq!(summary.total(), 0);
    assert_eq!(fixture.status().await, InspectionStatus::Review);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_fan_out_never_exceeds_limit() {
    let k = MAX_CONCURRENT_ANALYSES;
    for count in [0, 1, k, k + 1, 10 * k] {
        let fixture = Fixture::new(MockAnalyzer::new(Duration::from_millis(15)));
        for i in 0..count {
            fixture.add_image(i, b"jpeg").await;
        }

        let summary = fixture
            .handler
            .analyze(&job_context(1), &fixture.payload())
            .await
            .unwrap();

        assert_eq!(summary.succeeded as usize, count);
        assert!(fixture.analyzer.peak() <= k, "peak {} for {} images", fixture.analyzer.peak(), count);
        assert_eq!(fixture.analyzer.peak(), count.min(k));
    }
}

#[tokio::test]
async fn test_cancellation_aborts_fan_out() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::from_secs(30)));
    for i in 0..6 {
        fixture.add_image(i, b"jpeg").await;
    }

    let ctx = job_context(1);
    let token = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let error = fixture
        .handler
        .analyze(&ctx, &fixture.payload())
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::JobTimeout);
    assert!(error.is_retryable());
    assert_eq!(fixture.status().await, InspectionStatus::Analyzing);
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn test_rerun_skips_analyzed_images() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    fixture.add_image(0, b"jpeg").await;
    fixture.add_image(1, b"jpeg").await;

    fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();
    assert_eq!(fixture.analyzer.calls(), 2);

    let summary = fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();
    assert_eq!(summary.total(), 0);
    assert_eq!(fixture.analyzer.calls(), 2);
    assert_eq!(fixture.status().await, InspectionStatus::Review);
}

#[tokio::test]
async fn test_retry_resumes_images_left_analyzing() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    let stuck = fixture.add_image(0, b"jpeg").await;
    fixture.add_image(1, b"jpeg").await;
    fixture.repo.mark_image_analyzing(stuck.id).await.unwrap();

    let summary = fixture
        .handler
        .analyze(&job_context(2), &fixture.payload())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(
        fixture.repo.image(stuck.id).unwrap().analysis_status,
        ImageAnalysisStatus::Completed
    );
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_wrong_owner_is_permanent() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    fixture.add_image(0, b"jpeg").await;
    let payload = serde_json::to_vec(&AnalyzeInspectionPayload {
        inspection_id: fixture.inspection.id,
        user_id: Uuid::new_v4(),
    })
    .unwrap();

    let error = fixture.handler.handle(&job_context(1), &payload).await.unwrap_err();
    assert!(error.is_permanent());
    assert_eq!(fixture.analyzer.calls(), 0);
    assert_eq!(fixture.status().await, InspectionStatus::Draft);
}

#[tokio::test]
async fn test_completed_inspection_is_permanent() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    fixture
        .repo
        .update_inspection_status(fixture.inspection.id, InspectionStatus::Completed)
        .await
        .unwrap();
    let payload = serde_json::to_vec(&fixture.payload()).unwrap();

    let error = fixture.handler.handle(&job_context(1), &payload).await.unwrap_err();
    assert!(error.is_permanent());
    assert_eq!(fixture.status().await, InspectionStatus::Completed);
}

#[tokio::test]
async fn test_unknown_inspection_is_permanent() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));
    let payload = serde_json::to_vec(&AnalyzeInspectionPayload {
        inspection_id: Uuid::new_v4(),
        user_id: fixture.inspection.user_id,
    })
    .unwrap();

    let error = fixture.handler.handle(&job_context(1), &payload).await.unwrap_err();
    assert!(error.is_permanent());
}

#[tokio::test]
async fn test_malformed_payload_is_permanent() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::ZERO));

    let error = fixture
        .handler
        .handle(&job_context(1), br#"{"inspectionId": 42}"#)
        .await
        .unwrap_err();
    assert!(error.is_permanent());
}

// ============================================================================
// Regulation Linking
// ============================================================================

#[tokio::test]
async fn test_cited_numbers_link_regulations() {
    let analyzer = MockAnalyzer::new(Duration::ZERO).with_findings(vec![finding(
        "Open edge without guardrail",
        &["29 CFR 1926.501 (b)(1)", "unknown 9999"],
    )]);
    let fixture = Fixture::new(analyzer);
    let regulation = Regulation::new(
        "1926.501(b)(1)",
        "Unprotected sides and edges",
        "Each employee on a walking/working surface with an unprotected side or edge...",
    );
    fixture.repo.insert_regulation(regulation.clone());
    fixture.add_image(0, b"jpeg").await;

    fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();

    let violations = fixture.repo.list_violations(fixture.inspection.id).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].violation.severity, Severity::Critical);
    assert_eq!(
        fixture.repo.linked_regulations(violations[0].violation.id),
        vec![regulation.id]
    );
}

#[tokio::test]
async fn test_full_text_fallback_links_regulations() {
    let analyzer = MockAnalyzer::new(Duration::ZERO).with_findings(vec![finding(
        "Ladder missing side rails extension",
        &[],
    )]);
    let fixture = Fixture::new(analyzer);
    let ladders = Regulation::new("1926.1053", "Ladders", "Ladder side rails shall extend three feet");
    let noise = Regulation::new("1926.100", "Head protection", "Hard hats required");
    fixture.repo.insert_regulation(ladders.clone());
    fixture.repo.insert_regulation(noise);
    fixture.add_image(0, b"jpeg").await;

    fixture
        .handler
        .analyze(&job_context(1), &fixture.payload())
        .await
        .unwrap();

    let violations = fixture.repo.list_violations(fixture.inspection.id).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].regulations, vec![ladders]);
}

// ============================================================================
// Through the Worker Pool
// ============================================================================

#[tokio::test]
async fn test_worker_completes_analysis_job_with_partial_failures() {
    let fixture = Fixture::new(MockAnalyzer::new(Duration::from_millis(5)));
    for i in 0..5 {
        let bytes: &[u8] = if i == 1 || i == 3 { BAD_IMAGE } else { b"jpeg" };
        fixture.add_image(i, bytes).await;
    }

    let store = Arc::new(InMemoryJobStore::new());
    let handler = AnalyzeInspectionHandler::new(
        fixture.repo.clone(),
        fixture.storage.clone(),
        fixture.analyzer.clone(),
    );
    let registry = HandlerRegistry::builder().register(Arc::new(handler)).build();
    let pool = WorkerPool::new(store.clone(), Arc::new(registry), WorkerConfig::default());

    let job = JobEnqueuer::new(store.clone(), JobDefaults::default())
        .enqueue(ANALYZE_INSPECTION, &fixture.payload(), EnqueueOptions::new())
        .await
        .unwrap();

    assert_eq!(pool.process_next().await.unwrap(), Some(JobOutcome::Completed));

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempts, 1);
    assert!(stored.error_message.is_none());

    assert_eq!(fixture.status().await, InspectionStatus::Review);
    assert_eq!(fixture.images_with(ImageAnalysisStatus::Completed).await.len(), 3);
    assert_eq!(fixture.images_with(ImageAnalysisStatus::Failed).await.len(), 2);
}
