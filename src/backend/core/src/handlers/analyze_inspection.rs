//! `analyze_inspection`: run every pending photo of an inspection through the
//! AI analyzer, at most [`MAX_CONCURRENT_ANALYSES`] at a time.
//!
//! Each image succeeds or fails on its own once its bytes are downloaded; the
//! job itself fails for problems before that point (bad payload, missing
//! inspection, wrong owner or status, database or storage outages). Images a
//! transient download failure skipped stay unfinished and are picked up again
//! when the job is retried.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ai::{AnalysisContext, DetectedViolation, ImageAnalyzer};
use crate::error::{ErrorCode, InspectorError, Result};
use crate::inspections::{
    ImageAnalysisStatus, Inspection, InspectionImage, InspectionRepository, InspectionStatus,
    NewViolation, Violation,
};
use crate::jobs::{JobContext, JobError, JobHandler, JobResult};
use crate::storage::{ObjectStorage, StoredObject};
use crate::telemetry::metrics::DomainMetrics;

pub const ANALYZE_INSPECTION: &str = "analyze_inspection";

/// Images analyzed concurrently within one job.
pub const MAX_CONCURRENT_ANALYSES: usize = 3;

/// Regulations linked through full-text search when the model cites none we know.
const FALLBACK_REGULATION_LIMIT: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeInspectionPayload {
    pub inspection_id: Uuid,
    pub user_id: Uuid,
}

/// Per-image tally of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub succeeded: u64,
    pub failed: u64,
}

impl AnalysisSummary {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Canonical form of a cited standard number, e.g. `"29 CFR 1926.501 (b)(1)"`
/// becomes `"1926.501(b)(1)"`.
pub fn normalize_regulation_number(raw: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(\d{4})\.(\d+)((?:\s*\(\s*[A-Za-z0-9]+\s*\))*)").ok())
        .as_ref()?;

    let captures = pattern.captures(raw)?;
    let paragraphs: String = captures
        .get(3)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    Some(format!("{}.{}{}", &captures[1], &captures[2], paragraphs))
}

pub struct AnalyzeInspectionHandler {
    inspections: Arc<dyn InspectionRepository>,
    storage: Arc<dyn ObjectStorage>,
    analyzer: Arc<dyn ImageAnalyzer>,
}

impl AnalyzeInspectionHandler {
    pub fn new(
        inspections: Arc<dyn InspectionRepository>,
        storage: Arc<dyn ObjectStorage>,
        analyzer: Arc<dyn ImageAnalyzer>,
    ) -> Self {
        Self {
            inspections,
            storage,
            analyzer,
        }
    }

    async fn load_inspection(&self, payload: &AnalyzeInspectionPayload) -> Result<Inspection> {
        let inspection = self
            .inspections
            .get_inspection(payload.inspection_id)
            .await?
            .ok_or_else(|| InspectorError::inspection_not_found(payload.inspection_id))?;

        if inspection.user_id != payload.user_id {
            return Err(InspectorError::precondition(format!(
                "Inspection {} does not belong to user {}",
                inspection.id, payload.user_id
            )));
        }
        if !inspection.status.accepts_analysis() {
            return Err(InspectorError::precondition(format!(
                "Inspection {} cannot be analyzed in status {}",
                inspection.id, inspection.status
            )));
        }
        Ok(inspection)
    }

    /// Pending images, plus on retries those an aborted attempt left `analyzing`.
    async fn images_to_analyze(&self, ctx: &JobContext, inspection_id: Uuid) -> Result<Vec<InspectionImage>> {
        let mut images = self
            .inspections
            .list_images(inspection_id, Some(ImageAnalysisStatus::Pending))
            .await?;

        if ctx.attempt() > 1 {
            let orphaned = self
                .inspections
                .list_images(inspection_id, Some(ImageAnalysisStatus::Analyzing))
                .await?;
            images.extend(orphaned);
        }
        Ok(images)
    }

    pub async fn analyze(&self, ctx: &JobContext, payload: &AnalyzeInspectionPayload) -> Result<AnalysisSummary> {
        let inspection = self.load_inspection(payload).await?;

        if inspection.status != InspectionStatus::Analyzing {
            self.inspections
                .update_inspection_status(inspection.id, InspectionStatus::Analyzing)
                .await?;
        }

        let images = self.images_to_analyze(ctx, inspection.id).await?;
        tracing::info!(
            job_id = %ctx.job_id(),
            inspection_id = %inspection.id,
            images = images.len(),
            "Analyzing inspection images"
        );

        let summary = self.fan_out(ctx, &inspection, images).await?;

        if summary.total() > 0 && summary.succeeded == 0 {
            tracing::warn!(
                job_id = %ctx.job_id(),
                inspection_id = %inspection.id,
                failed = summary.failed,
                "Every image failed analysis"
            );
        }

        self.inspections
            .update_inspection_status(inspection.id, InspectionStatus::Review)
            .await?;

        tracing::info!(
            job_id = %ctx.job_id(),
            inspection_id = %inspection.id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Inspection analysis finished"
        );
        Ok(summary)
    }

    async fn fan_out(
        &self,
        ctx: &JobContext,
        inspection: &Inspection,
        images: Vec<InspectionImage>,
    ) -> Result<AnalysisSummary> {
        let cancel = ctx.cancellation_token().clone();
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_ANALYSES));
        let mut tasks = JoinSet::new();
        let mut summary = AnalysisSummary::default();
        let mut deferred: Option<InspectorError> = None;

        for image in images {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(inspection.id)),
                permit = semaphore.clone().acquire_owned() => permit.map_err(|_| {
                    InspectorError::internal("Image analysis semaphore closed")
                })?,
            };

            let task = ImageTask {
                inspections: self.inspections.clone(),
                storage: self.storage.clone(),
                analyzer: self.analyzer.clone(),
                inspection_id: inspection.id,
                inspection_name: inspection.name.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(async move {
                let _permit = permit;
                task.run(image).await
            });
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(cancelled(inspection.id));
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok(ImageOutcome::Analyzed)) => summary.succeeded += 1,
                    Some(Ok(ImageOutcome::Failed)) => summary.failed += 1,
                    Some(Ok(ImageOutcome::Deferred(error))) => {
                        deferred.get_or_insert(error);
                    }
                    Some(Err(error)) => {
                        tracing::error!(
                            inspection_id = %inspection.id,
                            error = %error,
                            "Image analysis task aborted"
                        );
                        summary.failed += 1;
                    }
                },
            }
        }

        DomainMetrics::record_images_analyzed(summary.succeeded, summary.failed);

        if let Some(error) = deferred {
            tracing::warn!(
                inspection_id = %inspection.id,
                succeeded = summary.succeeded,
                failed = summary.failed,
                error = %error,
                "Image downloads failed, retrying the job for the remaining images"
            );
            return Err(error);
        }

        Ok(summary)
    }
}

fn cancelled(inspection_id: Uuid) -> InspectorError {
    InspectorError::new(
        ErrorCode::JobTimeout,
        format!("Analysis of inspection {} was cancelled", inspection_id),
    )
}

#[async_trait]
impl JobHandler for AnalyzeInspectionHandler {
    fn job_type(&self) -> &'static str {
        ANALYZE_INSPECTION
    }

    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> JobResult {
        let payload: AnalyzeInspectionPayload = serde_json::from_slice(payload).map_err(|e| {
            JobError::permanent(InspectorError::invalid_payload(ANALYZE_INSPECTION, e.to_string()))
        })?;

        self.analyze(ctx, &payload).await?;
        Ok(())
    }
}

/// How one image fared.
enum ImageOutcome {
    Analyzed,
    /// Failure recorded on the image.
    Failed,
    /// Left unfinished; the error goes to the job.
    Deferred(InspectorError),
}

/// Everything one spawned image analysis needs.
struct ImageTask {
    inspections: Arc<dyn InspectionRepository>,
    storage: Arc<dyn ObjectStorage>,
    analyzer: Arc<dyn ImageAnalyzer>,
    inspection_id: Uuid,
    inspection_name: String,
    cancel: CancellationToken,
}

impl ImageTask {
    async fn run(self, image: InspectionImage) -> ImageOutcome {
        let image_id = image.id;

        let object = match self.download(&image).await {
            Ok(object) => object,
            Err(error) if error.is_retryable() => {
                tracing::warn!(
                    inspection_id = %self.inspection_id,
                    image_id = %image_id,
                    error = %error,
                    "Image download failed, deferring image"
                );
                return ImageOutcome::Deferred(error);
            }
            Err(error) => return self.record_failure(image_id, error).await,
        };

        match self.analyze(&image, object).await {
            Ok(violations) => {
                tracing::debug!(
                    inspection_id = %self.inspection_id,
                    image_id = %image_id,
                    violations,
                    "Image analysis completed"
                );
                ImageOutcome::Analyzed
            }
            Err(error) => self.record_failure(image_id, error).await,
        }
    }

    async fn record_failure(&self, image_id: Uuid, error: InspectorError) -> ImageOutcome {
        tracing::warn!(
            inspection_id = %self.inspection_id,
            image_id = %image_id,
            error = %error,
            "Image analysis failed"
        );
        if let Err(e) = self
            .inspections
            .mark_image_failed(image_id, error.user_message())
            .await
        {
            tracing::error!(image_id = %image_id, error = %e, "Failed to record image failure");
        }
        ImageOutcome::Failed
    }

    async fn download(&self, image: &InspectionImage) -> Result<StoredObject> {
        self.inspections.mark_image_analyzing(image.id).await?;
        self.storage.get(&image.storage_key).await
    }

    async fn analyze(&self, image: &InspectionImage, object: StoredObject) -> Result<usize> {
        let content_type = if image.content_type.is_empty() {
            object.content_type.as_str()
        } else {
            image.content_type.as_str()
        };

        let context = AnalysisContext {
            inspection_id: self.inspection_id,
            inspection_name: self.inspection_name.clone(),
            image_id: image.id,
        };
        let analysis = self
            .analyzer
            .analyze_image(&object.bytes, content_type, &context, &self.cancel)
            .await?;

        for detected in &analysis.violations {
            let violation = self
                .inspections
                .insert_violation(NewViolation::from_detected(self.inspection_id, image.id, detected))
                .await?;
            self.link_regulations(&violation, detected).await;
        }

        let tokens = i64::try_from(analysis.usage.total()).unwrap_or(i64::MAX);
        self.inspections
            .mark_image_completed(image.id, tokens, analysis.cost)
            .await?;

        Ok(analysis.violations.len())
    }

    /// Best effort: failures are logged, never propagated.
    async fn link_regulations(&self, violation: &Violation, detected: &DetectedViolation) {
        match self.try_link_regulations(violation, detected).await {
            Ok(linked) => tracing::debug!(violation_id = %violation.id, linked, "Linked regulations"),
            Err(error) => tracing::warn!(
                violation_id = %violation.id,
                error = %error,
                "Failed to link regulations"
            ),
        }
    }

    async fn try_link_regulations(&self, violation: &Violation, detected: &DetectedViolation) -> Result<usize> {
        let mut numbers: Vec<String> = detected
            .regulation_numbers
            .iter()
            .filter_map(|raw| normalize_regulation_number(raw))
            .collect();
        numbers.sort();
        numbers.dedup();

        let mut linked = 0;
        if !numbers.is_empty() {
            for regulation in self.inspections.find_regulations_by_number(&numbers).await? {
                self.inspections
                    .link_regulation(violation.id, regulation.id, 1.0)
                    .await?;
                linked += 1;
            }
        }

        if linked == 0 {
            let matches = self
                .inspections
                .search_regulations(&violation.description, FALLBACK_REGULATION_LIMIT)
                .await?;
            for (regulation, relevance) in matches {
                self.inspections
                    .link_regulation(violation.id, regulation.id, relevance)
                    .await?;
                linked += 1;
            }
        }

        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_regulation_number() {
        assert_eq!(
            normalize_regulation_number("29 CFR 1926.501 (b)(1)").as_deref(),
            Some("1926.501(b)(1)")
        );
        assert_eq!(
            normalize_regulation_number("OSHA 1910.23(A)( 2 )").as_deref(),
            Some("1910.23(a)(2)")
        );
        assert_eq!(normalize_regulation_number("1926.1053").as_deref(), Some("1926.1053"));
        assert_eq!(normalize_regulation_number("general duty clause"), None);
    }

    #[test]
    fn test_payload_is_camel_case() {
        let payload = AnalyzeInspectionPayload {
            inspection_id: Uuid::nil(),
            user_id: Uuid::nil(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("inspectionId").is_some());
        assert!(value.get("userId").is_some());
    }
}
