//! `generate_report`: render an inspection into a PDF or DOCX document and store it.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{InspectorError, Result};
use crate::inspections::{Inspection, InspectionRepository};
use crate::jobs::{JobContext, JobError, JobHandler, JobResult};
use crate::notify::{report_ready_email, Mailer};
use crate::reports::{
    report_storage_key, DocumentGenerator, Report, ReportData, ReportFormat, ReportImage,
    ReportRepository, SeverityCounts,
};
use crate::storage::{ObjectStorage, PutOptions};
use crate::telemetry::metrics::DomainMetrics;

pub const GENERATE_REPORT: &str = "generate_report";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReportPayload {
    pub inspection_id: Uuid,
    pub user_id: Uuid,
    pub format: ReportFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_email: Option<String>,
}

pub struct GenerateReportHandler {
    inspections: Arc<dyn InspectionRepository>,
    reports: Arc<dyn ReportRepository>,
    storage: Arc<dyn ObjectStorage>,
    generator: Arc<dyn DocumentGenerator>,
    mailer: Arc<dyn Mailer>,
    image_url_ttl: Duration,
    download_url_ttl: Duration,
}

impl GenerateReportHandler {
    pub fn new(
        inspections: Arc<dyn InspectionRepository>,
        reports: Arc<dyn ReportRepository>,
        storage: Arc<dyn ObjectStorage>,
        generator: Arc<dyn DocumentGenerator>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            inspections,
            reports,
            storage,
            generator,
            mailer,
            image_url_ttl: Duration::from_secs(3600),
            download_url_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }

    /// Lifetime of the image links embedded in the document.
    pub fn with_image_url_ttl(mut self, ttl: Duration) -> Self {
        self.image_url_ttl = ttl;
        self
    }

    /// Lifetime of the download link in the notification email.
    pub fn with_download_url_ttl(mut self, ttl: Duration) -> Self {
        self.download_url_ttl = ttl;
        self
    }

    async fn load_inspection(&self, payload: &GenerateReportPayload) -> Result<Inspection> {
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
        if !inspection.status.accepts_report() {
            return Err(InspectorError::precondition(format!(
                "Inspection must be in review or completed status to generate a report (current: {})",
                inspection.status
            )));
        }
        Ok(inspection)
    }

    async fn collect(&self, inspection: Inspection, report_id: Uuid, format: ReportFormat) -> Result<ReportData> {
        let mut images = Vec::new();
        for image in self.inspections.list_images(inspection.id, None).await? {
            let url = match self.storage.url(&image.storage_key, self.image_url_ttl).await {
                Ok(url) => Some(url),
                Err(error) => {
                    tracing::warn!(
                        inspection_id = %inspection.id,
                        image_id = %image.id,
                        error = %error,
                        "No link for report image"
                    );
                    None
                }
            };
            images.push(ReportImage { image, url });
        }

        let violations = self.inspections.list_violations(inspection.id).await?;
        let severity_counts = SeverityCounts::tally(violations.iter().map(|v| &v.violation.severity));

        Ok(ReportData {
            report_id,
            format,
            inspection,
            images,
            violations,
            severity_counts,
            generated_at: Utc::now(),
        })
    }

    pub async fn generate(&self, ctx: &JobContext, payload: &GenerateReportPayload) -> std::result::Result<Report, JobError> {
        let inspection = self.load_inspection(payload).await?;
        let inspection_name = inspection.name.clone();
        let report_id = Uuid::new_v4();

        let data = self.collect(inspection, report_id, payload.format).await?;
        let violation_count = data.severity_counts.total();

        // Renderer failures are always worth another attempt
        let document = self
            .generator
            .render(&data)
            .await
            .map_err(JobError::transient)?;

        let storage_key = report_storage_key(payload.inspection_id, report_id, payload.format);
        let size_bytes = document.len() as i64;
        let checksum = hex::encode(Sha256::digest(&document));

        self.storage
            .put(
                &storage_key,
                document,
                PutOptions::with_content_type(payload.format.content_type()),
            )
            .await?;

        let report = Report {
            id: report_id,
            inspection_id: payload.inspection_id,
            user_id: payload.user_id,
            format: payload.format,
            storage_key,
            size_bytes,
            checksum,
            created_at: Utc::now(),
        };
        self.reports.insert_report(&report).await?;

        DomainMetrics::record_report_generated(payload.format.as_str(), size_bytes as u64);
        tracing::info!(
            job_id = %ctx.job_id(),
            inspection_id = %payload.inspection_id,
            report_id = %report.id,
            format = %payload.format,
            size_bytes,
            violations = violation_count,
            "Report generated"
        );

        if let Some(email) = &payload.notify_email {
            self.notify(email, &inspection_name, &report).await;
        }

        Ok(report)
    }

    async fn notify(&self, email: &str, inspection_name: &str, report: &Report) {
        let result = async {
            let url = self
                .storage
                .url(&report.storage_key, self.download_url_ttl)
                .await?;
            let message = report_ready_email(
                email,
                inspection_name,
                report.format.as_str(),
                &url,
                self.download_url_ttl,
            );
            self.mailer.send(message).await
        }
        .await;

        if let Err(error) = result {
            tracing::warn!(
                report_id = %report.id,
                error = %error,
                "Failed to send report notification"
            );
        }
    }
}

#[async_trait]
impl JobHandler for GenerateReportHandler {
    fn job_type(&self) -> &'static str {
        GENERATE_REPORT
    }

    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> JobResult {
        let payload: GenerateReportPayload = serde_json::from_slice(payload).map_err(|e| {
            JobError::permanent(InspectorError::invalid_payload(GENERATE_REPORT, e.to_string()))
        })?;

        self.generate(ctx, &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_decoding() {
        let payload: GenerateReportPayload = serde_json::from_str(&format!(
            r#"{{"inspectionId":"{}","userId":"{}","format":"docx"}}"#,
            Uuid::nil(),
            Uuid::nil()
        ))
        .unwrap();
        assert_eq!(payload.format, ReportFormat::Docx);
        assert!(payload.notify_email.is_none());

        let invalid = serde_json::from_str::<GenerateReportPayload>(
            r#"{"inspectionId":"x","userId":"y","format":"odt"}"#,
        );
        assert!(invalid.is_err());
    }
}
