//! Report records and the data handed to the renderer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::ai::Severity;
use crate::error::{ErrorCode, InspectorError};
use crate::inspections::{Inspection, InspectionImage, ViolationWithRegulations};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Pdf,
    Docx,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFormat {
    type Err = InspectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            other => Err(InspectorError::new(
                ErrorCode::InvalidInput,
                format!("Unsupported report format: {}", other),
            )),
        }
    }
}

/// A stored, rendered report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: Uuid,
    pub inspection_id: Uuid,
    pub user_id: Uuid,
    pub format: ReportFormat,
    pub storage_key: String,
    pub size_bytes: i64,
    /// Hex SHA-256 of the document bytes
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Storage key for a rendered report.
pub fn report_storage_key(inspection_id: Uuid, report_id: Uuid, format: ReportFormat) -> String {
    format!("reports/{}/{}.{}", inspection_id, report_id, format.extension())
}

/// An image with a time-limited link the document can embed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportImage {
    #[serde(flatten)]
    pub image: InspectionImage,
    /// Absent when the object could not be linked
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub major: usize,
    pub minor: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn tally<'a>(severities: impl IntoIterator<Item = &'a Severity>) -> Self {
        let mut counts = Self::default();
        for severity in severities {
            match severity {
                Severity::Critical => counts.critical += 1,
                Severity::Major => counts.major += 1,
                Severity::Minor => counts.minor += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.critical + self.major + self.minor + self.info
    }
}

/// Everything the renderer needs, serialized as JSON on its stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub report_id: Uuid,
    pub format: ReportFormat,
    pub inspection: Inspection,
    pub images: Vec<ReportImage>,
    pub violations: Vec<ViolationWithRegulations>,
    pub severity_counts: SeverityCounts,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_layout() {
        let inspection_id = Uuid::new_v4();
        let report_id = Uuid::new_v4();
        assert_eq!(
            report_storage_key(inspection_id, report_id, ReportFormat::Docx),
            format!("reports/{}/{}.docx", inspection_id, report_id)
        );
    }

    #[test]
    fn test_severity_tally() {
        let counts = SeverityCounts::tally(&[Severity::Critical, Severity::Minor, Severity::Critical]);
        assert_eq!(counts.critical, 2);
        assert_eq!(counts.minor, 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("PDF".parse::<ReportFormat>().unwrap(), ReportFormat::Pdf);
        assert!("odt".parse::<ReportFormat>().is_err());
    }
}
