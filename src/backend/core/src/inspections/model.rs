//! Inspection, image and violation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::ai::{BoundingBox, Confidence, DetectedViolation, Severity};
use crate::error::{ErrorCode, InspectorError};

/// Lifecycle of an inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectionStatus {
    Draft,
    Analyzing,
    Review,
    Completed,
}

impl InspectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Analyzing => "analyzing",
            Self::Review => "review",
            Self::Completed => "completed",
        }
    }

    /// Whether images may still be (re)analyzed.
    pub fn accepts_analysis(&self) -> bool {
        matches!(self, Self::Draft | Self::Analyzing | Self::Review)
    }

    /// Whether a report may be generated.
    pub fn accepts_report(&self) -> bool {
        matches!(self, Self::Review | Self::Completed)
    }
}

impl fmt::Display for InspectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InspectionStatus {
    type Err = InspectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "analyzing" => Ok(Self::Analyzing),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            other => Err(InspectorError::new(
                ErrorCode::DeserializationError,
                format!("Unknown inspection status: {}", other),
            )),
        }
    }
}

/// Analysis state of a single image, independent of the job that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageAnalysisStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl ImageAnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ImageAnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageAnalysisStatus {
    type Err = InspectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analyzing" => Ok(Self::Analyzing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(InspectorError::new(
                ErrorCode::DeserializationError,
                format!("Unknown image analysis status: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: InspectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Inspection {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            status: InspectionStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionImage {
    pub id: Uuid,
    pub inspection_id: Uuid,
    pub storage_key: String,
    pub content_type: String,
    pub analysis_status: ImageAnalysisStatus,
    pub analysis_error: Option<String>,
    pub tokens_used: Option<i64>,
    pub analysis_cost: Option<f64>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl InspectionImage {
    pub fn new(
        inspection_id: Uuid,
        storage_key: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            inspection_id,
            storage_key: storage_key.into(),
            content_type: content_type.into(),
            analysis_status: ImageAnalysisStatus::Pending,
            analysis_error: None,
            tokens_used: None,
            analysis_cost: None,
            analyzed_at: None,
        }
    }
}

/// A finding ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewViolation {
    pub inspection_id: Uuid,
    pub image_id: Uuid,
    pub description: String,
    pub location: String,
    pub bounding_box: Option<BoundingBox>,
    pub confidence: Confidence,
    pub category: String,
    pub severity: Severity,
}

impl NewViolation {
    pub fn from_detected(inspection_id: Uuid, image_id: Uuid, detected: &DetectedViolation) -> Self {
        Self {
            inspection_id,
            image_id,
            description: detected.description.clone(),
            location: detected.location.clone(),
            bounding_box: detected.bounding_box,
            confidence: detected.confidence,
            category: detected.category.clone(),
            severity: detected.severity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub id: Uuid,
    pub inspection_id: Uuid,
    pub image_id: Uuid,
    pub description: String,
    pub location: String,
    pub bounding_box: Option<BoundingBox>,
    pub confidence: Confidence,
    pub category: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Regulation {
    pub id: Uuid,
    pub standard_number: String,
    pub title: String,
    pub body: String,
}

impl Regulation {
    pub fn new(
        standard_number: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            standard_number: standard_number.into(),
            title: title.into(),
            body: body.into(),
        }
    }
}

/// A violation together with the regulations linked to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationWithRegulations {
    #[serde(flatten)]
    pub violation: Violation,
    pub regulations: Vec<Regulation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_gates() {
        assert!(InspectionStatus::Draft.accepts_analysis());
        assert!(InspectionStatus::Review.accepts_analysis());
        assert!(!InspectionStatus::Completed.accepts_analysis());

        assert!(!InspectionStatus::Draft.accepts_report());
        assert!(!InspectionStatus::Analyzing.accepts_report());
        assert!(InspectionStatus::Completed.accepts_report());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("review".parse::<InspectionStatus>().unwrap(), InspectionStatus::Review);
        assert_eq!(
            "failed".parse::<ImageAnalysisStatus>().unwrap(),
            ImageAnalysisStatus::Failed
        );
        assert!("archived".parse::<InspectionStatus>().is_err());
    }
}
