//! Analysis results and the provider's wire format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::AiError;
use crate::error::{ErrorCode, InspectorError};

// ═══════════════════════════════════════════════════════════════════════════════
// Analysis Results
// ═══════════════════════════════════════════════════════════════════════════════

/// How sure the model is about a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Severity tier of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Info,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = InspectorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(InspectorError::new(
                        ErrorCode::DeserializationError,
                        format!("Unknown {}: {}", stringify!($ty), other),
                    )),
                }
            }
        }
    };
}

text_enum!(Confidence { High => "high", Medium => "medium", Low => "low" });
text_enum!(Severity {
    Critical => "critical",
    Major => "major",
    Minor => "minor",
    Info => "info",
});

/// Normalized region of the image, each coordinate in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_normalized(&self) -> bool {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        in_unit(self.x)
            && in_unit(self.y)
            && in_unit(self.width)
            && in_unit(self.height)
            && self.x + self.width <= 1.0 + f64::EPSILON
            && self.y + self.height <= 1.0 + f64::EPSILON
    }
}

/// One finding returned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedViolation {
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    pub confidence: Confidence,
    #[serde(default)]
    pub category: String,
    pub severity: Severity,
    #[serde(default)]
    pub regulation_numbers: Vec<String>,
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of analyzing one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnalysis {
    pub violations: Vec<DetectedViolation>,
    pub observations: String,
    pub notes: Option<String>,
    pub usage: Usage,
    /// Dollars, derived from usage and configured prices
    pub cost: f64,
    pub model: String,
}

/// What the prompt tells the model about the image.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub inspection_id: Uuid,
    pub inspection_name: String,
    pub image_id: Uuid,
}

impl AnalysisContext {
    pub fn prompt(&self) -> String {
        format!(
            "This photo was taken during the site inspection \"{}\". \
             Identify every safety or code violation visible in the image. \
             Respond with a single JSON object of the form \
             {{\"violations\": [{{\"description\": string, \"location\": string, \
             \"boundingBox\": {{\"x\": number, \"y\": number, \"width\": number, \"height\": number}} | null, \
             \"confidence\": \"high\" | \"medium\" | \"low\", \"category\": string, \
             \"severity\": \"critical\" | \"major\" | \"minor\" | \"info\", \
             \"regulationNumbers\": [string]}}], \"observations\": string, \"notes\": string | null}}. \
             Bounding box coordinates are fractions of the image size between 0 and 1. \
             Return an empty violations array if nothing is wrong.",
            self.inspection_name
        )
    }
}

pub(crate) const SYSTEM_PROMPT: &str = "You are an experienced construction safety inspector. \
     You review site photos against occupational safety and building code regulations \
     and report concrete, visible violations only. Cite regulation standard numbers \
     (for example 1926.501(b)(1)) when you are confident they apply.";

// ═══════════════════════════════════════════════════════════════════════════════
// Wire Format
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub(crate) struct MessagesRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub system: &'a str,
    pub messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Message<'a> {
    pub role: &'static str,
    pub content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum ContentBlock<'a> {
    Image { source: ImageSource<'a> },
    Text { text: String },
}

#[derive(Debug, Serialize)]
pub(crate) struct ImageSource<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub media_type: &'a str,
    pub data: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    #[serde(default)]
    pub content: Vec<ResponseBlock>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    #[serde(default)]
    violations: Vec<DetectedViolation>,
    #[serde(default)]
    observations: String,
    #[serde(default)]
    notes: Option<String>,
}

/// Findings parsed from the model's text, before usage is attached.
#[derive(Debug)]
pub(crate) struct ParsedAnalysis {
    pub violations: Vec<DetectedViolation>,
    pub observations: String,
    pub notes: Option<String>,
}

/// Parse the model's text answer. The JSON object may be wrapped in a code fence.
pub(crate) fn parse_analysis_text(text: &str) -> Result<ParsedAnalysis, AiError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => {
            return Err(AiError::InvalidRequest(
                "AI response did not contain a JSON object".to_string(),
            ))
        }
    };

    let payload: AnalysisPayload = serde_json::from_str(json)
        .map_err(|e| AiError::InvalidRequest(format!("Unparseable AI analysis: {}", e)))?;

    let violations = payload
        .violations
        .into_iter()
        .map(|mut violation| {
            if violation.bounding_box.map_or(false, |b| !b.is_normalized()) {
                tracing::debug!(
                    description = %violation.description,
                    "Dropping bounding box outside the unit square"
                );
                violation.bounding_box = None;
            }
            violation
        })
        .collect();

    Ok(ParsedAnalysis {
        violations,
        observations: payload.observations,
        notes: payload.notes.filter(|n| !n.trim().is_empty()),
    })
}
