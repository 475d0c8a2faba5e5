//! AI image analysis.
//!
//! [`AiClient`] talks to a Messages-style HTTP API and retries rate limits,
//! timeouts and outages with exponential backoff. Handlers depend on the
//! [`ImageAnalyzer`] trait so tests can substitute a scripted analyzer.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AiClient, AiConfig, ImageAnalyzer};
pub use error::AiError;
pub use types::{
    AnalysisContext, BoundingBox, Confidence, DetectedViolation, ImageAnalysis, Severity, Usage,
};
