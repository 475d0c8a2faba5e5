//! Job handlers for inspection analysis and report generation.

pub mod analyze_inspection;
pub mod generate_report;

pub use analyze_inspection::{
    normalize_regulation_number, AnalysisSummary, AnalyzeInspectionHandler,
    AnalyzeInspectionPayload, ANALYZE_INSPECTION, MAX_CONCURRENT_ANALYSES,
};
pub use generate_report::{GenerateReportHandler, GenerateReportPayload, GENERATE_REPORT};
