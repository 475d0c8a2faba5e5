//! Generated inspection reports.

pub mod generator;
pub mod model;
pub mod repository;

pub use generator::{CommandDocumentGenerator, DocumentGenerator};
pub use model::{
    report_storage_key, Report, ReportData, ReportFormat, ReportImage, SeverityCounts,
};
pub use repository::{InMemoryReportRepository, PgReportRepository, ReportRepository};
