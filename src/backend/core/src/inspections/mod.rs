//! Inspection records read and written by the job handlers.

pub mod model;
pub mod repository;

pub use model::{
    ImageAnalysisStatus, Inspection, InspectionImage, InspectionStatus, NewViolation, Regulation,
    Violation, ViolationWithRegulations,
};
pub use repository::{InMemoryInspectionRepository, InspectionRepository, PgInspectionRepository};
