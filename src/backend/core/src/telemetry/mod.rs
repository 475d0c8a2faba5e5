//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact output through `tracing-subscriber`
//! - **Metrics**: job, AI and report counters through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use inspector_core::telemetry::{init_telemetry, LoggingConfig, MetricsConfig};
//!
//! # #[tokio::main] async fn main() {
//! init_telemetry(&LoggingConfig::default(), &MetricsConfig::default())
//!     .expect("Failed to initialize telemetry");
//! # }
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, AiMetrics, DomainMetrics, JobMetrics, MetricsConfig};

/// Initialize logging, then the metrics exporter if enabled.
///
/// Call once at startup, inside a Tokio runtime.
pub fn init_telemetry(logging: &LoggingConfig, metrics: &MetricsConfig) -> anyhow::Result<()> {
    init_logging(logging)?;
    init_metrics(metrics)?;
    Ok(())
}
