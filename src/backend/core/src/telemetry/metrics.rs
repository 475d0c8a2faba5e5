//! Prometheus metrics for jobs, AI calls and report generation.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so library code and tests can call these freely.
//!
//! # Example
//!
//! ```rust,no_run
//! use inspector_core::telemetry::metrics::JobMetrics;
//! use std::time::Duration;
//!
//! JobMetrics::record_outcome("analyze_inspection", "completed", Duration::from_millis(850));
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Address the exporter's HTTP listener binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: default_listen_address(),
            duration_buckets: default_duration_buckets(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
}

/// Install the Prometheus exporter and register metric descriptions.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let address: SocketAddr = config.listen_address.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(address)
        .set_buckets(&config.duration_buckets)?
        .install()?;

    register_metric_descriptions();

    tracing::info!(listen_address = %address, "Metrics exporter initialized");
    Ok(())
}

fn register_metric_descriptions() {
    // Job metrics
    describe_counter!("inspector_jobs_total", "Jobs resolved by the worker pool, by outcome");
    describe_histogram!(
        "inspector_job_duration_seconds",
        "Handler execution time in seconds"
    );
    describe_counter!("inspector_jobs_recovered_total", "Stale jobs reset to pending");

    // AI metrics
    describe_counter!("inspector_ai_requests_total", "AI provider requests, by result");
    describe_histogram!(
        "inspector_ai_request_duration_seconds",
        "AI provider request latency in seconds"
    );
    describe_counter!("inspector_ai_retries_total", "AI provider retries, by error kind");
    describe_counter!("inspector_ai_tokens_input_total", "Input tokens consumed");
    describe_counter!("inspector_ai_tokens_output_total", "Output tokens consumed");
    describe_counter!(
        "inspector_ai_cost_total_microdollars",
        "AI cost in microdollars"
    );

    // Domain metrics
    describe_counter!("inspector_images_analyzed_total", "Images analyzed, by result");
    describe_counter!("inspector_reports_generated_total", "Reports generated, by format");
    describe_counter!("inspector_report_bytes_total", "Bytes of rendered reports");

    describe_counter!("inspector_errors_total", "Errors created, by code");
}

/// Worker pool metrics.
pub struct JobMetrics;

impl JobMetrics {
    /// Record how a leased job was resolved.
    pub fn record_outcome(job_type: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "inspector_jobs_total",
            "job_type" => job_type.to_string(),
            "outcome" => outcome,
        )
        .increment(1);

        histogram!(
            "inspector_job_duration_seconds",
            "job_type" => job_type.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_recovered(count: u64) {
        counter!("inspector_jobs_recovered_total").increment(count);
    }
}

/// AI provider metrics.
pub struct AiMetrics;

impl AiMetrics {
    /// Record one HTTP round trip. `result` is `ok` or an error kind.
    pub fn record_request(model: &str, result: &'static str, duration: Duration) {
        counter!(
            "inspector_ai_requests_total",
            "model" => model.to_string(),
            "result" => result,
        )
        .increment(1);

        histogram!(
            "inspector_ai_request_duration_seconds",
            "model" => model.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_retry(kind: &'static str) {
        counter!("inspector_ai_retries_total", "kind" => kind).increment(1);
    }

    /// Record token usage and cost (stored as microdollars for precision).
    pub fn record_usage(model: &str, input_tokens: u64, output_tokens: u64, cost_dollars: f64) {
        counter!("inspector_ai_tokens_input_total", "model" => model.to_string())
            .increment(input_tokens);
        counter!("inspector_ai_tokens_output_total", "model" => model.to_string())
            .increment(output_tokens);
        counter!("inspector_ai_cost_total_microdollars", "model" => model.to_string())
            .increment((cost_dollars * 1_000_000.0) as u64);
    }
}

/// Inspection analysis and report metrics.
pub struct DomainMetrics;

impl DomainMetrics {
    pub fn record_images_analyzed(succeeded: u64, failed: u64) {
        counter!("inspector_images_analyzed_total", "result" => "completed").increment(succeeded);
        counter!("inspector_images_analyzed_total", "result" => "failed").increment(failed);
    }

    pub fn record_report_generated(format: &'static str, size_bytes: u64) {
        counter!("inspector_reports_generated_total", "format" => format).increment(1);
        counter!("inspector_report_bytes_total", "format" => format).increment(size_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.listen_address, "0.0.0.0:9090");
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_metrics_install_nothing() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        JobMetrics::record_outcome("test_job", "completed", Duration::from_millis(10));
        AiMetrics::record_usage("model", 100, 50, 0.001);
        DomainMetrics::record_images_analyzed(3, 2);
    }
}
