//! Configuration management.
//!
//! Values come from an optional file, then environment variables prefixed
//! with `INSPECTOR` using `__` as the section separator, for example
//! `INSPECTOR__DATABASE__URL` or `INSPECTOR__WORKER__CONCURRENCY`.
//! Durations are written in human form (`"5s"`, `"10m"`).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::ai::AiConfig;
use crate::jobs::WorkerConfig;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Job defaults applied at enqueue time
    #[serde(default)]
    pub jobs: JobsConfig,

    /// AI provider configuration
    #[serde(default)]
    pub ai: AiConfig,

    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Report rendering configuration
    #[serde(default)]
    pub reports: ReportsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub defaults: JobDefaults,
}

/// Options used when a caller does not override them.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            priority: default_priority(),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Filesystem root for the local backend; in-memory when unset
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Lifetime of generated object URLs
    #[serde(default = "default_url_ttl", with = "humantime_serde")]
    pub url_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            url_ttl: default_url_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportsConfig {
    /// External renderer; receives report JSON on stdin, writes the document to stdout
    #[serde(default = "default_renderer_command")]
    pub renderer_command: String,

    #[serde(default)]
    pub renderer_args: Vec<String>,

    #[serde(default = "default_render_timeout", with = "humantime_serde")]
    pub render_timeout: Duration,

    /// Lifetime of the download link sent in report-ready emails
    #[serde(default = "default_download_ttl", with = "humantime_serde")]
    pub download_url_ttl: Duration,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            renderer_command: default_renderer_command(),
            renderer_args: Vec::new(),
            render_timeout: default_render_timeout(),
            download_url_ttl: default_download_ttl(),
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_max_attempts() -> i32 { 3 }
fn default_priority() -> i32 { crate::jobs::JobPriority::Normal.value() }
fn default_url_ttl() -> Duration { Duration::from_secs(3600) }
fn default_renderer_command() -> String { "inspector-render".to_string() }
fn default_render_timeout() -> Duration { Duration::from_secs(120) }
fn default_download_ttl() -> Duration { Duration::from_secs(7 * 24 * 3600) }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        Self::build(None)
    }

    /// Load configuration from a file, with environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        Self::build(Some(path))
    }

    fn build(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("INSPECTOR")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("reports.renderer_args"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
