//! Job inspection and maintenance commands.
//!
//! Provides show, list, and recover operations against the job store.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use std::time::Duration;
use tabled::Tabled;
use uuid::Uuid;

use inspector_core::jobs::{recover_stale_jobs, Job, JobId, JobStatus, JobStore};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Show one job, including its payload and last error
    Show {
        /// Job ID
        job_id: Uuid,
    },

    /// List the most recently created jobs
    List {
        /// Filter by status (pending, running, completed, failed)
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Return jobs stuck in `running` to `pending`
    Recover {
        /// Age after which a running job counts as orphaned; defaults to the
        /// worker's configured threshold
        #[arg(long, value_parser = humantime::parse_duration)]
        older_than: Option<Duration>,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    job_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Scheduled")]
    scheduled_at: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl JobRow {
    fn from_job(job: &Job, colored: bool) -> Self {
        let status = if colored {
            output::status_label(job.status.as_str())
        } else {
            job.status.to_string()
        };
        Self {
            id: job.id.to_string()[..8].to_string(),
            job_type: job.job_type.clone(),
            status,
            attempts: format!("{}/{}", job.attempts, job.max_attempts),
            priority: job.priority,
            scheduled_at: job.scheduled_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            error: job
                .error_message
                .as_deref()
                .map(truncate)
                .unwrap_or_default(),
        }
    }
}

fn truncate(message: &str) -> String {
    const MAX: usize = 60;
    if message.chars().count() <= MAX {
        message.to_string()
    } else {
        format!("{}...", message.chars().take(MAX).collect::<String>())
    }
}

/// Full view of a job for `show`.
#[derive(Debug, Serialize)]
struct JobDetail<'a> {
    #[serde(flatten)]
    job: &'a Job,
    payload: Option<serde_json::Value>,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(
    cmd: JobCommands,
    store: &dyn JobStore,
    default_stale_threshold: Duration,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        JobCommands::Show { job_id } => {
            let Some(job) = store.get(JobId(job_id)).await? else {
                bail!("Job not found: {}", job_id);
            };

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Job: {}", job.id));
                    output::print_detail("Type", &job.job_type);
                    output::print_detail("Status", &output::status_label(job.status.as_str()));
                    output::print_detail(
                        "Attempts",
                        &format!("{}/{}", job.attempts, job.max_attempts),
                    );
                    output::print_detail("Priority", &job.priority.to_string());
                    output::print_detail("Scheduled", &job.scheduled_at.to_rfc3339());
                    if let Some(started) = job.started_at {
                        output::print_detail("Started", &started.to_rfc3339());
                    }
                    if let Some(completed) = job.completed_at {
                        output::print_detail("Completed", &completed.to_rfc3339());
                    }
                    if let Some(error) = &job.error_message {
                        output::print_detail("Error", error);
                    }
                    match job.payload_json() {
                        Some(payload) => {
                            output::print_detail("Payload", &serde_json::to_string(&payload)?)
                        }
                        None => output::print_detail(
                            "Payload",
                            &format!("<{} bytes, not JSON>", job.payload.len()),
                        ),
                    }
                }
                _ => output::print_item(
                    &JobDetail {
                        job: &job,
                        payload: job.payload_json(),
                    },
                    format,
                )?,
            }
        }

        JobCommands::List { status, limit } => {
            let jobs = store.list(status, limit).await?;
            let colored = matches!(format, OutputFormat::Table);
            let rows: Vec<JobRow> = jobs.iter().map(|job| JobRow::from_job(job, colored)).collect();
            output::print_list(&rows, format)?;
        }

        JobCommands::Recover { older_than } => {
            let threshold = older_than.unwrap_or(default_stale_threshold);
            let recovered = recover_stale_jobs(store, threshold).await?;

            match format {
                OutputFormat::Table => {
                    if recovered == 0 {
                        output::print_info("No stale jobs found");
                    } else {
                        output::print_success(&format!(
                            "Recovered {} stale job(s) running longer than {}",
                            recovered,
                            humantime::format_duration(threshold)
                        ));
                    }
                }
                _ => output::print_item(&serde_json::json!({ "recovered": recovered }), format)?,
            }
        }
    }

    Ok(())
}
