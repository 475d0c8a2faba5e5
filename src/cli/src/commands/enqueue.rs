//! Job enqueue commands.
//!
//! Writes `analyze_inspection` and `generate_report` jobs straight to the
//! job store; a running worker picks them up.

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use std::time::Duration;
use uuid::Uuid;

use inspector_core::handlers::{
    AnalyzeInspectionPayload, GenerateReportPayload, ANALYZE_INSPECTION, GENERATE_REPORT,
};
use inspector_core::jobs::{EnqueueOptions, Job, JobEnqueuer, JobPriority};
use inspector_core::reports::ReportFormat;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum EnqueueCommands {
    /// Analyze every pending photo of an inspection
    Analysis {
        /// Inspection ID
        #[arg(long)]
        inspection: Uuid,

        /// Owner of the inspection
        #[arg(long)]
        user: Uuid,

        #[command(flatten)]
        options: JobOptions,
    },

    /// Render an inspection report
    Report {
        /// Inspection ID
        #[arg(long)]
        inspection: Uuid,

        /// Owner of the inspection
        #[arg(long)]
        user: Uuid,

        /// Document format
        #[arg(short, long, value_enum, default_value = "pdf")]
        format: FormatArg,

        /// Email the download link to this address when done
        #[arg(long)]
        notify: Option<String>,

        #[command(flatten)]
        options: JobOptions,
    },
}

#[derive(clap::Args)]
pub struct JobOptions {
    /// Queue priority
    #[arg(short, long, value_enum)]
    priority: Option<PriorityArg>,

    /// Maximum attempts before the job fails
    #[arg(long)]
    max_attempts: Option<i32>,

    /// Delay before the job becomes eligible (e.g. "30s", "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    delay: Option<Duration>,
}

impl JobOptions {
    fn into_enqueue_options(self) -> EnqueueOptions {
        let mut options = EnqueueOptions::new();
        if let Some(priority) = self.priority {
            options = options.with_priority(JobPriority::from(priority));
        }
        if let Some(max_attempts) = self.max_attempts {
            options = options.with_max_attempts(max_attempts);
        }
        if let Some(delay) = self.delay {
            options = options.with_delay(delay);
        }
        options
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
    Critical,
}

impl From<PriorityArg> for JobPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => JobPriority::Low,
            PriorityArg::Normal => JobPriority::Normal,
            PriorityArg::High => JobPriority::High,
            PriorityArg::Critical => JobPriority::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Pdf,
    Docx,
}

impl From<FormatArg> for ReportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Pdf => ReportFormat::Pdf,
            FormatArg::Docx => ReportFormat::Docx,
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: EnqueueCommands, enqueuer: &JobEnqueuer, format: OutputFormat) -> Result<()> {
    let job = match cmd {
        EnqueueCommands::Analysis {
            inspection,
            user,
            options,
        } => {
            let payload = AnalyzeInspectionPayload {
                inspection_id: inspection,
                user_id: user,
            };
            enqueuer
                .enqueue(ANALYZE_INSPECTION, &payload, options.into_enqueue_options())
                .await?
        }

        EnqueueCommands::Report {
            inspection,
            user,
            format: document_format,
            notify,
            options,
        } => {
            let payload = GenerateReportPayload {
                inspection_id: inspection,
                user_id: user,
                format: document_format.into(),
                notify_email: notify,
            };
            enqueuer
                .enqueue(GENERATE_REPORT, &payload, options.into_enqueue_options())
                .await?
        }
    };

    print_enqueued(&job, format)
}

fn print_enqueued(job: &Job, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            output::print_success("Job enqueued");
            output::print_detail("ID", &job.id.to_string());
            output::print_detail("Type", &job.job_type);
            output::print_detail("Priority", &job.priority.to_string());
            output::print_detail("Max Attempts", &job.max_attempts.to_string());
            output::print_detail("Scheduled", &job.scheduled_at.to_rfc3339());
            Ok(())
        }
        _ => output::print_item(job, format),
    }
}
