//! Document rendering through an external conversion process.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::model::ReportData;
use crate::config::ReportsConfig;
use crate::error::{ErrorCode, InspectorError, Result};

#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    /// Render the report in `data.format`, returning the document bytes.
    async fn render(&self, data: &ReportData) -> Result<Vec<u8>>;
}

/// Runs a command with the report JSON on stdin and reads the document from stdout.
///
/// The format is passed as `--format <pdf|docx>` after the configured arguments.
#[derive(Debug, Clone)]
pub struct CommandDocumentGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDocumentGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &ReportsConfig) -> Self {
        Self::new(
            config.renderer_command.clone(),
            config.renderer_args.clone(),
            config.render_timeout,
        )
    }

    fn render_error(message: impl Into<String>) -> InspectorError {
        InspectorError::new(ErrorCode::RenderFailed, message.into())
    }
}

#[async_trait]
impl DocumentGenerator for CommandDocumentGenerator {
    async fn render(&self, data: &ReportData) -> Result<Vec<u8>> {
        let input = serde_json::to_vec(data)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--format")
            .arg(data.format.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Self::render_error(format!("Failed to start renderer {}: {}", self.program, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Self::render_error("Renderer stdin unavailable"))?;

        // Feed stdin concurrently so a renderer that streams output cannot deadlock
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Self::render_error(format!("Renderer exceeded timeout of {:?}", self.timeout))
            })?
            .map_err(|e| Self::render_error(format!("Renderer failed: {}", e)))?;

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(Self::render_error(format!("Failed to write report data: {}", e))),
            Err(e) => return Err(Self::render_error(format!("Renderer input task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InspectorError::with_internal(
                ErrorCode::RenderFailed,
                format!("Renderer exited with {}", output.status),
                stderr.trim().to_string(),
            ));
        }

        if output.stdout.is_empty() {
            return Err(Self::render_error("Renderer produced an empty document"));
        }

        tracing::debug!(
            report_id = %data.report_id,
            format = %data.format,
            size_bytes = output.stdout.len(),
            "Report rendered"
        );
        Ok(output.stdout)
    }
}
