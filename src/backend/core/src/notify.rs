//! Outbound email.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

use crate::error::{InspectorError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<()>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> Result<()> {
        if !message.to.contains('@') {
            return Err(InspectorError::validation(format!(
                "Invalid recipient address: {}",
                message.to
            )));
        }

        tracing::info!(to = %message.to, subject = %message.subject, "Email queued for delivery");
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Report-ready notification.
pub fn report_ready_email(
    to: &str,
    inspection_name: &str,
    format: &str,
    download_url: &str,
    expires_in: Duration,
) -> EmailMessage {
    let hours = expires_in.as_secs() / 3600;
    let expiry = match hours {
        0 | 1 => "1 hour".to_string(),
        2..=47 => format!("{} hours", hours),
        _ => format!("{} days", hours / 24),
    };

    EmailMessage {
        to: to.to_string(),
        subject: format!("Your inspection report for {} is ready", inspection_name),
        body: format!(
            "The {} report for inspection \"{}\" has been generated.\n\n\
             Download it here: {}\n\n\
             This link expires in {}.",
            format.to_uppercase(),
            inspection_name,
            download_url,
            expiry
        ),
    }
}
