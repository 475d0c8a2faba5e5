//! HTTP client for the image-analysis provider, with retry and backoff.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::types::{
    parse_analysis_text, ContentBlock, ErrorEnvelope, ImageSource, Message, MessagesRequest,
    MessagesResponse, SYSTEM_PROMPT,
};
use super::{AiError, AnalysisContext, ImageAnalysis, Usage};
use crate::error::{ErrorCode, InspectorError, Result};
use crate::jobs::ExponentialBackoff;
use crate::telemetry::metrics::AiMetrics;

const SUPPORTED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// AI provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Retries after the first attempt, for retryable errors only
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait before the first retry; doubles on each subsequent one
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Dollars per million input tokens
    #[serde(default = "default_input_price")]
    pub input_price_per_mtok: f64,

    /// Dollars per million output tokens
    #[serde(default = "default_output_price")]
    pub output_price_per_mtok: f64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            api_version: default_api_version(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            request_timeout: default_request_timeout(),
            input_price_per_mtok: default_input_price(),
            output_price_per_mtok: default_output_price(),
        }
    }
}

impl AiConfig {
    /// Dollar cost of a call with the given usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_price_per_mtok
            + usage.output_tokens as f64 * self.output_price_per_mtok)
            / 1_000_000.0
    }
}

fn default_base_url() -> String { "https://api.anthropic.com".to_string() }
fn default_model() -> String { "claude-3-5-sonnet-20241022".to_string() }
fn default_api_version() -> String { "2023-06-01".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_max_retries() -> u32 { 3 }
fn default_base_delay() -> Duration { Duration::from_secs(1) }
fn default_request_timeout() -> Duration { Duration::from_secs(60) }
fn default_input_price() -> f64 { 3.0 }
fn default_output_price() -> f64 { 15.0 }

/// Something that can analyze an inspection photo.
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze_image(
        &self,
        image: &[u8],
        content_type: &str,
        context: &AnalysisContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<ImageAnalysis, AiError>;
}

/// Map aliases to a canonical supported media type.
fn normalize_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let essence = if essence == "image/jpg" { "image/jpeg".to_string() } else { essence };
    SUPPORTED_CONTENT_TYPES.iter().copied().find(|t| *t == essence)
}

/// Messages-API client.
#[derive(Clone)]
pub struct AiClient {
    http: reqwest::Client,
    config: AiConfig,
    endpoint: String,
}

impl AiClient {
    pub fn new(config: AiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                InspectorError::with_internal(
                    ErrorCode::ConfigurationError,
                    "Failed to build AI HTTP client",
                    e.to_string(),
                )
            })?;

        let endpoint = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));
        Ok(Self { http, config, endpoint })
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    fn build_request<'a>(
        &'a self,
        media_type: &'a str,
        data: &'a str,
        context: &AnalysisContext,
    ) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Image {
                        source: ImageSource {
                            kind: "base64",
                            media_type,
                            data,
                        },
                    },
                    ContentBlock::Text { text: context.prompt() },
                ],
            }],
        }
    }

    async fn send_once(&self, request: &MessagesRequest<'_>) -> std::result::Result<ImageAnalysis, AiError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|envelope| envelope.error.message)
                .unwrap_or(body);
            return Err(AiError::from_status(status.as_u16(), &message, retry_after));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidRequest(format!("Malformed AI response: {}", e)))?;

        let text = body
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        let parsed = parse_analysis_text(&text)?;
        Ok(ImageAnalysis {
            violations: parsed.violations,
            observations: parsed.observations,
            notes: parsed.notes,
            usage: body.usage,
            cost: self.config.cost(&body.usage),
            model: self.config.model.clone(),
        })
    }
}

#[async_trait]
impl ImageAnalyzer for AiClient {
    async fn analyze_image(
        &self,
        image: &[u8],
        content_type: &str,
        context: &AnalysisContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<ImageAnalysis, AiError> {
        let Some(media_type) = normalize_content_type(content_type) else {
            return Err(AiError::InvalidImage(format!(
                "Unsupported content type: {}",
                content_type
            )));
        };
        if image.is_empty() {
            return Err(AiError::InvalidImage("Image is empty".to_string()));
        }
        if self.config.api_key.is_empty() {
            return Err(AiError::Unauthorized("API key not configured".to_string()));
        }

        let data = base64::engine::general_purpose::STANDARD.encode(image);
        let backoff = ExponentialBackoff::new(self.config.base_delay);
        let mut attempt: u32 = 1;

        loop {
            // Rebuilt per attempt; the transport consumes the body
            let request = self.build_request(media_type, &data, context);
            let started = Instant::now();

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(AiError::Cancelled),
                result = self.send_once(&request) => result,
            };

            let error = match result {
                Ok(analysis) => {
                    AiMetrics::record_request(&self.config.model, "ok", started.elapsed());
                    AiMetrics::record_usage(
                        &analysis.model,
                        analysis.usage.input_tokens,
                        analysis.usage.output_tokens,
                        analysis.cost,
                    );
                    tracing::debug!(
                        image_id = %context.image_id,
                        attempt,
                        violations = analysis.violations.len(),
                        input_tokens = analysis.usage.input_tokens,
                        output_tokens = analysis.usage.output_tokens,
                        cost = analysis.cost,
                        "Image analyzed"
                    );
                    return Ok(analysis);
                }
                Err(AiError::Cancelled) => return Err(AiError::Cancelled),
                Err(error) => error,
            };

            AiMetrics::record_request(&self.config.model, error.kind(), started.elapsed());

            if !error.is_retryable() || attempt > self.config.max_retries {
                return Err(error);
            }

            let mut delay = backoff.delay_for_attempt(attempt);
            if let Some(retry_after) = error.retry_after() {
                delay = delay.max(retry_after);
            }

            AiMetrics::record_retry(error.kind());
            tracing::warn!(
                image_id = %context.image_id,
                attempt,
                max_retries = self.config.max_retries,
                retry_in = ?delay,
                error = %error,
                "AI request failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(AiError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
