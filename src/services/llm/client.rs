use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::core::config::{Config, LlmConfig};
use crate::core::errors::{ModelError, ModelResult};
use crate::core::types::ImagePayload;
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::services::llm::prompts::ANALYST_SYSTEM_PROMPT;
use crate::utils::Metrics;

/// Successful completion from a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub content: String,
    pub model: String,
}

/// Model-calling collaborator used by the dispatcher.
///
/// Any request-level retrying happens inside the implementation; an `Err`
/// here is a definite failure for this attempt.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn vision_model(&self) -> &str;

    fn text_model(&self) -> &str;

    /// `images` beyond `max_images` are dropped before the call.
    async fn call_vision(
        &self,
        prompt: &str,
        images: &[ImagePayload],
        max_images: usize,
    ) -> ModelResult<ModelReply>;

    async fn call_text(&self, prompt: &str) -> ModelResult<ModelReply>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Vision,
    Text,
}

/// Upper bound of a single backoff sleep between retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Client for OpenAI-compatible `/chat/completions` endpoints with retries,
/// circuit breakers and usage metrics.
///
/// Vision and text calls each have their own breaker: an outage of the
/// vision model must not fail the text fallback fast.
pub struct OpenAiClient {
    settings: LlmConfig,
    http_client: reqwest::Client,
    vision_breaker: CircuitBreaker,
    text_breaker: CircuitBreaker,
    metrics: Option<Metrics>,
    retry_base: Duration,
}

impl OpenAiClient {
    pub fn new(
        config: &Config,
        breaker_config: Option<CircuitBreakerConfig>,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.model_timeout())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let breaker_config = breaker_config.unwrap_or_default();
        Ok(Self {
            settings: config.llm.clone(),
            http_client,
            vision_breaker: CircuitBreaker::with_config(breaker_config.clone()),
            text_breaker: CircuitBreaker::with_config(breaker_config),
            metrics,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Base delay of the exponential backoff between retries
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn vision_breaker(&self) -> &CircuitBreaker {
        &self.vision_breaker
    }

    pub fn text_breaker(&self) -> &CircuitBreaker {
        &self.text_breaker
    }

    fn breaker(&self, kind: CallKind) -> &CircuitBreaker {
        match kind {
            CallKind::Vision => &self.vision_breaker,
            CallKind::Text => &self.text_breaker,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url)
    }

    async fn complete(
        &self,
        model: &str,
        messages: serde_json::Value,
        temperature: f32,
        kind: CallKind,
    ) -> ModelResult<ModelReply> {
        let breaker = self.breaker(kind);
        if !breaker.allow_request() {
            warn!("Circuit breaker for {} is open, failing fast", model);
            return Err(ModelError::CircuitOpen);
        }

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "stream": false,
        });

        let start = Instant::now();
        let result = self.send_with_retries(&body, model, kind).await;
        let elapsed = start.elapsed();

        match result {
            Ok((reply, input_tokens, output_tokens)) => {
                breaker.record_success();
                if let Some(ref m) = self.metrics {
                    m.record_model_call(model, true, elapsed, input_tokens, output_tokens);
                }
                debug!(
                    "{} replied with {} chars in {:.2}s",
                    model,
                    reply.content.len(),
                    elapsed.as_secs_f64()
                );
                Ok(reply)
            }
            Err(e) => {
                if counts_against_breaker(&e) && breaker.record_failure() {
                    warn!("Circuit breaker for {} tripped", model);
                    if let Some(ref m) = self.metrics {
                        m.record_circuit_breaker_trip();
                    }
                }
                if let Some(ref m) = self.metrics {
                    m.record_model_call(model, false, elapsed, 0, 0);
                }
                Err(e)
            }
        }
    }

    async fn send_with_retries(
        &self,
        body: &serde_json::Value,
        model: &str,
        kind: CallKind,
    ) -> ModelResult<(ModelReply, u64, u64)> {
        let max_retries = self.settings.max_retries;
        let url = self.endpoint();

        let mut attempt = 0;
        loop {
            match self.send_once(&url, body, model, kind).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < max_retries && is_retryable(&e) => {
                    debug!(
                        "Model request failed: {}. Retrying ({}/{})",
                        e,
                        attempt + 1,
                        max_retries
                    );
                    tokio::time::sleep(backoff_delay(self.retry_base, attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        body: &serde_json::Value,
        model: &str,
        kind: CallKind,
    ) -> ModelResult<(ModelReply, u64, u64)> {
        let mut request = self.http_client.post(url).json(body);
        if !self.settings.api_key.is_empty() {
            request = request.bearer_auth(&self.settings.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            // A rejected image will be rejected again; report it instead of retrying
            if kind == CallKind::Vision && status.as_u16() == 400 {
                return Err(ModelError::BadImageInput(error_text));
            }
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let response: serde_json::Value = response.json().await?;
        let (input_tokens, output_tokens) = extract_token_usage(&response);

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ModelError::InvalidResponse("missing choices[0].message.content".to_string())
            })?
            .trim();
        if content.is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        Ok((
            ModelReply {
                content: content.to_string(),
                model: model.to_string(),
            },
            input_tokens,
            output_tokens,
        ))
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn vision_model(&self) -> &str {
        &self.settings.vision_model
    }

    fn text_model(&self) -> &str {
        &self.settings.text_model
    }

    #[instrument(skip(self, prompt, images), fields(images = images.len()))]
    async fn call_vision(
        &self,
        prompt: &str,
        images: &[ImagePayload],
        max_images: usize,
    ) -> ModelResult<ModelReply> {
        if images.is_empty() {
            return Err(ModelError::NoImages);
        }

        let cap = max_images.max(1);
        if images.len() > cap {
            warn!("Post has {} images, sending the first {}", images.len(), cap);
        }

        let mut content = vec![json!({ "type": "text", "text": prompt })];
        content.extend(images.iter().take(cap).map(|image| {
            json!({
                "type": "image_url",
                "image_url": { "url": image.to_request_url() },
            })
        }));

        let messages = json!([{ "role": "user", "content": content }]);
        self.complete(
            &self.settings.vision_model,
            messages,
            self.settings.vision_temperature,
            CallKind::Vision,
        )
        .await
    }

    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    async fn call_text(&self, prompt: &str) -> ModelResult<ModelReply> {
        let messages = json!([
            { "role": "system", "content": ANALYST_SYSTEM_PROMPT },
            { "role": "user", "content": prompt },
        ]);
        self.complete(
            &self.settings.text_model,
            messages,
            self.settings.text_temperature,
            CallKind::Text,
        )
        .await
    }
}

/// Exponential backoff with jitter, capped at `MAX_RETRY_DELAY`
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let jitter = rand::random::<u64>() % base_ms.max(1);
    let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
    let delay = Duration::from_millis(base_ms.saturating_mul(factor).saturating_add(jitter));
    delay.min(MAX_RETRY_DELAY)
}

fn is_retryable(error: &ModelError) -> bool {
    match error {
        ModelError::Http(_) | ModelError::EmptyResponse => true,
        ModelError::Status { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

/// Only provider-side trouble should open the breaker, not bad input.
fn counts_against_breaker(error: &ModelError) -> bool {
    match error {
        ModelError::Http(_) => true,
        ModelError::Status { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

/// Extract token usage from an OpenAI-style response
fn extract_token_usage(response: &serde_json::Value) -> (u64, u64) {
    let usage = &response["usage"];
    let input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);

    (input_tokens, output_tokens)
}
