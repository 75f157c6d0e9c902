//! Model client adapter.
//!
//! Backends implement [`ModelProvider`]; [`ModelClient`] wraps one with a
//! per-call timeout, exponential backoff on transient failures, a model
//! fallback chain and response-shape validation.

mod openrouter;
mod scripted;

pub use openrouter::OpenRouterProvider;
pub use scripted::{ScriptedProvider, ScriptedReply};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::ExponentialBackoff;
use crate::config::{AgentConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::secrets::Redactor;
use crate::task::TaskRef;

/// One request to the model, created per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub task_ref: TaskRef,
    /// Fixed instruction sent as the system message.
    pub system_text: String,
    pub prompt_text: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelRequest {
    /// Returns a copy of this request addressed to a different model.
    pub fn for_model(&self, model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..self.clone()
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    /// Anything else the provider reported (or nothing at all).
    Other(String),
}

impl FinishReason {
    /// Maps a provider finish reason string.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            Some("stop") | Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls") | Some("tool_use") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Other(other.to_string()),
            None => FinishReason::Other(String::new()),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, FinishReason::Other(_))
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A model answer, owned by the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub raw_text: String,
    pub finish_reason: FinishReason,
    pub token_usage: Option<TokenUsage>,
    /// Model that actually answered (may be a fallback).
    pub model_id: String,
}

impl ModelResponse {
    /// Checks the response shape: non-empty text and a recognized finish reason.
    pub fn validate(&self) -> Result<()> {
        if self.raw_text.trim().is_empty() {
            return Err(Error::MalformedResponse(format!(
                "model {} returned empty text",
                self.model_id
            )));
        }
        if let FinishReason::Other(reason) = &self.finish_reason {
            return Err(Error::MalformedResponse(format!(
                "model {} returned unrecognized finish_reason '{}'",
                self.model_id, reason
            )));
        }
        Ok(())
    }
}

/// Failure reported by a provider backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// HTTP 429 or an equivalent provider message.
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// HTTP 5xx.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),
    /// The call did not finish within the per-call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// This model cannot serve the request right now (no endpoints, no credits).
    #[error("model unavailable ({status}): {message}")]
    ModelUnavailable { status: u16, message: String },
    /// The request itself was refused (bad key, bad payload).
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The body could not be decoded.
    #[error("undecodable response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Errors worth retrying against the same model.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Server { .. }
                | ProviderError::Network(_)
                | ProviderError::Timeout(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Capability set every model backend provides.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Sends one request and returns the raw answer.
    async fn complete(
        &self,
        request: &ModelRequest,
    ) -> std::result::Result<ModelResponse, ProviderError>;

    /// Returns the name of this provider.
    fn name(&self) -> &str;
}

/// Builds the provider variant selected in the configuration.
pub fn provider_from_config(config: &AgentConfig) -> Result<Arc<dyn ModelProvider>> {
    let settings = &config.tuning.model;
    match settings.provider {
        ProviderKind::OpenRouter => Ok(Arc::new(OpenRouterProvider::new(
            &settings.base_url,
            config.openrouter_api_key.clone(),
            settings.request_timeout(),
        )?)),
        ProviderKind::Scripted => Ok(Arc::new(ScriptedProvider::from_texts(
            settings.scripted_responses.iter().cloned(),
        ))),
    }
}

/// Provider-agnostic adapter used by the run controller.
pub struct ModelClient {
    provider: Arc<dyn ModelProvider>,
    fallback_models: Vec<String>,
    max_calls_per_model: u32,
    timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    redactor: Redactor,
}

impl ModelClient {
    /// Creates an adapter with default limits and no fallback models.
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            fallback_models: Vec::new(),
            max_calls_per_model: 4,
            timeout: Duration::from_secs(120),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            redactor: Redactor::new(),
        }
    }

    /// Creates an adapter wired from the agent configuration.
    pub fn from_config(config: &AgentConfig, provider: Arc<dyn ModelProvider>) -> Self {
        let settings = &config.tuning.model;
        Self::new(provider)
            .with_fallback_models(config.model_chain().into_iter().skip(1).collect())
            .with_max_calls_per_model(settings.max_provider_retries)
            .with_timeout(settings.request_timeout())
            .with_backoff(settings.backoff_initial(), settings.backoff_max())
            .with_redactor(Redactor::with_secrets(config.secrets()))
    }

    /// Sets the models tried after the request's own model is exhausted.
    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    /// Sets how many calls one model gets before the adapter moves on.
    pub fn with_max_calls_per_model(mut self, calls: u32) -> Self {
        self.max_calls_per_model = calls.max(1);
        self
    }

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Sets the redactor applied to provider error text.
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Returns the name of the wrapped provider.
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Sends a request, retrying transient failures and falling back across models.
    pub async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let mut models = vec![request.model_id.clone()];
        for model in &self.fallback_models {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }

        let mut last_error: Option<ProviderError> = None;

        for model in &models {
            let attempt_request = request.for_model(model);
            let mut backoff = ExponentialBackoff::new(self.backoff_initial, self.backoff_max);

            for call in 1..=self.max_calls_per_model {
                tracing::info!(
                    provider = %self.provider.name(),
                    model = %model,
                    call,
                    "calling model"
                );

                let outcome =
                    match tokio::time::timeout(self.timeout, self.provider.complete(&attempt_request))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ProviderError::Timeout(self.timeout)),
                    };

                match outcome {
                    Ok(response) => {
                        response.validate()?;
                        if let Some(usage) = response.token_usage {
                            tracing::info!(
                                model = %response.model_id,
                                prompt_tokens = usage.prompt_tokens,
                                completion_tokens = usage.completion_tokens,
                                "model call complete"
                            );
                        }
                        return Ok(response);
                    }
                    Err(ProviderError::Malformed(message)) => {
                        return Err(Error::MalformedResponse(self.redactor.redact(&message)));
                    }
                    Err(ProviderError::Rejected { status, message }) => {
                        let message = self.redactor.redact(&message);
                        tracing::error!(model = %model, status, error = %message, "model request rejected");
                        return Err(Error::ProviderUnavailable(format!(
                            "request rejected with status {}: {}",
                            status, message
                        )));
                    }
                    Err(err) if err.is_transient() => {
                        let message = self.redactor.redact(&err.to_string());
                        if call == self.max_calls_per_model {
                            tracing::warn!(model = %model, error = %message, "model exhausted retries");
                            last_error = Some(err);
                            break;
                        }
                        let delay = backoff.step_with_hint(err.retry_after());
                        tracing::warn!(
                            model = %model,
                            error = %message,
                            delay_ms = delay.as_millis() as u64,
                            "transient model failure, retrying"
                        );
                        last_error = Some(err);
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        tracing::warn!(
                            model = %model,
                            error = %self.redactor.redact(&err.to_string()),
                            "model unavailable, trying next model"
                        );
                        last_error = Some(err);
                        break;
                    }
                }
            }
        }

        let detail = last_error
            .map(|e| self.redactor.redact(&e.to_string()))
            .unwrap_or_else(|| "no model configured".to_string());
        Err(Error::ProviderUnavailable(format!(
            "all models failed ({}); last error: {}",
            models.join(", "),
            detail
        )))
    }
}
