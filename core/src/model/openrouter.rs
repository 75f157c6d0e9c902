//! OpenRouter backend (OpenAI-compatible chat completions).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secrets::Secret;

use super::{FinishReason, ModelProvider, ModelRequest, ModelResponse, ProviderError, TokenUsage};

/// Provider messages meaning "this model cannot serve you now, try another".
const MODEL_UNAVAILABLE_MARKERS: &[&str] = &[
    "no endpoints found",
    "insufficient credits",
    "no models provided",
    "provider returned error",
];

/// Provider messages meaning "slow down".
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate-limited", "temporarily rate-limited"];

/// Runner for the OpenRouter chat completions endpoint.
pub struct OpenRouterProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Secret,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: String,
}

impl OpenRouterProvider {
    /// Creates a provider for the given base URL (e.g. `https://openrouter.ai/api/v1`).
    pub fn new(base_url: &str, api_key: Secret, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("code-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    fn build_body<'a>(&self, request: &'a ModelRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &request.model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_text,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt_text,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

/// Parses a `Retry-After` header given in seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps an error status and body to a provider error.
fn classify_failure(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    let lower = body.to_lowercase();
    let message = truncate(body, 500);

    if status == 429 || RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ProviderError::RateLimited {
            retry_after,
            message,
        };
    }
    if status >= 500 {
        return ProviderError::Server { status, message };
    }
    if status == 402
        || status == 404
        || MODEL_UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m))
    {
        return ProviderError::ModelUnavailable { status, message };
    }
    ProviderError::Rejected { status, message }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Turns a decoded body into a response, surfacing in-band errors.
fn interpret(body: ChatResponse, model_id: &str) -> std::result::Result<ModelResponse, ProviderError> {
    if let Some(error) = body.error {
        let status = error
            .code
            .as_ref()
            .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(502);
        return Err(classify_failure(status, &error.message, None));
    }

    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("response has no choices".to_string()))?;

    Ok(ModelResponse {
        raw_text: choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default(),
        finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        token_usage: body.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
        model_id: model_id.to_string(),
    })
}

#[async_trait]
impl ModelProvider for OpenRouterProvider {
    async fn complete(
        &self,
        request: &ModelRequest,
    ) -> std::result::Result<ModelResponse, ProviderError> {
        let body = self.build_body(request);

        tracing::debug!(
            endpoint = %self.endpoint,
            model = %request.model_id,
            prompt_chars = request.prompt_text.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .header("X-Title", "code-agent")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Network(format!("timed out: {}", e.without_url()))
                } else {
                    ProviderError::Network(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &text, retry_after));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.without_url().to_string()))?;

        interpret(parsed, &request.model_id)
    }

    fn name(&self) -> &str {
        "openrouter"
    }
}
