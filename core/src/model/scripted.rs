//! Scripted provider that replays canned answers.
//!
//! Used for dry runs (`model.provider = "scripted"`) and by tests that need
//! to count calls or inspect the prompts that were sent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{FinishReason, ModelProvider, ModelRequest, ModelResponse, ProviderError};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Answer with this text and finish reason.
    Respond {
        text: String,
        finish_reason: FinishReason,
    },
    /// Fail with this provider error.
    Fail(ProviderError),
}

impl ScriptedReply {
    /// A normal answer that stopped on its own.
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Respond {
            text: text.into(),
            finish_reason: FinishReason::Stop,
        }
    }
}

/// Provider returning queued replies in order.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    requests: Mutex<Vec<ModelRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    /// Creates a provider that replays `replies`, then fails with a 503.
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: ScriptedReply::Fail(ProviderError::Server {
                status: 503,
                message: "scripted replies exhausted".to_string(),
            }),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Creates a provider answering with the given texts.
    pub fn from_texts(texts: impl IntoIterator<Item = String>) -> Self {
        Self::new(texts.into_iter().map(ScriptedReply::text).collect())
    }

    /// Sets the reply used once the queue is empty.
    pub fn with_fallback(mut self, reply: ScriptedReply) -> Self {
        self.fallback = reply;
        self
    }

    /// Delays every reply, to exercise timeouts and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.fallback.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            ScriptedReply::Respond {
                text,
                finish_reason,
            } => Ok(ModelResponse {
                raw_text: text,
                finish_reason,
                token_usage: None,
                model_id: request.model_id.clone(),
            }),
            ScriptedReply::Fail(err) => Err(err),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
