//! Model clients.
//!
//! [`ModelClient`] is the seam between the harness and a remote model. The
//! shipped implementation, [`OpenAiClient`], speaks the chat completions
//! protocol over HTTP. Failures are classified into [`LlmErrorKind`]s so the
//! retry controller can tell transient errors from fatal ones.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::config::{ModelConfig, ReasoningEffort};
use crate::error::{EvalError, LlmErrorKind, Result};
use crate::prompt::{Conversation, Role, TurnKind};

/// A model reply with usage accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Reply text.
    pub text: String,
    /// Tokens in the request.
    pub prompt_tokens: u32,
    /// Tokens in the reply.
    pub completion_tokens: u32,
    /// Wall-clock duration of the request in milliseconds.
    pub duration_ms: u64,
}

/// A remote code generation model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier recorded in the scorecard.
    fn model_id(&self) -> &str;

    /// Sends the whole conversation and returns the next assistant reply.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::LlmApiError`; its kind decides whether the call
    /// may be repeated.
    async fn generate(&self, conversation: &Conversation) -> Result<Completion>;
}

// ============================================================================
// OpenAI-compatible client
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

/// Chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    reasoning_effort: Option<ReasoningEffort>,
    preamble_as_user: bool,
}

impl OpenAiClient {
    /// Creates a client for `model` using the configured endpoint and timeout.
    ///
    /// The reasoning effort is only sent for models listed in
    /// `reasoningModels`.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::LlmApiError` if the HTTP client cannot be built.
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, config: &ModelConfig) -> Result<Self> {
        Self::with_timeout(model, api_key, config, config.timeout())
    }

    /// Like [`OpenAiClient::new`] with an explicit request timeout.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::LlmApiError` if the HTTP client cannot be built.
    pub fn with_timeout(
        model: impl Into<String>,
        api_key: impl Into<String>,
        config: &ModelConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let model = model.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvalError::llm_api_error(LlmErrorKind::Network, e.to_string()))?;
        let reasoning_effort = config
            .reasoning_effort
            .filter(|_| config.is_reasoning_model(&model));

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: api_key.into(),
            model,
            reasoning_effort,
            preamble_as_user: config.preamble_as_user,
        })
    }

    fn payload(&self, conversation: &Conversation) -> Value {
        let messages: Vec<Value> = conversation
            .turns()
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::System if self.preamble_as_user && turn.kind == TurnKind::Preamble => {
                        "user"
                    }
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": turn.text })
            })
            .collect();

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(effort) = self.reasoning_effort {
            payload["reasoning_effort"] = json!(effort.as_str());
        }
        payload
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, conversation), fields(model = %self.model, turns = conversation.len()))]
    async fn generate(&self, conversation: &Conversation) -> Result<Completion> {
        let started = Instant::now();
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.payload(conversation))
            .send()
            .await
            .map_err(|e| EvalError::llm_api_error(classify_transport(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status);
            warn!(%status, %kind, "Model request failed");
            return Err(EvalError::llm_api_error(
                kind,
                format!("HTTP {status}: {}", truncate(&body, 320)),
            ));
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            let kind = if e.is_timeout() {
                LlmErrorKind::Timeout
            } else {
                LlmErrorKind::MalformedResponse
            };
            EvalError::llm_api_error(kind, format!("invalid response body: {e}"))
        })?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                EvalError::llm_api_error(
                    LlmErrorKind::MalformedResponse,
                    "response did not include any message content",
                )
            })?;

        let (prompt_tokens, completion_tokens) = body.usage.map_or((0, 0), |usage| {
            (to_u32(usage.prompt_tokens), to_u32(usage.completion_tokens))
        });
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(prompt_tokens, completion_tokens, duration_ms, "Model replied");

        Ok(Completion {
            text: text.trim().to_string(),
            prompt_tokens,
            completion_tokens,
            duration_ms,
        })
    }
}

/// Maps a non-success HTTP status to an error kind.
#[must_use]
pub fn classify_status(status: StatusCode) -> LlmErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmErrorKind::Authentication,
        StatusCode::TOO_MANY_REQUESTS => LlmErrorKind::RateLimit,
        StatusCode::REQUEST_TIMEOUT => LlmErrorKind::Timeout,
        s if s.is_server_error() => LlmErrorKind::Server,
        _ => LlmErrorKind::InvalidRequest,
    }
}

fn classify_transport(error: &reqwest::Error) -> LlmErrorKind {
    if error.is_timeout() {
        LlmErrorKind::Timeout
    } else {
        LlmErrorKind::Network
    }
}

fn to_u32(value: Option<u64>) -> u32 {
    value.map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX))
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_string(),
    }
}
