//! [`OpenAiReasoner`] – OpenAI-compatible Reasoner adapter.
//!
//! Talks to any server exposing `/v1/chat/completions` (OpenAI, Ollama at
//! `http://localhost:11434`, vLLM, llama.cpp server …).  Each call sends the
//! fused prompt as a system + user message pair and passes the action JSON
//! Schema through `response_format` so the model emits strictly typed calls.
//!
//! Models still wrap JSON in Markdown fences or chatter around it; the reply
//! is cleaned with [`extract_json`] before it is handed back to the core.
//!
//! Registered under the reasoner type name `openai`:
//!
//! | Config key | Meaning |
//! |---|---|
//! | `model` | Model name (required). |
//! | `base_url` | Server base URL (default `http://localhost:11434`). |
//! | `api_key` | Bearer token (optional). |
//! | `temperature` | Sampling temperature (optional). |
//!
//! # Example
//!
//! ```rust,no_run
//! use cortex_runtime::llm_driver::OpenAiReasoner;
//!
//! let reasoner = OpenAiReasoner::new("http://localhost:11434", "llama3");
//! // Requires a running model server – skipped in unit tests.
//! // let reply = reasoner.ask(system, user, &schema).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use cortex_kernel::extract_json;
use cortex_plugin::{Reasoner, RegistryBuilder};
use cortex_types::{CortexError, PluginDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

/// Default server: a local Ollama instance.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Reasoner type name under which [`OpenAiReasoner`] is registered.
pub const OPENAI_TYPE: &str = "openai";

/// Why a chat-completions call produced no usable reply.
#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    /// Non-2xx answer; `body` is the start of what the server said.
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model refused: {0}")]
    Refused(String),
    #[error("reply carried no message content")]
    EmptyReply,
}

impl From<CompletionError> for CortexError {
    fn from(err: CompletionError) -> Self {
        CortexError::ReasonerFailed(err.to_string())
    }
}

/// Longest slice of an error body kept in [`CompletionError::Status`].
const ERROR_BODY_LIMIT: usize = 512;

/// The two-message body a tick sends.
#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [PromptMessage<'a>; 2],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    response_format: Value,
}

#[derive(Serialize)]
struct PromptMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
}

#[derive(Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

impl CompletionReply {
    fn into_text(self) -> Result<String, CompletionError> {
        let message = self
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(CompletionError::EmptyReply)?;
        if let Some(reason) = message.refusal.filter(|r| !r.trim().is_empty()) {
            return Err(CompletionError::Refused(reason));
        }
        message.content.ok_or(CompletionError::EmptyReply)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAiReasoner
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once per mode and reuse across ticks.
#[derive(Clone)]
pub struct OpenAiReasoner {
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiReasoner")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field(
                "api_key",
                if self.api_key.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl OpenAiReasoner {
    /// Create a reasoner pointing at `base_url` and using `model`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            temperature: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Build from a reasoner [`PluginDescriptor`].
    ///
    /// # Errors
    ///
    /// [`CortexError::MissingConfigKey`] when `model` is absent.
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> Result<Self, CortexError> {
        let model = descriptor.require_str("model")?;
        let base_url = descriptor.str_setting("base_url").unwrap_or(DEFAULT_BASE_URL);
        let mut reasoner = Self::new(base_url, model);
        if let Some(key) = descriptor.str_setting("api_key") {
            reasoner = reasoner.with_api_key(key);
        }
        if let Some(t) = descriptor.config.get("temperature").and_then(Value::as_f64) {
            reasoner = reasoner.with_temperature(t);
        }
        Ok(reasoner)
    }

    /// Register the `openai` reasoner type.
    pub fn register(builder: &mut RegistryBuilder) {
        builder.reasoner(OPENAI_TYPE, |descriptor| {
            Ok(Arc::new(OpenAiReasoner::from_descriptor(descriptor)?) as Arc<dyn Reasoner>)
        });
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request<'a>(&'a self, system: &'a str, user: &'a str, action_schema: &Value) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages: [
                PromptMessage { role: "system", content: system },
                PromptMessage { role: "user", content: user },
            ],
            stream: false,
            temperature: self.temperature,
            response_format: json!({
                "type": "json_schema",
                "json_schema": {"name": "action_calls", "schema": action_schema},
            }),
        }
    }

    /// Send the prompt and return the assistant's raw reply text.
    ///
    /// # Errors
    ///
    /// [`CompletionError`] for transport failures, non-2xx answers, refusals
    /// and replies without content.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        action_schema: &Value,
    ) -> Result<String, CompletionError> {
        let endpoint = self.endpoint();
        let transport = |source: reqwest::Error| CompletionError::Transport {
            endpoint: endpoint.clone(),
            source,
        };
        let mut request = self
            .client
            .post(&endpoint)
            .json(&self.request(system, user, action_schema));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body: clip(&body, ERROR_BODY_LIMIT).to_string(),
            });
        }
        let reply: CompletionReply = response.json().await.map_err(transport)?;
        reply.into_text()
    }
}

/// `text` cut to at most `limit` bytes on a char boundary.
fn clip(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let cut = (0..=limit).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
    &text[..cut]
}

#[async_trait]
impl Reasoner for OpenAiReasoner {
    fn name(&self) -> &str {
        &self.model
    }

    async fn ask(
        &self,
        system_context: &str,
        user_content: &str,
        action_schema: &Value,
    ) -> Result<Value, CortexError> {
        let reply = self.complete(system_context, user_content, action_schema).await?;
        debug!(model = %self.model, bytes = reply.len(), "reasoner replied");
        if reply.trim().is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        extract_json(&reply).ok_or_else(|| {
            CortexError::ReasonerFailed(format!("reply contains no JSON: {}", reply.trim()))
        })
    }
}
