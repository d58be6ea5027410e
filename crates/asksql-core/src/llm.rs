//! Completion providers.
//!
//! The pipeline only sees [`CompletionProvider`]. Which backend answers is
//! decided once, from configuration, by [`provider_from_config`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One prompt sent to a completion backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 2000,
            temperature: 0.1,
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Why a completion call failed.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("provider returned no text")]
    Empty,

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for CompletionError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs can carry credentials; keep them out of logs.
        CompletionError::Transport(err.without_url())
    }
}

impl CompletionError {
    /// Rate limits, server errors and connection trouble are worth one retry.
    pub fn is_transient(&self) -> bool {
        match self {
            CompletionError::Status { status, .. } => *status == 429 || *status >= 500,
            CompletionError::Transport(e) => e.is_timeout() || e.is_connect(),
            CompletionError::Empty | CompletionError::Other(_) => false,
        }
    }
}

/// Capability: given a prompt and options, return completion text.
pub trait CompletionProvider: Send + Sync {
    /// Provider family name, for logs and the service banner.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, std::result::Result<String, CompletionError>>;
}

/// Build the configured provider, wrapped with a single retry.
pub fn provider_from_config(config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    let base = |default: &str| {
        if config.base_url.trim().is_empty() {
            default.to_string()
        } else {
            config.base_url.trim_end_matches('/').to_string()
        }
    };
    let backoff = Duration::from_millis(config.retry_backoff_ms);

    let provider: Arc<dyn CompletionProvider> = match config.provider.to_lowercase().as_str() {
        "openai" => Arc::new(Retrying::new(
            OpenAiCompatible::new(client, "openai", base(OPENAI_BASE_URL), config),
            backoff,
        )),
        "groq" => Arc::new(Retrying::new(
            OpenAiCompatible::new(client, "groq", base(GROQ_BASE_URL), config),
            backoff,
        )),
        "ollama" => Arc::new(Retrying::new(
            OpenAiCompatible::new(client, "ollama", base(OLLAMA_BASE_URL), config),
            backoff,
        )),
        "gemini" => Arc::new(Retrying::new(
            Gemini::new(client, base(GEMINI_BASE_URL), config),
            backoff,
        )),
        other => {
            return Err(Error::Config(format!(
                "unknown llm provider '{other}' (expected openai, groq, ollama or gemini)"
            )));
        }
    };

    tracing::info!(
        provider = provider.name(),
        model = provider.model(),
        "completion provider ready"
    );
    Ok(provider)
}

// =============================================================================
// OpenAI-compatible chat completions
// =============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// `{base}/chat/completions` backends: OpenAI, Groq and Ollama's `/v1` API.
pub struct OpenAiCompatible {
    client: Client,
    name: &'static str,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatible {
    fn new(client: Client, name: &'static str, base_url: String, config: &LlmConfig) -> Self {
        Self {
            client,
            name,
            base_url,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
        }
    }

    async fn call(&self, request: &CompletionRequest) -> std::result::Result<String, CompletionError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = req.send().await?;
        let res = check_status(res).await?;
        let parsed: ChatResponse = res.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(CompletionError::Empty)
    }
}

impl CompletionProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, std::result::Result<String, CompletionError>> {
        self.call(request).boxed()
    }
}

// =============================================================================
// Gemini generateContent
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Google Gemini `models/{model}:generateContent`.
pub struct Gemini {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Gemini {
    fn new(client: Client, base_url: String, config: &LlmConfig) -> Self {
        Self {
            client,
            base_url,
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
        }
    }

    fn request(&self, request: &CompletionRequest) -> reqwest::RequestBuilder {
        let text = format!("{}\n\n{}", request.system, request.prompt);
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: &text }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        };

        self.client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
    }

    async fn call(&self, request: &CompletionRequest) -> std::result::Result<String, CompletionError> {
        let res = self.request(request).send().await?;
        let res = check_status(res).await?;
        let parsed: GeminiResponse = res.json().await?;
        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(CompletionError::Empty)
    }
}

impl CompletionProvider for Gemini {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, std::result::Result<String, CompletionError>> {
        self.call(request).boxed()
    }
}

async fn check_status(
    res: reqwest::Response,
) -> std::result::Result<reqwest::Response, CompletionError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(CompletionError::Status {
        status: status.as_u16(),
        body: truncate_body(&body),
    })
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 300;
    if body.chars().count() > LIMIT {
        format!("{}...", body.chars().take(LIMIT).collect::<String>())
    } else {
        body.to_string()
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retries a transient failure exactly once after `backoff`.
pub struct Retrying<P> {
    inner: P,
    backoff: Duration,
}

impl<P: CompletionProvider> Retrying<P> {
    pub fn new(inner: P, backoff: Duration) -> Self {
        Self { inner, backoff }
    }
}

impl<P: CompletionProvider> CompletionProvider for Retrying<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, std::result::Result<String, CompletionError>> {
        async move {
            match self.inner.complete(request).await {
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        provider = self.inner.name(),
                        error = %e,
                        backoff_ms = self.backoff.as_millis(),
                        "transient completion failure, retrying once"
                    );
                    tokio::time::sleep(self.backoff).await;
                    self.inner.complete(request).await
                }
                other => other,
            }
        }
        .boxed()
    }
}

#[cfg(any(test, feature = "test-util"))]
mod scripted;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptedProvider, ScriptedReply};

#[cfg(test)]
#[path = "llm_tests.rs"]
mod tests;
