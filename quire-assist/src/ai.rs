//! Text-transform collaborator backed by a chat-completions endpoint.
//!
//! One request, one response, no state:
//! ```text
//! prompt ──► POST {model, messages:[{role:"user", content:prompt}], stream:false}
//!        ◄── choices[0].message.content
//! ```
//! Any transport, status, or shape failure collapses into
//! [`AssistError::Unavailable`]; the details only go to the log.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENDPOINT: &str = "https://open.bigmodel.cn/api/paas/v4/chat/completions";
pub const DEFAULT_MODEL: &str = "glm-4-flash";

/// Errors from the assist layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssistError {
    /// The upstream model could not be reached or answered nonsense.
    #[error("AI unavailable")]
    Unavailable,
    #[error("invalid AI configuration: {0}")]
    Config(String),
}

/// A single "transform text" call.
#[async_trait]
pub trait TextTransform: Send + Sync {
    async fn transform(&self, prompt: &str) -> Result<String, AssistError>;
}

/// Endpoint and credentials for [`ChatCompletionClient`].
#[derive(Clone)]
pub struct AiConfig {
    pub endpoint: String,
    pub model: String,
    /// Bearer credential
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AiConfig {
    /// Read `QUIRE_AI_ENDPOINT`, `QUIRE_AI_MODEL` and `QUIRE_AI_API_KEY`.
    /// Only the key is required.
    pub fn from_env() -> Result<Self, AssistError> {
        let api_key = std::env::var("QUIRE_AI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AssistError::Config("QUIRE_AI_API_KEY is not set".to_string()))?;
        let defaults = Self::default();
        Ok(Self {
            endpoint: std::env::var("QUIRE_AI_ENDPOINT").unwrap_or(defaults.endpoint),
            model: std::env::var("QUIRE_AI_MODEL").unwrap_or(defaults.model),
            api_key,
            timeout: defaults.timeout,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
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
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: String,
}

/// HTTPS chat-completions client.
pub struct ChatCompletionClient {
    config: AiConfig,
    http_client: reqwest::Client,
}

impl ChatCompletionClient {
    pub fn new(config: AiConfig) -> Result<Self, AssistError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("quire-assist/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AssistError::Config(e.to_string()))?;
        Ok(Self { config, http_client })
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }
}

#[async_trait]
impl TextTransform for ChatCompletionClient {
    async fn transform(&self, prompt: &str) -> Result<String, AssistError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: [ChatMessage { role: "user", content: prompt }],
            stream: false,
        };

        let response = self
            .http_client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                log::error!("AI request failed: {e}");
                AssistError::Unavailable
            })?;

        let status = response.status();
        if !status.is_success() {
            log::error!("AI endpoint returned {status}");
            return Err(AssistError::Unavailable);
        }

        let reply: ChatResponse = response.json().await.map_err(|e| {
            log::error!("AI response not understood: {e}");
            AssistError::Unavailable
        })?;

        reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                log::error!("AI response had no choices");
                AssistError::Unavailable
            })
    }
}
