//! Model service client for structured tag suggestions.
//!
//! Sends a chat-completion request constrained by a JSON schema and
//! returns the raw completion; interpreting the content (and classifying
//! unusable output as permanent) is the pipeline's job.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::tags::{FileTagPayload, TagPayload};

/// Sampling temperature for tag suggestions.
const TEMPERATURE: f32 = 0.2;
/// Retries after the first attempt.
const MAX_RETRIES: u32 = 2;
/// Base retry delay, multiplied by the attempt number.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// System message instructing structured tag output.
pub const SYSTEM_PROMPT: &str = "You are a repository analyst. Inspect the provided repository \
     context and respond with structured tags that match the supplied JSON schema: a \
     repository_tags array of {key, value, confidence} objects, and an optional file_tags array \
     scoping tags to individual file paths. Respond with JSON only.";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: serde_json::Value,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatCompletion {
    /// The assistant message content, if the service returned one.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.content.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub message: Option<ChatResponseMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<i64>,
    #[serde(default)]
    pub completion_tokens: Option<i64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
}

/// The tag structure the model is asked to produce.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelTagOutput {
    pub repository_tags: Vec<TagPayload>,
    #[serde(default)]
    pub file_tags: Vec<FileTagPayload>,
}

/// JSON-schema constraint for the completion: `repository_tags` required,
/// `file_tags` optional, confidences bounded to `[0, 1]`.
pub fn tag_response_schema() -> serde_json::Value {
    let tag_schema = json!({
        "type": "object",
        "required": ["key", "value"],
        "properties": {
            "key": { "type": "string" },
            "value": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "additionalProperties": false
    });

    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "repository_tags",
            "schema": {
                "type": "object",
                "required": ["repository_tags"],
                "properties": {
                    "repository_tags": { "type": "array", "items": tag_schema.clone() },
                    "file_tags": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["path", "tags"],
                            "properties": {
                                "path": { "type": "string" },
                                "tags": { "type": "array", "items": tag_schema }
                            },
                            "additionalProperties": false
                        }
                    }
                },
                "additionalProperties": false
            }
        }
    })
}

/// Trait for the model call, mockable in tests.
#[async_trait]
pub trait BaseTagModel: Send + Sync {
    /// Run one chat completion over the rendered prompt. Errors are
    /// transport-level (network or non-2xx) and therefore retryable.
    async fn suggest_tags(&self, prompt: &str) -> Result<ChatCompletion>;
}

/// Model service client using direct API calls.
pub struct ModelClient {
    client: Client,
    base_url: String,
    model: String,
}

impl ModelClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    async fn chat_completion(&self, prompt: &str) -> Result<ChatCompletion> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            response_format: tag_response_schema(),
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to model service")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Model service error: {} - {}", status, text);
        }

        response
            .json()
            .await
            .context("Failed to parse model service response")
    }
}

#[async_trait]
impl BaseTagModel for ModelClient {
    async fn suggest_tags(&self, prompt: &str) -> Result<ChatCompletion> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.chat_completion(prompt).await {
                Ok(completion) => return Ok(completion),
                Err(err) if attempt <= MAX_RETRIES => {
                    let delay = RETRY_BASE_DELAY * attempt;
                    warn!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
