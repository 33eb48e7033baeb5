use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::http_client;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub stream: bool,
}

/// What the worker keeps from a completion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatCompletion {
    pub reply: Option<String>,
    pub usage: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("inference endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("inference response malformed: {0}")]
    Decode(String),
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn complete(&self, req: &ChatCompletionRequest) -> Result<ChatCompletion, InferenceError>;
}

/// OpenAI-compatible `/v1/chat/completions` client (llama.cpp server and friends).
pub struct LlamaClient {
    http: reqwest::Client,
    url: String,
}

impl LlamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            http: http_client::client_with_timeout(timeout)?,
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl InferenceBackend for LlamaClient {
    async fn complete(&self, req: &ChatCompletionRequest) -> Result<ChatCompletion, InferenceError> {
        let resp = self.http.post(&self.url).json(req).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let doc: Value =
            serde_json::from_str(&body).map_err(|err| InferenceError::Decode(err.to_string()))?;
        Ok(ChatCompletion {
            reply: doc
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: doc.get("usage").filter(|u| !u.is_null()).cloned(),
        })
    }
}
