use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde_json::{json, Value};
use storefront_config::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Request(String),
    #[error("completion endpoint answered with status {0}")]
    Status(u16),
    #[error("completion response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct TextCompletion {
    pub system: String,
    pub context: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct VisionCompletion {
    pub instruction: String,
    pub image_url: String,
    pub deep: bool,
}

/// Black-box model calls. Exactly one attempt per call; callers decide how to degrade.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete_text(&self, request: TextCompletion) -> Result<String, CompletionError>;
    async fn complete_vision(&self, request: VisionCompletion) -> Result<String, CompletionError>;
}

/// Client for any endpoint speaking the chat-completions JSON shape.
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    api_key: Option<Secret<String>>,
    operator_model: String,
    vision_model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.completion.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let api_key = std::env::var(&cfg.completion.api_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(Secret::new);
        if api_key.is_none() {
            tracing::warn!(
                env = %cfg.completion.api_key_env,
                "completion api key not set, requests will be unauthenticated"
            );
        }
        Ok(Self {
            client,
            endpoint: cfg.completion.endpoint.clone(),
            api_key,
            operator_model: cfg.completion.operator_model.clone(),
            vision_model: cfg.completion.vision_model.clone(),
        })
    }

    async fn post(&self, body: Value) -> Result<String, CompletionError> {
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CompletionError::Status(response.status().as_u16()));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        first_choice_content(&payload)
    }
}

fn first_choice_content(payload: &Value) -> Result<String, CompletionError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| CompletionError::Malformed("no choices[0].message.content".to_string()))
}

#[async_trait]
impl CompletionService for OpenAiCompatibleClient {
    async fn complete_text(&self, request: TextCompletion) -> Result<String, CompletionError> {
        let body = json!({
            "model": self.operator_model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "system", "content": format!("CONTEXT:\n{}", request.context) },
                { "role": "user", "content": request.user },
            ],
            "temperature": 0.12,
            "max_completion_tokens": 1800,
            "stream": false,
        });
        self.post(body).await
    }

    async fn complete_vision(&self, request: VisionCompletion) -> Result<String, CompletionError> {
        let (temperature, max_tokens) = if request.deep { (0.2, 1400) } else { (0.3, 700) };
        let body = json!({
            "model": self.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": request.instruction },
                    { "type": "image_url", "image_url": { "url": request.image_url } },
                ],
            }],
            "temperature": temperature,
            "max_completion_tokens": max_tokens,
            "stream": false,
        });
        self.post(body).await
    }
}
