use crate::error::{ChatError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// One free-text prompt in, one completion out
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// OpenAI-compatible chat completions client
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl LlmClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(ChatError::Config("OPENAI_API_KEY is not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
            temperature: 0.0,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": self.temperature,
        });

        debug!("Calling {} with a {}-char prompt", self.model, prompt.len());
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChatError::Llm(format!("Failed to read LLM response: {}", e)))?;

        let parsed: Option<ChatResponse> = serde_json::from_str(&text).ok();
        if !status.is_success() {
            let message = parsed
                .and_then(|r| r.error)
                .map(|e| e.message)
                .unwrap_or(text);
            return Err(ChatError::Llm(format!("LLM API returned {}: {}", status, message)));
        }

        let parsed = parsed.ok_or_else(|| ChatError::Llm("Failed to parse LLM response".to_string()))?;
        if let Some(err) = parsed.error {
            return Err(ChatError::Llm(err.message));
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Llm("LLM response has no choices".to_string()))?;
        if choice.finish_reason.as_deref() == Some("length") {
            warn!("LLM completion from {} was cut off at the token limit", self.model);
        }

        let content = choice
            .message
            .and_then(|m| m.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ChatError::Llm("No content in LLM response".to_string()))?;

        Ok(content)
    }
}

#[async_trait]
impl TextCompletion for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.call_llm(prompt).await
    }
}

/// Language tags a model may put right after the opening fence
const FENCE_LANGUAGE_TAGS: &[&str] = &["sql", "bigquery", "googlesql"];

/// Extracts the body of the first fenced code block, or returns the text
/// trimmed when there is no fence.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_fence = &trimmed[open + 3..];
    // a known language tag is dropped whether the SQL follows on the same line or the next
    let tag_end = after_fence
        .find(|c: char| c.is_whitespace() || c == '`')
        .unwrap_or(after_fence.len());
    let tag = &after_fence[..tag_end];
    let body = if FENCE_LANGUAGE_TAGS.iter().any(|t| tag.eq_ignore_ascii_case(t)) {
        &after_fence[tag_end..]
    } else {
        after_fence
    };
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim().to_string()
}
