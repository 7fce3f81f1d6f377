use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AIProvider {
    Together,
    Groq,
    Gemini,
}

impl AIProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            AIProvider::Together => "https://api.together.xyz/v1",
            AIProvider::Groq => "https://api.groq.com/openai/v1",
            AIProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            AIProvider::Together => "meta-llama/Llama-3.3-70B-Instruct-Turbo",
            AIProvider::Groq => "compound-beta",
            AIProvider::Gemini => "gemini-2.0-flash-exp",
        }
    }

    pub fn api_key_var(&self) -> &'static str {
        match self {
            AIProvider::Together => "TOGETHER_API_KEY",
            AIProvider::Groq => "GROQ_API_KEY",
            AIProvider::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl std::fmt::Display for AIProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AIProvider::Together => write!(f, "together"),
            AIProvider::Groq => write!(f, "groq"),
            AIProvider::Gemini => write!(f, "gemini"),
        }
    }
}

impl std::str::FromStr for AIProvider {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "together" | "togetherai" => Ok(AIProvider::Together),
            "groq" => Ok(AIProvider::Groq),
            "gemini" | "google" => Ok(AIProvider::Gemini),
            _ => Err(ProviderError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Unknown AI provider: {0}")]
    UnknownProvider(String),

    #[error("{0} API key is not configured")]
    MissingApiKey(AIProvider),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Worth another attempt: network trouble, timeouts, throttling, server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::InvalidResponse(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AIConfig {
    pub provider: AIProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl AIConfig {
    pub fn new(provider: AIProvider) -> Self {
        AIConfig {
            provider,
            model: provider.default_model().to_string(),
            api_key: None,
            base_url: None,
            max_tokens: Some(2000),
            temperature: Some(0.8),
            timeout_secs: 300,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

// Convenience functions for creating common message types
impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_used: Option<u32>,
    pub model: String,
}

pub struct AIProviderClient {
    config: AIConfig,
    http_client: reqwest::Client,
}

impl AIProviderClient {
    pub fn new(config: AIConfig) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(AIProviderClient { config, http_client })
    }

    pub async fn chat(&self, messages: Vec<ChatMessage>, system_prompt: Option<String>) -> Result<ChatResponse, ProviderError> {
        self.chat_with_retry(&messages, system_prompt.as_deref(), false).await
    }

    /// Ask for a JSON object reply. Only OpenAI-compatible providers enforce it.
    pub async fn chat_json(&self, messages: Vec<ChatMessage>, system_prompt: Option<String>) -> Result<ChatResponse, ProviderError> {
        self.chat_with_retry(&messages, system_prompt.as_deref(), true).await
    }

    /// Single short request; true on a 2xx answer.
    pub async fn test_connection(&self) -> bool {
        let mut check = self.config.clone();
        check.max_tokens = Some(10);
        let Ok(client) = AIProviderClient::new(check) else {
            return false;
        };
        match client.send(&[ChatMessage::user("こんにちは")], None, false).await {
            Ok(_) => true,
            Err(e) => {
                warn!("{} connection test failed: {}", self.config.provider, e);
                false
            }
        }
    }

    async fn chat_with_retry(&self, messages: &[ChatMessage], system_prompt: Option<&str>, json: bool) -> Result<ChatResponse, ProviderError> {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("{} request attempt {}/{}", self.config.provider, attempt, attempts);

            match self.send(messages, system_prompt, json).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("{} attempt {} failed: {}", self.config.provider, attempt, e);
                    let backoff = self.config.retry_delay_ms * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, messages: &[ChatMessage], system_prompt: Option<&str>, json: bool) -> Result<ChatResponse, ProviderError> {
        match self.config.provider {
            AIProvider::Together | AIProvider::Groq => self.chat_openai_compatible(messages, system_prompt, json).await,
            AIProvider::Gemini => self.chat_gemini(messages, system_prompt).await,
        }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or_else(|| self.config.provider.default_base_url())
            .trim_end_matches('/')
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(ProviderError::MissingApiKey(self.config.provider))
    }

    async fn chat_openai_compatible(&self, messages: &[ChatMessage], system_prompt: Option<&str>, json: bool) -> Result<ChatResponse, ProviderError> {
        let api_key = self.api_key()?;

        let mut request_messages = Vec::new();

        if let Some(system) = system_prompt {
            request_messages.push(serde_json::json!({
                "role": "system",
                "content": system
            }));
        }

        for msg in messages {
            request_messages.push(serde_json::json!({
                "role": msg.role,
                "content": msg.content
            }));
        }

        let mut request_body = serde_json::json!({
            "model": self.config.model,
            "messages": request_messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature
        });
        if json {
            request_body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let url = format!("{}/chat/completions", self.base_url());
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status: status.as_u16(), body });
        }

        let response_json: serde_json::Value = response.json().await?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{} response has no message content", self.config.provider)))?
            .trim()
            .to_string();

        let tokens_used = response_json["usage"]["total_tokens"].as_u64().map(|t| t as u32);

        Ok(ChatResponse {
            content,
            tokens_used,
            model: self.config.model.clone(),
        })
    }

    async fn chat_gemini(&self, messages: &[ChatMessage], system_prompt: Option<&str>) -> Result<ChatResponse, ProviderError> {
        let api_key = self.api_key()?;

        let contents: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                let role = if msg.role == "assistant" { "model" } else { "user" };
                serde_json::json!({
                    "role": role,
                    "parts": [{ "text": msg.content }]
                })
            })
            .collect();

        let mut request_body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_tokens
            }
        });
        if let Some(system) = system_prompt {
            request_body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }

        let url = format!("{}/models/{}:generateContent", self.base_url(), self.config.model);
        let response = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status: status.as_u16(), body });
        }

        let response_json: serde_json::Value = response.json().await?;

        let content = response_json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("gemini response has no text".to_string()))?
            .to_string();

        let tokens_used = response_json["usageMetadata"]["totalTokenCount"].as_u64().map(|t| t as u32);

        Ok(ChatResponse {
            content,
            tokens_used,
            model: self.config.model.clone(),
        })
    }
}
