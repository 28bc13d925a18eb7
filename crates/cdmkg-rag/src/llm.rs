//! LLM Client implementations
//!
//! OpenAI-compatible and Ollama clients. HTTP failures are classified so
//! that rate limits, server errors and network trouble surface as
//! `KgError::TransientService` and can be retried by the extractor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdmkg_core::{KgError, LlmClient, LlmConfig, LlmProvider, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// Error Classification
// ============================================================================

/// Whether an HTTP status is worth retrying
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn status_error(provider: &str, status: StatusCode, body: &str) -> KgError {
    let message = format!("{provider} returned {status}: {}", truncate(body, 500));
    if is_retryable_status(status) {
        KgError::TransientService(message)
    } else {
        KgError::Llm(message)
    }
}

fn request_error(provider: &str, e: reqwest::Error) -> KgError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        KgError::TransientService(format!("{provider} request failed: {e}"))
    } else {
        KgError::Llm(format!("{provider} request failed: {e}"))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| KgError::Llm(format!("Failed to build HTTP client: {e}")))
}

// ============================================================================
// OpenAI Client
// ============================================================================

/// OpenAI API client
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl OpenAiClient {
    /// Create a new OpenAI client
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| KgError::Config("OpenAI API key required".to_string()))?;

        let base_url = config
            .openai_base_url
            .clone()
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: api_key.clone(),
            base_url,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = OpenAiRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("OpenAI", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error("OpenAI", status, &error_text));
        }

        let result: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| KgError::Llm(format!("Failed to parse response: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| KgError::Llm("No response generated".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Ollama Client
// ============================================================================

/// Ollama API client
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            temperature: 0.0,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("Ollama", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error("Ollama", status, &error_text));
        }

        let result: OllamaResponse = response
            .json()
            .await
            .map_err(|e| KgError::Llm(format!("Failed to parse Ollama response: {e}")))?;

        Ok(result.response)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an LLM client from config
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    tracing::debug!(provider = ?config.provider, model = %config.model, "Creating LLM client");
    match config.provider {
        LlmProvider::OpenAI | LlmProvider::Azure => Ok(Arc::new(OpenAiClient::from_config(config)?)),
        LlmProvider::Ollama => Ok(Arc::new(OllamaClient::from_config(config)?)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_client_creation() {
        let client = OpenAiClient::new("test-key", "gpt-4o-mini", 2048, 0.1);
        assert_eq!(client.model(), "gpt-4o-mini");
        assert_eq!(client.base_url, OPENAI_BASE_URL);
    }

    #[test]
    fn test_ollama_from_config() {
        let config = LlmConfig {
            provider: LlmProvider::Ollama,
            ollama_url: "http://localhost:11434/".to_string(),
            model: "llama3".to_string(),
            ..Default::default()
        };
        let client = OllamaClient::from_config(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.model(), "llama3");
    }

    #[test]
    fn test_openai_requires_key() {
        let config = LlmConfig::default();
        assert!(matches!(
            create_llm_client(&config),
            Err(KgError::Config(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error("OpenAI", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error("OpenAI", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!status_error("OpenAI", StatusCode::UNAUTHORIZED, "bad key").is_transient());
        assert!(!status_error("Ollama", StatusCode::NOT_FOUND, "model").is_transient());
    }
}
