use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by the LLM provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM rejected the request: {0}")]
    BadRequest(String),

    #[error("LLM transport error: {0}")]
    Transport(String),
}

impl LlmError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::BadRequest(_))
    }
}

/// Chat-completion style text rewriting.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Get the name of this LLM adapter
    fn adapter_name(&self) -> String;

    async fn complete(&self, system_prompt: &str, text: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiClient {
    client: Client,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn adapter_name(&self) -> String {
        format!("OpenAI ({})", self.config.model)
    }

    async fn complete(&self, system_prompt: &str, text: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::BadRequest(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        debug!("LLM returned {} chars", content.chars().count());
        Ok(content)
    }
}

/// Mock LLM adapter for development and testing.
///
/// Replays scripted results in order, then falls back to echoing the input
/// (or failing, when built with [`MockLlmAdapter::failing`]).
pub struct MockLlmAdapter {
    name: String,
    response_delay_ms: u64,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback_error: Option<LlmError>,
    fail_on: Option<(String, LlmError)>,
    calls: AtomicUsize,
}

impl MockLlmAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response_delay_ms: 0,
            script: Mutex::new(VecDeque::new()),
            fallback_error: None,
            fail_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: impl Into<String>, error: LlmError) -> Self {
        Self {
            fallback_error: Some(error),
            ..Self::new(name)
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.response_delay_ms = delay_ms;
        self
    }

    pub fn with_script(self, script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..self
        }
    }

    /// Fails every request whose text contains `marker`.
    pub fn with_failure_on(mut self, marker: impl Into<String>, error: LlmError) -> Self {
        self.fail_on = Some((marker.into(), error));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn simulate_processing(&self) {
        if self.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.response_delay_ms)).await;
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmAdapter {
    fn adapter_name(&self) -> String {
        format!("Mock LLM Adapter ({})", self.name)
    }

    async fn complete(&self, _system_prompt: &str, text: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_processing().await;

        if let Some((marker, error)) = &self.fail_on {
            if text.contains(marker.as_str()) {
                return Err(error.clone());
            }
        }
        if let Some(scripted) = self.script.lock().await.pop_front() {
            return scripted;
        }
        match &self.fallback_error {
            Some(error) => Err(error.clone()),
            None => Ok(text.to_string()),
        }
    }
}
