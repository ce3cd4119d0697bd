//! # LLM Provider Interface
//!
//! A trait-based abstraction for the model completion service.
//!
//! ## Design
//! - `LlmProvider` trait defines the core interface
//! - `OpenAIProvider` speaks to any OpenAI-compatible `/chat/completions`
//! - Streaming via async streams, with a default that wraps `complete`
//! - Usage tracking

pub mod openai;

pub use openai::OpenAIProvider;

use crate::error::{Error, ErrorKind};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

// ============================================================================
// Core Types
// ============================================================================

/// A chat message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Request parameters for a completion
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub stream: bool,
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Response from a completion request
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown,
}

impl FinishReason {
    pub fn parse(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Unknown,
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A streaming chunk from the model
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Text content delta
    Text(String),
    /// Stream finished
    Done {
        finish_reason: FinishReason,
        usage: Option<Usage>,
    },
    /// Error occurred
    Error(String),
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Error type for provider operations
#[derive(Debug)]
pub enum ProviderError {
    /// Network/connection error
    Network(String),
    /// API returned an error
    Api { status: u16, message: String },
    /// Failed to parse response
    Parse(String),
    /// Rate limited
    RateLimited { retry_after: Option<u64> },
    /// Invalid request
    InvalidRequest(String),
    /// Model not found
    ModelNotFound(String),
    /// Authentication failed
    AuthenticationFailed,
    /// Other error
    Other(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "Network error: {}", e),
            Self::Api { status, message } => write!(f, "API error ({}): {}", status, message),
            Self::Parse(e) => write!(f, "Parse error: {}", e),
            Self::RateLimited { retry_after } => {
                write!(f, "Rate limited")?;
                if let Some(secs) = retry_after {
                    write!(f, " (retry after {}s)", secs)?;
                }
                Ok(())
            }
            Self::InvalidRequest(e) => write!(f, "Invalid request: {}", e),
            Self::ModelNotFound(m) => write!(f, "Model not found: {}", m),
            Self::AuthenticationFailed => write!(f, "Authentication failed"),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// The error kind this transport failure maps to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::NetworkFailed,
            Self::Api { status, .. } if *status >= 500 => ErrorKind::ProviderUnavailable,
            Self::Api { .. } | Self::Other(_) => ErrorKind::InferenceFailed,
            Self::Parse(_) => ErrorKind::ParseFailed,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::InvalidRequest(_) => ErrorKind::InvalidArgument,
            Self::ModelNotFound(_) => ErrorKind::ConfigInvalid,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
        }
    }

    /// Convert into the crate error; retryability follows the kind
    pub fn into_error(self) -> Error {
        let kind = self.kind();
        let mut err = Error::new(kind, self.to_string());
        if let Self::Api { status, .. } = &self {
            err = err.with_context("status", status.to_string());
        }
        if let Self::RateLimited { retry_after: Some(secs) } = &self {
            err = err.with_context("retry_after", secs.to_string());
        }
        err.set_source(self)
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        err.into_error()
    }
}

/// The main LLM provider trait
#[allow(async_fn_in_trait)]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name (e.g., "openai")
    fn name(&self) -> &str;

    /// Get the default model
    fn default_model(&self) -> &str;

    /// Send a completion request and get a full response
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Send a completion request and stream the response.
    ///
    /// The default yields the full `complete` response as a single chunk.
    async fn stream(&self, request: CompletionRequest) -> Result<StreamReceiver, ProviderError> {
        let response = self.complete(request).await?;
        Ok(StreamReceiver::from_response(response))
    }
}

/// Receiver for streaming responses
pub struct StreamReceiver {
    model: String,
    inner: Pin<Box<dyn futures_core::Stream<Item = StreamChunk> + Send>>,
}

impl StreamReceiver {
    pub fn new<S>(model: impl Into<String>, stream: S) -> Self
    where
        S: futures_core::Stream<Item = StreamChunk> + Send + 'static,
    {
        Self {
            model: model.into(),
            inner: Box::pin(stream),
        }
    }

    /// Wrap a complete response as a finished stream
    pub fn from_response(response: CompletionResponse) -> Self {
        let mut chunks = Vec::with_capacity(2);
        if let Some(content) = response.content {
            chunks.push(StreamChunk::Text(content));
        }
        chunks.push(StreamChunk::Done {
            finish_reason: response.finish_reason,
            usage: Some(response.usage),
        });
        Self::new(response.model, futures_util::stream::iter(chunks))
    }

    /// Drain the stream, handing each text delta to `on_text`
    pub async fn collect_with<F>(mut self, mut on_text: F) -> Result<CompletionResponse, ProviderError>
    where
        F: FnMut(&str),
    {
        let mut text = String::new();
        let mut finish_reason = FinishReason::Unknown;
        let mut usage = Usage::default();

        while let Some(chunk) = self.inner.next().await {
            match chunk {
                StreamChunk::Text(t) => {
                    on_text(&t);
                    text.push_str(&t);
                }
                StreamChunk::Done { finish_reason: fr, usage: u } => {
                    finish_reason = fr;
                    if let Some(u) = u {
                        usage = u;
                    }
                }
                StreamChunk::Error(e) => return Err(ProviderError::Network(e)),
            }
        }

        Ok(CompletionResponse {
            id: String::new(),
            model: self.model,
            content: Some(text),
            finish_reason,
            usage,
        })
    }

    /// Collect all text chunks into a single string
    pub async fn collect_text(self) -> Result<String, ProviderError> {
        let response = self.collect_with(|_| {}).await?;
        Ok(response.content.unwrap_or_default())
    }
}

// ============================================================================
// Provider Configuration
// ============================================================================

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for creating providers
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    /// Any OpenAI-compatible server (vLLM, Ollama, DashScope, a gateway)
    pub fn compatible(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            base_url: Some(base_url.into()),
            default_model: Some(model.into()),
            headers: HashMap::new(),
            timeout_secs: Some(300),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Usage Tracking
// ============================================================================

/// Tracks token usage across multiple calls
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    pub total_calls: usize,
    totals: Usage,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, usage: &Usage) {
        self.total_calls += 1;
        self.totals.add(usage);
    }

    pub fn total(&self) -> Usage {
        self.totals
    }

    pub fn total_tokens(&self) -> usize {
        self.totals.prompt_tokens + self.totals.completion_tokens
    }
}

// ============================================================================
// Tests
// ============================================================================
