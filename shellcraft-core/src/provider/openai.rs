//! OpenAI-compatible provider implementation
//!
//! Works with OpenAI, Azure OpenAI, vLLM, Ollama, DashScope and other
//! OpenAI-compatible APIs.

use super::*;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// OpenAI-compatible provider
pub struct OpenAIProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs.unwrap_or(120)))
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(OPENAI_BASE_URL)
            .trim_end_matches('/')
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> RequestBuilder {
        let model = request.model.as_deref().unwrap_or(self.default_model());

        let api_request = OpenAIRequest {
            model: model.to_string(),
            messages: request.messages.iter().map(OpenAIMessage::from).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(stream),
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
            stop: request.stop.clone(),
        };

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url()))
            .json(&api_request);

        if let Some(api_key) = &self.config.api_key {
            if !api_key.is_empty() {
                req = req.bearer_auth(api_key);
            }
        }

        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }

        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ProviderError> {
        let response = req.send().await.map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let text = response.text().await.unwrap_or_default();
        debug!(status, body = %text, "completion request rejected");

        Err(match status {
            429 => ProviderError::RateLimited { retry_after },
            401 | 403 => ProviderError::AuthenticationFailed,
            404 => ProviderError::ModelNotFound(text),
            400 => ProviderError::InvalidRequest(text),
            _ => ProviderError::Api { status, message: text },
        })
    }
}

impl LlmProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        self.config.default_model.as_deref().unwrap_or("gpt-4o")
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(self.build_request(&request, false)).await?;

        let api_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Other("No choices in response".into()))?;

        let usage = api_response.usage.map(Usage::from).unwrap_or_default();

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: choice.message.content,
            finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
            usage,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamReceiver, ProviderError> {
        let model = request.model.clone().unwrap_or_else(|| self.default_model().to_string());
        let response = self.send(self.build_request(&request, true)).await?;

        Ok(StreamReceiver::new(model, sse_chunks(response.bytes_stream())))
    }
}

/// Bytes of an SSE body, split into whole events.
///
/// Decoding waits until an event is complete, so a multibyte character split
/// across network chunks comes out intact.
#[derive(Debug, Default)]
struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_event(&mut self) -> Option<String> {
        let end = (0..self.buf.len()).find_map(|i| {
            let rest = &self.buf[i..];
            if rest.starts_with(b"\n\n") {
                Some(i + 2)
            } else if rest.starts_with(b"\r\n\r\n") {
                Some(i + 4)
            } else {
                None
            }
        })?;
        let event: Vec<u8> = self.buf.drain(..end).collect();
        Some(String::from_utf8_lossy(&event).into_owned())
    }
}

/// Turn a chat-completions SSE body into stream chunks
fn sse_chunks<S, B, E>(bytes: S) -> impl futures_core::Stream<Item = StreamChunk> + Send + 'static
where
    S: futures_core::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    async_stream::stream! {
        let mut bytes = std::pin::pin!(bytes);
        let mut buffer = SseBuffer::default();
        let mut finish_reason = FinishReason::Unknown;
        let mut usage = None;

        while let Some(chunk_result) = bytes.next().await {
            match chunk_result {
                Ok(chunk) => buffer.push(chunk.as_ref()),
                Err(e) => {
                    yield StreamChunk::Error(e.to_string());
                    return;
                }
            }

            while let Some(event) = buffer.next_event() {
                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };

                    if data == "[DONE]" {
                        yield StreamChunk::Done { finish_reason, usage };
                        return;
                    }

                    let Ok(chunk) = serde_json::from_str::<OpenAIStreamChunk>(data) else {
                        continue;
                    };

                    // Usage arrives on a final chunk with empty choices.
                    if let Some(u) = chunk.usage {
                        usage = Some(Usage::from(u));
                    }

                    if let Some(choice) = chunk.choices.first() {
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty() {
                                yield StreamChunk::Text(content.clone());
                            }
                        }
                        if choice.finish_reason.is_some() {
                            finish_reason = FinishReason::parse(choice.finish_reason.as_deref());
                        }
                    }
                }
            }
        }

        // Connection closed without [DONE]
        yield StreamChunk::Done { finish_reason, usage };
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl From<&ChatMessage> for OpenAIMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: Some(msg.content.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

impl From<OpenAIUsage> for Usage {
    fn from(u: OpenAIUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}
