//! Upstream client abstraction and the OpenAI-compatible HTTP implementation.
//!
//! The router only ever sees the typed [`CompletionResult`] and [`UpstreamChunk`]
//! shapes produced here; provider response bodies are not inspected elsewhere.

use crate::api::models::{Choice, Message, StreamChoice, Usage};
use crate::core::error::{AppError, Result};
use crate::core::logging::{get_request_id, get_user_id};
use crate::services::model_registry::ProviderKind;
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Everything needed to make one upstream call.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub provider: ProviderKind,
    /// Upstream model id with any `provider/` prefix removed
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub messages: Vec<Message>,
    /// Per-model parameters with caller overrides applied on top
    pub params: Map<String, Value>,
}

/// Non-streaming completion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One decoded event of an upstream stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl UpstreamChunk {
    /// Terminal usage-only event (`choices: []` with usage populated).
    pub fn is_usage_only(&self) -> bool {
        self.choices.is_empty() && self.usage.is_some()
    }
}

pub type UpstreamStream = BoxStream<'static, Result<UpstreamChunk>>;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn complete(&self, request: &UpstreamRequest) -> Result<CompletionResult>;

    async fn complete_stream(&self, request: &UpstreamRequest) -> Result<UpstreamStream>;
}

/// Speaks the `/chat/completions` dialect shared by OpenAI, DeepSeek, Ollama
/// and the compatibility endpoints of Anthropic and Google.
pub struct OpenAiCompatibleClient {
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: &UpstreamRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", request.api_base.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&build_body(request, stream));
        if let Some(key) = request.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        tracing::debug!(
            request_id = %get_request_id(),
            user_id = %get_user_id(),
            provider = %request.provider,
            model = %request.model,
            url = %url,
            stream = stream,
            "Sending upstream request"
        );

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| extract_error_message(&v))
            .unwrap_or_else(|| truncate(&body, 500));
        tracing::warn!(
            request_id = %get_request_id(),
            user_id = %get_user_id(),
            provider = %request.provider,
            status = status.as_u16(),
            "Upstream returned an error"
        );
        Err(AppError::Upstream {
            provider: request.provider.to_string(),
            status: Some(status.as_u16()),
            message,
        })
    }
}

#[async_trait]
impl UpstreamClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &UpstreamRequest) -> Result<CompletionResult> {
        let response = self.send(request, false).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn complete_stream(&self, request: &UpstreamRequest) -> Result<UpstreamStream> {
        let response = self.send(request, true).await?;
        Ok(parse_sse_stream(response.bytes_stream(), request.provider.to_string()).boxed())
    }
}

fn build_body(request: &UpstreamRequest, stream: bool) -> Value {
    let mut body = Map::new();
    for (key, value) in &request.params {
        if !matches!(key.as_str(), "model" | "messages" | "stream" | "stream_options") {
            body.insert(key.clone(), value.clone());
        }
    }
    body.insert("model".into(), Value::String(request.model.clone()));
    body.insert(
        "messages".into(),
        serde_json::to_value(&request.messages).unwrap_or(Value::Array(Vec::new())),
    );
    body.insert("stream".into(), Value::Bool(stream));
    if stream {
        body.insert(
            "stream_options".into(),
            serde_json::json!({"include_usage": true}),
        );
    }
    Value::Object(body)
}

/// Pull a human-readable message out of a provider error body.
pub fn extract_error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            body.get("error")
                .and_then(|e| e.as_str())
                .map(|s| s.to_string())
        })
        .or_else(|| {
            body.get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}

enum SseLine {
    Chunk(UpstreamChunk),
    Done,
    Skip,
}

fn parse_sse_line(line: &[u8], provider: &str) -> Result<SseLine> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        // comments, `event:` lines and blank separators
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let value: Value = serde_json::from_str(data)?;
    if value.get("error").is_some() {
        return Err(AppError::Upstream {
            provider: provider.to_string(),
            status: None,
            message: extract_error_message(&value).unwrap_or_else(|| "stream error".to_string()),
        });
    }
    Ok(SseLine::Chunk(serde_json::from_value(value)?))
}

/// Decode an SSE byte stream into chunks, stopping at `[DONE]`.
pub fn parse_sse_stream<S>(bytes: S, provider: String) -> impl Stream<Item = Result<UpstreamChunk>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        let mut done = false;

        while let Some(next) = bytes.next().await {
            let next = next.map_err(AppError::from)?;
            buffer.extend_from_slice(&next);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_sse_line(&line, &provider)? {
                    SseLine::Chunk(chunk) => yield chunk,
                    SseLine::Done => {
                        done = true;
                        break;
                    }
                    SseLine::Skip => {}
                }
            }
            if done {
                break;
            }
        }

        if !done && !buffer.is_empty() {
            if let SseLine::Chunk(chunk) = parse_sse_line(&buffer, &provider)? {
                yield chunk;
            }
        }
    }
}
