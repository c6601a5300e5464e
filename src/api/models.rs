//! API request and response models.
//!
//! This module defines the OpenAI-compatible wire types, plus the health,
//! service-info and rate-limit payloads served by the gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Chat completion request following OpenAI API format.
///
/// Fields default when absent so that validation can answer with a 400
/// describing the problem instead of a generic extractor rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "model": "gpt-4",
    "messages": [
        {"role": "system", "content": "You are a helpful assistant."},
        {"role": "user", "content": "Hello!"}
    ],
    "temperature": 0.7,
    "max_tokens": 1000,
    "stream": false
}))]
pub struct ChatCompletionRequest {
    /// Logical model name from `model_list`
    #[serde(default)]
    pub model: String,

    /// Conversation messages
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Sampling temperature (0.0 to 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Additional provider-specific parameters
    #[serde(flatten)]
    #[schema(additional_properties)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"role": "user", "content": "Hello!"}))]
pub struct Message {
    /// Role: "system", "user", "assistant" or "tool"
    #[serde(default)]
    pub role: String,

    /// Message content; a string or an array of content parts
    #[serde(default)]
    #[schema(value_type = Object)]
    pub content: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: serde_json::Value::String(content.into()),
            name: None,
        }
    }
}

/// Chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "chatcmpl-abc123",
    "object": "chat.completion",
    "created": 1677858242,
    "model": "gpt-4",
    "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": "Hello! How can I help you today?"},
        "finish_reason": "stop"
    }],
    "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
}))]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A single choice in the response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}))]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Streaming response chunk.
///
/// `usage` is always serialized (as `null` on content chunks), matching what
/// OpenAI sends when `stream_options.include_usage` is on.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    pub usage: Option<Usage>,
}

/// A single choice in a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Delta content in streaming responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Model information.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"id": "claude-3-haiku", "object": "model", "created": 1677610602, "owned_by": "anthropic"}))]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// List of available models.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Error response for API errors.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": {
        "message": "Unauthorized",
        "type": "authentication_error",
        "code": 401
    }
}))]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

/// Error detail in API error responses.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: u16,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// RFC 3339
    pub timestamp: String,
    pub version: String,
    pub components: HealthComponents,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthComponents {
    pub configuration: ConfigurationHealth,
    pub load_balancer: LoadBalancerHealth,
    pub database: DatabaseHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConfigurationHealth {
    pub models: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoadBalancerHealth {
    pub total_pools: usize,
    pub healthy_pools: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DatabaseHealth {
    pub configured: bool,
}

/// Service information served at `/`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub docs: String,
    pub endpoints: Vec<String>,
}

/// Caller's current rate-limit window.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitStatus {
    pub identity: String,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds
    pub reset: u64,
    pub window_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_missing_fields_deserializes() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.model.is_empty());
        assert!(request.messages.is_empty());
        assert!(!request.is_streaming());
    }

    #[test]
    fn test_request_extra_fields_are_kept() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "top_p": 0.9
        }))
        .unwrap();
        assert!(request.is_streaming());
        assert_eq!(request.extra["top_p"], json!(0.9));
        assert_eq!(request.messages[0], Message::new("user", "hi"));
    }

    #[test]
    fn test_stream_chunk_serializes_null_usage() {
        let chunk = StreamChunk {
            id: "chatcmpl-1".into(),
            object: "chat.completion.chunk".into(),
            created: 1,
            model: "gpt-4".into(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some("Hi".into()),
                },
                finish_reason: None,
            }],
            usage: None,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["usage"], serde_json::Value::Null);
        assert_eq!(value["choices"][0]["delta"], json!({"content": "Hi"}));
        assert_eq!(value["choices"][0]["finish_reason"], serde_json::Value::Null);
    }

    #[test]
    fn test_usage_new_totals() {
        assert_eq!(Usage::new(3, 4).total_tokens, 7);
    }
}
