//! API layer for the gateway.
//!
//! This module contains the HTTP handlers, request/response models,
//! authentication, the upstream client and streaming support.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod streaming;
pub mod upstream;

// Re-export commonly used types
pub use auth::Authenticator;
pub use handlers::{
    chat_completions, create_router, health, list_models, load_balancer_stats, metrics_handler,
    rate_limit_status, ApiDoc, AppState,
};
pub use models::{
    ChatCompletionRequest, ChatCompletionResponse, HealthResponse, Message, ModelList, StreamChunk,
    Usage,
};
pub use streaming::{sse_response, StreamingPipeline};
pub use upstream::{OpenAiCompatibleClient, UpstreamChunk, UpstreamClient, UpstreamRequest};
