//! Server-Sent Events (SSE) streaming support for chat completions.
//!
//! [`StreamingPipeline`] turns a stream of typed upstream chunks into
//! OpenAI-compatible `data: <json>\n\n` frames while accumulating usage.
//! On normal completion it appends a usage frame and the `[DONE]` sentinel.
//! On an upstream error it emits an error frame and `[DONE]` so the client sees
//! a well-formed stream, then yields the error itself so the caller can record
//! the failure.

use crate::api::models::{Delta, StreamChoice, StreamChunk, Usage};
use crate::api::upstream::{UpstreamChunk, UpstreamStream};
use crate::core::error::{AppError, Result};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

pub const SSE_DONE: &str = "data: [DONE]\n\n";
const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Running totals for one stream, shared with whoever records usage.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub last_id: Option<String>,
    pub last_model: Option<String>,
    pub last_created: Option<i64>,
    pub content_frames: usize,
    /// Upstream ended without error
    pub completed: bool,
}

impl StreamState {
    /// Merge a usage report. Providers sometimes split prompt and completion
    /// counts across events, so each field keeps its latest non-zero value.
    pub fn absorb_usage(&mut self, usage: &Usage) {
        if usage.prompt_tokens > 0 {
            self.prompt_tokens = usage.prompt_tokens;
        }
        if usage.completion_tokens > 0 {
            self.completion_tokens = usage.completion_tokens;
        }
        if usage.total_tokens > 0 {
            self.total_tokens = usage.total_tokens;
        }
    }

    pub fn usage(&self) -> Usage {
        let total = if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        };
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: total,
        }
    }
}

pub type SharedStreamState = Arc<Mutex<StreamState>>;

/// Converts upstream chunks into SSE frames for one request.
pub struct StreamingPipeline {
    request_id: String,
    fallback_model: String,
    state: SharedStreamState,
}

impl StreamingPipeline {
    pub fn new(request_id: impl Into<String>, fallback_model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            fallback_model: fallback_model.into(),
            state: Arc::new(Mutex::new(StreamState::default())),
        }
    }

    /// Handle to the accumulated state; stays valid after the stream is dropped.
    pub fn state(&self) -> SharedStreamState {
        Arc::clone(&self.state)
    }

    /// Drive `upstream` to completion, yielding SSE frames in arrival order.
    ///
    /// The returned stream is single-pass. After an upstream error it yields the
    /// error frame, `[DONE]`, then `Err` as its final item.
    pub fn run(self, upstream: UpstreamStream) -> impl Stream<Item = Result<String>> + Send {
        async_stream::stream! {
            let mut upstream = upstream;
            let mut failure: Option<AppError> = None;

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(frame) = self.absorb(chunk) {
                            yield Ok(frame);
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            match failure {
                Some(error) => {
                    tracing::warn!(
                        request_id = %self.request_id,
                        error = %error,
                        "Upstream stream failed"
                    );
                    yield Ok(self.error_frame(&error));
                    yield Ok(SSE_DONE.to_string());
                    yield Err(error);
                }
                None => {
                    self.lock().completed = true;
                    yield Ok(self.usage_frame());
                    yield Ok(SSE_DONE.to_string());
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record chunk metadata and usage; returns the frame to emit, if any.
    fn absorb(&self, chunk: UpstreamChunk) -> Option<String> {
        let mut state = self.lock();
        if let Some(id) = &chunk.id {
            state.last_id = Some(id.clone());
        }
        if let Some(model) = &chunk.model {
            state.last_model = Some(model.clone());
        }
        if let Some(created) = chunk.created {
            state.last_created = Some(created);
        }
        if let Some(usage) = &chunk.usage {
            state.absorb_usage(usage);
        }
        if chunk.is_usage_only() {
            return None;
        }
        state.content_frames += 1;

        let frame = StreamChunk {
            id: state.last_id.clone().unwrap_or_else(|| self.default_id()),
            object: CHUNK_OBJECT.to_string(),
            created: state.last_created.unwrap_or_else(now_epoch),
            model: state
                .last_model
                .clone()
                .unwrap_or_else(|| self.fallback_model.clone()),
            choices: chunk.choices,
            usage: None,
        };
        drop(state);
        Some(sse_data(&frame))
    }

    fn usage_frame(&self) -> String {
        let state = self.lock();
        let frame = StreamChunk {
            id: state.last_id.clone().unwrap_or_else(|| self.default_id()),
            object: CHUNK_OBJECT.to_string(),
            created: state.last_created.unwrap_or_else(now_epoch),
            model: state
                .last_model
                .clone()
                .unwrap_or_else(|| self.fallback_model.clone()),
            choices: Vec::new(),
            usage: Some(state.usage()),
        };
        drop(state);
        sse_data(&frame)
    }

    fn error_frame(&self, error: &AppError) -> String {
        let state = self.lock();
        let frame = StreamChunk {
            id: state.last_id.clone().unwrap_or_else(|| self.default_id()),
            object: CHUNK_OBJECT.to_string(),
            created: now_epoch(),
            model: state
                .last_model
                .clone()
                .unwrap_or_else(|| self.fallback_model.clone()),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(format!("Error: {}", error)),
                },
                finish_reason: Some("error".to_string()),
            }],
            usage: None,
        };
        drop(state);
        sse_data(&frame)
    }

    fn default_id(&self) -> String {
        format!("chatcmpl-{}", self.request_id)
    }
}

fn sse_data(chunk: &StreamChunk) -> String {
    match serde_json::to_string(chunk) {
        Ok(json) => format!("data: {}\n\n", json),
        Err(e) => {
            tracing::error!("Failed to serialize stream chunk: {}", e);
            String::new()
        }
    }
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Wrap a frame stream in a `text/event-stream` response.
pub fn sse_response<S>(frames: S) -> Response
where
    S: Stream<Item = String> + Send + 'static,
{
    let body = Body::from_stream(frames.map(Ok::<String, Infallible>));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}
