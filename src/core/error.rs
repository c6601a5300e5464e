//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps various error sources
//! and implements proper HTTP response conversion.

use crate::core::error_types::{
    ERROR_TYPE_API, ERROR_TYPE_AUTHENTICATION, ERROR_TYPE_INVALID_REQUEST, ERROR_TYPE_OVERLOADED,
    ERROR_TYPE_PERMISSION, ERROR_TYPE_RATE_LIMIT, ERROR_TYPE_TIMEOUT, ERROR_TYPE_UPSTREAM,
};
use crate::core::rate_limiter::RateLimitInfo;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing or invalid credentials
    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated caller is not allowed to use the resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed request body
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested model is not in the configuration
    #[error("Model '{0}' is not configured")]
    UnknownModel(String),

    /// Model is configured but has no load balancing pool
    #[error("No load balancing pool for model '{0}'")]
    NoPool(String),

    /// Every instance in the pool is unhealthy or tripped
    #[error("No healthy instances available for model '{0}'")]
    NoHealthyInstance(String),

    /// Backend call failed
    #[error("Upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// Backend did not answer within the instance timeout
    #[error("Upstream timeout: {provider} did not respond within {timeout_secs} seconds")]
    UpstreamTimeout { provider: String, timeout_secs: u64 },

    /// Sliding window exhausted for the caller
    #[error("Rate limit exceeded")]
    RateLimitExceeded(RateLimitInfo),

    /// Usage logging failure; never surfaced to clients
    #[error("Usage persistence failed: {0}")]
    Persistence(String),

    /// Client disconnected before request completed
    #[error("Client closed request")]
    ClientDisconnect,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status used both for the response and for failed usage records.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) | AppError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            AppError::NoPool(_) | AppError::NoHealthyInstance(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Persistence(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // RFC 7231 status, more widely understood than nginx's 499
            AppError::ClientDisconnect => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Value of the `type` field in the JSON error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) | AppError::UnknownModel(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::Unauthorized => ERROR_TYPE_AUTHENTICATION,
            AppError::Forbidden(_) => ERROR_TYPE_PERMISSION,
            AppError::RateLimitExceeded(_) => ERROR_TYPE_RATE_LIMIT,
            AppError::NoPool(_) | AppError::NoHealthyInstance(_) => ERROR_TYPE_OVERLOADED,
            AppError::UpstreamTimeout { .. } => ERROR_TYPE_TIMEOUT,
            AppError::Upstream { .. } | AppError::Request(_) => ERROR_TYPE_UPSTREAM,
            _ => ERROR_TYPE_API,
        }
    }

    /// Whether the failure came from the upstream side: a provider error, a
    /// transport error, a timeout or an undecodable body. Used for outcome
    /// labels. Every failure during invocation is reported against the serving
    /// instance whatever this returns.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            AppError::Upstream { .. }
                | AppError::UpstreamTimeout { .. }
                | AppError::Request(_)
                | AppError::Serialization(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            AppError::UpstreamTimeout { .. } => true,
            AppError::Request(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        let message = match &self {
            AppError::Request(e) if e.is_timeout() => "Gateway timeout".to_string(),
            AppError::ClientDisconnect => {
                tracing::info!("Client disconnected before request completed");
                self.to_string()
            }
            // Internal details stay in the logs
            AppError::Config(_) | AppError::Persistence(_) => {
                tracing::error!(error = %self, "Internal error while handling request");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        let mut response = (status, body).into_response();

        if let AppError::RateLimitExceeded(info) = &self {
            info.apply_headers(response.headers_mut());
            if let Ok(value) = HeaderValue::from_str(&info.retry_after_secs().to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
