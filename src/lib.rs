//! ChatVault Gateway - an OpenAI-compatible chat completion gateway
//!
//! This library routes chat completion requests for logical model names to
//! pools of upstream provider instances, with features including:
//!
//! - **Load Balancing**: Round-robin, least-loaded, random and weighted selection per model
//! - **Circuit Breaking**: Instances are ejected after consecutive failures and retried after a cool-down
//! - **Health Checks**: Background probing of every instance
//! - **Streaming Support**: Server-Sent Events with a trailing usage frame
//! - **Rate Limiting**: Sliding-window limits per caller identity
//! - **Usage Accounting**: One usage record per routed request, persisted to PostgreSQL
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, database, errors, metrics, middleware, rate limiting)
//! - [`api`]: HTTP handlers, authentication, upstream client and request/response models
//! - [`services`]: Business logic (provider pools, load balancer, completion router)
//!
//! # Configuration
//!
//! Configuration is read from the YAML file named by `CHATVAULT_CONFIG` (default
//! `config.yaml`), or from the environment when that file does not exist:
//! - `DATABASE_URL`: PostgreSQL connection URL for usage logging (optional)
//! - `CHATVAULT_API_KEY`: Master API key
//! - `HOST` / `PORT`: Server bind address (default: 0.0.0.0:4000)
//! - `VERIFY_SSL`: Verify SSL certificates for upstream (default: true)
//! - `REQUEST_TIMEOUT_SECS`: Upstream HTTP client timeout in seconds

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{
    create_router, ApiDoc, AppState, Authenticator, ChatCompletionRequest, ChatCompletionResponse,
};
pub use core::{AppConfig, AppError, Database, DatabaseConfig, RateLimiter, Result};
pub use services::{CompletionRouter, LoadBalancer, ModelRegistry, ProviderPool};
