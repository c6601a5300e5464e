//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Logging context, metrics and HTTP middleware
//! - Rate limiting and usage persistence

pub mod cancel;
pub mod config;
pub mod database;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod usage_logger;

// Re-export commonly used types
pub use cancel::CancellationSignal;
pub use config::{AppConfig, InstanceConfig, ModelConfig, ServerConfig};
pub use database::{Database, DatabaseConfig};
pub use error::{AppError, Result};
pub use logging::{get_request_id, get_user_id};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware};
pub use rate_limiter::{
    RateLimitInfo, RateLimitPolicy, RateLimitResolver, RateLimiter, StaticRateLimitResolver,
};
pub use usage_logger::{DatabaseUsageStore, MemoryUsageStore, UsageRecord, UsageStore};
