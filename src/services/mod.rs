//! Business logic services for the gateway.
//!
//! This module contains the provider pools and load balancer, health probing,
//! model and cost lookups, and the per-request completion router.

pub mod completion_router;
pub mod cost_table;
pub mod health_check_service;
pub mod load_balancer;
pub mod model_registry;
pub mod provider_pool;

// Re-export commonly used types
pub use completion_router::{CompletionRouter, RequestContext};
pub use cost_table::{CostTable, StaticCostTable};
pub use health_check_service::{HealthChecker, HttpHealthChecker};
pub use load_balancer::{LoadBalancer, LoadBalancerStats};
pub use model_registry::{ModelConfigResolver, ModelParams, ModelRegistry, ProviderKind};
pub use provider_pool::{
    InstanceSettings, LoadBalancingAlgorithm, PoolStats, ProviderInstance, ProviderPool,
    ProviderStatus,
};
