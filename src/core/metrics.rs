//! Prometheus metrics for monitoring the gateway.
//!
//! This module provides a centralized metrics registry covering HTTP traffic,
//! token usage and cost, instance health and rate limiting.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, CounterVec, GaugeVec, HistogramVec, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, model, provider, and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Total token usage by model, provider, and token type
    pub token_usage: IntCounterVec,

    /// Accumulated cost in USD by model and provider
    pub usage_cost: CounterVec,

    /// Instance health (1=selectable, 0=unhealthy or tripped) by model and instance
    pub instance_health: GaugeVec,

    /// Upstream latency histogram in seconds by model and provider
    pub upstream_latency: HistogramVec,

    /// Circuit breaker openings by model and instance
    pub circuit_breaker_trips: IntCounterVec,

    /// Requests rejected by the sliding-window limiter
    pub rate_limit_rejections: IntCounter,

    /// Usage records that could not be handed to the usage store
    pub usage_records_dropped: IntCounter,

    /// Terminal outcome of streaming requests by model and outcome
    pub stream_outcomes: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
///
/// # Examples
///
/// ```no_run
/// use chatvault_gateway::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.rate_limit_rejections.inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "chatvault_requests_total",
            "Total number of requests",
            &["method", "endpoint", "model", "provider", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "chatvault_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint", "model", "provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "chatvault_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let token_usage = register_int_counter_vec!(
            "chatvault_tokens_total",
            "Total number of tokens used",
            &["model", "provider", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        let usage_cost = register_counter_vec!(
            "chatvault_cost_usd_total",
            "Accumulated request cost in USD",
            &["model", "provider"]
        )
        .expect("Failed to register usage_cost metric");

        let instance_health = register_gauge_vec!(
            "chatvault_instance_health",
            "Provider instance health (1=healthy, 0=unhealthy)",
            &["model", "instance"]
        )
        .expect("Failed to register instance_health metric");

        let upstream_latency = register_histogram_vec!(
            "chatvault_upstream_latency_seconds",
            "Upstream response latency in seconds",
            &["model", "provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register upstream_latency metric");

        let circuit_breaker_trips = register_int_counter_vec!(
            "chatvault_circuit_breaker_trips_total",
            "Number of times an instance circuit breaker opened",
            &["model", "instance"]
        )
        .expect("Failed to register circuit_breaker_trips metric");

        let rate_limit_rejections = register_int_counter!(
            "chatvault_rate_limit_rejections_total",
            "Requests rejected by the rate limiter"
        )
        .expect("Failed to register rate_limit_rejections metric");

        let usage_records_dropped = register_int_counter!(
            "chatvault_usage_records_dropped_total",
            "Usage records that could not be persisted"
        )
        .expect("Failed to register usage_records_dropped metric");

        let stream_outcomes = register_int_counter_vec!(
            "chatvault_stream_outcomes_total",
            "Terminal outcome of streaming requests",
            &["model", "outcome"]
        )
        .expect("Failed to register stream_outcomes metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            token_usage,
            usage_cost,
            instance_health,
            upstream_latency,
            circuit_breaker_trips,
            rate_limit_rejections,
            usage_records_dropped,
            stream_outcomes,
        }
    })
}

/// Get the global metrics instance, registering it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
