//! Provider instances and the per-model pools that select among them.
//!
//! Each [`ProviderInstance`] tracks its own load counters, response-time EMA and
//! circuit breaker behind a per-instance mutex, so recording a result on one
//! instance never blocks another. A [`ProviderPool`] holds the instances for one
//! logical model and applies one of the [`LoadBalancingAlgorithm`]s.

use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use utoipa::ToSchema;

/// Smoothing factor for the response-time moving average.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Maintenance,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Maintenance => "maintenance",
        }
    }

    fn is_serving(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastLoaded,
    Random,
    WeightedRoundRobin,
}

impl LoadBalancingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::Random => "random",
            Self::WeightedRoundRobin => "weighted_round_robin",
        }
    }

    /// Parse a configured algorithm name, falling back to round robin on anything unknown.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            tracing::warn!(
                algorithm = %name,
                "Invalid load balancing algorithm, using round_robin"
            );
            Self::RoundRobin
        })
    }
}

impl FromStr for LoadBalancingAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_loaded" => Ok(Self::LeastLoaded),
            "random" => Ok(Self::Random),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            other => Err(format!("unknown load balancing algorithm: {}", other)),
        }
    }
}

impl fmt::Display for LoadBalancingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static settings of one backend endpoint.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    /// Logical model this instance serves; used for metric labels
    pub model_name: String,
    pub provider_name: String,
    pub instance_id: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub weight: u32,
    pub max_concurrent: u32,
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
    pub circuit_breaker_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_queue_size: usize,
}

impl InstanceSettings {
    pub fn new(
        model_name: impl Into<String>,
        provider_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            provider_name: provider_name.into(),
            instance_id: instance_id.into(),
            base_url: None,
            api_key: None,
            weight: 1,
            max_concurrent: 10,
            timeout: Duration::from_secs(30),
            max_consecutive_failures: 3,
            circuit_breaker_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            max_queue_size: 100,
        }
    }
}

#[derive(Debug)]
struct InstanceState {
    status: ProviderStatus,
    consecutive_failures: u32,
    circuit_open: bool,
    circuit_tripped_at: Option<Instant>,
    active_requests: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    avg_response_time_ms: Option<f64>,
    queue_depth: usize,
    last_health_check: Instant,
}

/// Point-in-time view of an instance for the stats endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InstanceSnapshot {
    pub provider_name: String,
    pub instance_id: String,
    pub status: ProviderStatus,
    pub healthy: bool,
    pub active_requests: u32,
    pub total_requests: u64,
    /// Percent, 0-100
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub load_factor: f64,
    pub circuit_breaker_open: bool,
    pub queue_size: usize,
    pub seconds_since_health_check: f64,
}

/// One backend endpoint with its health, load and circuit-breaker state.
#[derive(Debug)]
pub struct ProviderInstance {
    settings: InstanceSettings,
    state: Mutex<InstanceState>,
}

impl ProviderInstance {
    pub fn new(settings: InstanceSettings) -> Self {
        let instance = Self {
            settings,
            state: Mutex::new(InstanceState {
                status: ProviderStatus::Healthy,
                consecutive_failures: 0,
                circuit_open: false,
                circuit_tripped_at: None,
                active_requests: 0,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                avg_response_time_ms: None,
                queue_depth: 0,
                last_health_check: Instant::now(),
            }),
        };
        instance.publish_health(true);
        instance
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    pub fn id(&self) -> &str {
        &self.settings.instance_id
    }

    pub fn provider_name(&self) -> &str {
        &self.settings.provider_name
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_health(&self, healthy: bool) {
        get_metrics()
            .instance_health
            .with_label_values(&[&self.settings.model_name, &self.settings.instance_id])
            .set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    /// Health as seen at `now`. An open breaker whose timeout has elapsed is
    /// closed here, zeroing the failure streak.
    pub fn is_healthy_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if state.circuit_open {
            let eligible = state
                .circuit_tripped_at
                .map(|tripped| now.saturating_duration_since(tripped) >= self.settings.circuit_breaker_timeout)
                .unwrap_or(true);
            if !eligible {
                return false;
            }
            state.circuit_open = false;
            state.circuit_tripped_at = None;
            state.consecutive_failures = 0;
            let serving = state.status.is_serving();
            drop(state);
            tracing::info!(
                instance_id = %self.settings.instance_id,
                provider = %self.settings.provider_name,
                "Circuit breaker reset"
            );
            self.publish_health(serving);
            return serving;
        }
        state.status.is_serving()
    }

    pub fn can_accept_request(&self) -> bool {
        if !self.is_healthy() {
            return false;
        }
        let state = self.lock();
        state.active_requests < self.settings.max_concurrent
            && state.queue_depth < self.settings.max_queue_size
    }

    pub fn record_request_start(&self) {
        let mut state = self.lock();
        state.active_requests += 1;
        state.total_requests += 1;
    }

    pub fn record_request_complete(&self, success: bool, response_time_ms: Option<f64>) {
        self.record_request_complete_at(success, response_time_ms, Instant::now());
    }

    pub fn record_request_complete_at(
        &self,
        success: bool,
        response_time_ms: Option<f64>,
        now: Instant,
    ) {
        let mut state = self.lock();
        state.active_requests = state.active_requests.saturating_sub(1);

        if success {
            state.successful_requests += 1;
            state.consecutive_failures = 0;
            if let Some(sample) = response_time_ms {
                state.avg_response_time_ms = Some(match state.avg_response_time_ms {
                    Some(avg) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * avg,
                    None => sample,
                });
            }
            return;
        }

        state.failed_requests += 1;
        state.consecutive_failures += 1;
        if state.consecutive_failures < self.settings.max_consecutive_failures {
            return;
        }

        let newly_tripped = !state.circuit_open;
        state.circuit_open = true;
        state.circuit_tripped_at = Some(now);
        let failures = state.consecutive_failures;
        drop(state);

        if newly_tripped {
            get_metrics()
                .circuit_breaker_trips
                .with_label_values(&[&self.settings.model_name, &self.settings.instance_id])
                .inc();
            self.publish_health(false);
            tracing::warn!(
                instance_id = %self.settings.instance_id,
                provider = %self.settings.provider_name,
                consecutive_failures = failures,
                "Circuit breaker opened"
            );
        }
    }

    pub fn load_factor(&self) -> f64 {
        if self.settings.max_concurrent == 0 {
            return 1.0;
        }
        let state = self.lock();
        (state.active_requests as f64 / self.settings.max_concurrent as f64).min(1.0)
    }

    /// Fraction of finished requests that succeeded, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        let state = self.lock();
        state.successful_requests as f64 / state.total_requests.max(1) as f64
    }

    pub fn status(&self) -> ProviderStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: ProviderStatus) {
        let mut state = self.lock();
        let previous = state.status;
        state.status = status;
        let serving = status.is_serving() && !state.circuit_open;
        drop(state);

        if previous != status {
            tracing::info!(
                instance_id = %self.settings.instance_id,
                from = %previous,
                to = %status,
                "Instance status changed"
            );
        }
        self.publish_health(serving);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn is_circuit_open(&self) -> bool {
        self.lock().circuit_open
    }

    pub fn active_requests(&self) -> u32 {
        self.lock().active_requests
    }

    pub fn total_requests(&self) -> u64 {
        self.lock().total_requests
    }

    pub fn successful_requests(&self) -> u64 {
        self.lock().successful_requests
    }

    pub fn failed_requests(&self) -> u64 {
        self.lock().failed_requests
    }

    pub fn avg_response_time_ms(&self) -> Option<f64> {
        self.lock().avg_response_time_ms
    }

    pub fn needs_health_check(&self, now: Instant) -> bool {
        let state = self.lock();
        now.saturating_duration_since(state.last_health_check)
            >= self.settings.health_check_interval
    }

    pub fn mark_health_checked(&self, now: Instant) {
        self.lock().last_health_check = now;
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let healthy = self.is_healthy();
        let load_factor = self.load_factor();
        let success_rate = self.success_rate() * 100.0;
        let state = self.lock();
        InstanceSnapshot {
            provider_name: self.settings.provider_name.clone(),
            instance_id: self.settings.instance_id.clone(),
            status: state.status,
            healthy,
            active_requests: state.active_requests,
            total_requests: state.total_requests,
            success_rate,
            avg_response_time_ms: state.avg_response_time_ms.unwrap_or(0.0),
            load_factor,
            circuit_breaker_open: state.circuit_open,
            queue_size: state.queue_depth,
            seconds_since_health_check: state.last_health_check.elapsed().as_secs_f64(),
        }
    }
}

/// Monitoring view of a pool.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PoolStats {
    pub model_name: String,
    pub provider_name: String,
    pub algorithm: LoadBalancingAlgorithm,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub health_percentage: f64,
    pub instances: Vec<InstanceSnapshot>,
}

/// Ordered instances for one logical model plus the selection algorithm.
pub struct ProviderPool {
    model_name: String,
    provider_name: String,
    algorithm: LoadBalancingAlgorithm,
    instances: RwLock<Vec<Arc<ProviderInstance>>>,
    cursor: Mutex<usize>,
}

impl ProviderPool {
    pub fn new(
        model_name: impl Into<String>,
        provider_name: impl Into<String>,
        algorithm: LoadBalancingAlgorithm,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            provider_name: provider_name.into(),
            algorithm,
            instances: RwLock::new(Vec::new()),
            cursor: Mutex::new(0),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn algorithm(&self) -> LoadBalancingAlgorithm {
        self.algorithm
    }

    pub fn add_instance(&self, instance: Arc<ProviderInstance>) {
        tracing::debug!(
            model = %self.model_name,
            instance_id = %instance.id(),
            "Added instance to pool"
        );
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance);
    }

    /// Remove an instance by id. Returns whether it was present.
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        let before = instances.len();
        instances.retain(|i| i.id() != instance_id);
        before != instances.len()
    }

    pub fn instances(&self) -> Vec<Arc<ProviderInstance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn find(&self, instance_id: &str) -> Option<Arc<ProviderInstance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|i| i.id() == instance_id)
            .cloned()
    }

    pub fn healthy_instances(&self) -> Vec<Arc<ProviderInstance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect()
    }

    /// Pick an instance among the currently healthy ones.
    ///
    /// The round-robin cursor is taken modulo the length of the healthy list at
    /// call time, so positions can skip or repeat while health is changing.
    pub fn select(&self) -> Result<Arc<ProviderInstance>> {
        let healthy = self.healthy_instances();
        if healthy.is_empty() {
            tracing::warn!(model = %self.model_name, "No healthy instances in pool");
            return Err(AppError::NoHealthyInstance(self.model_name.clone()));
        }

        let index = match self.algorithm {
            LoadBalancingAlgorithm::RoundRobin => self.next_round_robin(healthy.len()),
            LoadBalancingAlgorithm::LeastLoaded => least_loaded_index(&healthy),
            LoadBalancingAlgorithm::Random => thread_rng().gen_range(0..healthy.len()),
            LoadBalancingAlgorithm::WeightedRoundRobin => self.weighted_index(&healthy),
        };

        Ok(Arc::clone(&healthy[index]))
    }

    fn next_round_robin(&self, len: usize) -> usize {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *cursor % len;
        *cursor = (index + 1) % len;
        index
    }

    fn weighted_index(&self, healthy: &[Arc<ProviderInstance>]) -> usize {
        let weights: Vec<u32> = healthy.iter().map(|i| i.settings.weight).collect();
        if weights.iter().all(|w| *w == 0) {
            return self.next_round_robin(healthy.len());
        }
        match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut thread_rng()),
            Err(_) => self.next_round_robin(healthy.len()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let instances = self.instances();
        let snapshots: Vec<InstanceSnapshot> = instances.iter().map(|i| i.snapshot()).collect();
        let healthy = snapshots.iter().filter(|s| s.healthy).count();
        let total = snapshots.len();
        PoolStats {
            model_name: self.model_name.clone(),
            provider_name: self.provider_name.clone(),
            algorithm: self.algorithm,
            total_instances: total,
            healthy_instances: healthy,
            health_percentage: if total > 0 {
                healthy as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            instances: snapshots,
        }
    }
}

/// First instance with the minimal load factor.
fn least_loaded_index(healthy: &[Arc<ProviderInstance>]) -> usize {
    let mut best = 0;
    let mut best_load = f64::INFINITY;
    for (index, instance) in healthy.iter().enumerate() {
        let load = instance.load_factor();
        if load < best_load {
            best = index;
            best_load = load;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn instance(id: &str) -> Arc<ProviderInstance> {
        Arc::new(ProviderInstance::new(InstanceSettings::new(
            "pool-test", "openai", id,
        )))
    }

    fn pool_with(algorithm: LoadBalancingAlgorithm, ids: &[&str]) -> ProviderPool {
        let pool = ProviderPool::new("pool-test", "openai", algorithm);
        for id in ids {
            pool.add_instance(instance(id));
        }
        pool
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "least_loaded".parse::<LoadBalancingAlgorithm>().unwrap(),
            LoadBalancingAlgorithm::LeastLoaded
        );
        assert_eq!(
            LoadBalancingAlgorithm::parse_or_default("fastest"),
            LoadBalancingAlgorithm::RoundRobin
        );
        assert_eq!(
            LoadBalancingAlgorithm::parse_or_default("Weighted_Round_Robin"),
            LoadBalancingAlgorithm::WeightedRoundRobin
        );
    }

    #[test]
    fn test_new_instance_is_healthy_and_idle() {
        let inst = instance("a");
        assert!(inst.is_healthy());
        assert!(inst.can_accept_request());
        assert_eq!(inst.load_factor(), 0.0);
        assert_eq!(inst.success_rate(), 0.0);
    }

    #[test]
    fn test_active_requests_floor_at_zero() {
        let inst = instance("a");
        inst.record_request_complete(true, None);
        assert_eq!(inst.active_requests(), 0);
    }

    #[test]
    fn test_ema_first_sample_then_smoothing() {
        let inst = instance("a");
        inst.record_request_start();
        inst.record_request_complete(true, Some(100.0));
        assert_eq!(inst.avg_response_time_ms(), Some(100.0));

        inst.record_request_start();
        inst.record_request_complete(true, Some(200.0));
        let avg = inst.avg_response_time_ms().unwrap();
        assert!((avg - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_factor_capped_and_zero_capacity() {
        let mut settings = InstanceSettings::new("pool-test", "openai", "zero");
        settings.max_concurrent = 0;
        let inst = ProviderInstance::new(settings);
        assert_eq!(inst.load_factor(), 1.0);

        let mut settings = InstanceSettings::new("pool-test", "openai", "two");
        settings.max_concurrent = 2;
        let inst = ProviderInstance::new(settings);
        inst.record_request_start();
        assert_eq!(inst.load_factor(), 0.5);
        inst.record_request_start();
        inst.record_request_start();
        assert_eq!(inst.load_factor(), 1.0);
        assert!(!inst.can_accept_request());
    }

    #[test]
    fn test_circuit_breaker_trips_and_resets() {
        let inst = instance("cb");
        let start = Instant::now();
        for _ in 0..3 {
            inst.record_request_start();
            inst.record_request_complete_at(false, None, start);
        }
        assert!(inst.is_circuit_open());
        assert!(!inst.is_healthy_at(start + Duration::from_secs(299)));
        assert_eq!(inst.consecutive_failures(), 3);

        assert!(inst.is_healthy_at(start + Duration::from_secs(300)));
        assert_eq!(inst.consecutive_failures(), 0);
        assert!(!inst.is_circuit_open());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let inst = instance("streak");
        inst.record_request_complete(false, None);
        inst.record_request_complete(false, None);
        inst.record_request_complete(true, Some(10.0));
        inst.record_request_complete(false, None);
        assert_eq!(inst.consecutive_failures(), 1);
        assert!(inst.is_healthy());
    }

    #[test]
    fn test_status_gates_health() {
        let inst = instance("s");
        inst.set_status(ProviderStatus::Degraded);
        assert!(inst.is_healthy());
        inst.set_status(ProviderStatus::Unhealthy);
        assert!(!inst.is_healthy());
        inst.set_status(ProviderStatus::Maintenance);
        assert!(!inst.is_healthy());
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let pool = pool_with(LoadBalancingAlgorithm::RoundRobin, &["a", "b", "c"]);
        let picks: Vec<String> = (0..6)
            .map(|_| pool.select().unwrap().id().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_cursor_uses_current_healthy_length() {
        let pool = pool_with(LoadBalancingAlgorithm::RoundRobin, &["a", "b", "c"]);
        assert_eq!(pool.select().unwrap().id(), "a");
        assert_eq!(pool.select().unwrap().id(), "b");
        // cursor is now 2; with only two healthy instances 2 % 2 == 0
        pool.find("a").unwrap().set_status(ProviderStatus::Unhealthy);
        assert_eq!(pool.select().unwrap().id(), "b");
    }

    #[test]
    fn test_least_loaded_prefers_first_on_tie() {
        let pool = pool_with(LoadBalancingAlgorithm::LeastLoaded, &["a", "b", "c"]);
        assert_eq!(pool.select().unwrap().id(), "a");

        pool.find("a").unwrap().record_request_start();
        assert_eq!(pool.select().unwrap().id(), "b");

        pool.find("b").unwrap().record_request_start();
        pool.find("c").unwrap().record_request_start();
        pool.find("c").unwrap().record_request_start();
        assert_eq!(pool.select().unwrap().id(), "a");
    }

    #[test]
    fn test_no_healthy_instance_is_explicit() {
        let pool = pool_with(LoadBalancingAlgorithm::Random, &["a", "b"]);
        for inst in pool.instances() {
            inst.set_status(ProviderStatus::Unhealthy);
        }
        assert_matches!(pool.select(), Err(AppError::NoHealthyInstance(m)) if m == "pool-test");

        pool.find("b").unwrap().set_status(ProviderStatus::Healthy);
        assert_eq!(pool.select().unwrap().id(), "b");
    }

    #[test]
    fn test_empty_pool_fails_selection() {
        let pool = pool_with(LoadBalancingAlgorithm::RoundRobin, &[]);
        assert!(pool.select().is_err());
    }

    #[test]
    fn test_weighted_zero_weights_fall_back_to_round_robin() {
        let pool = ProviderPool::new("pool-test", "openai", LoadBalancingAlgorithm::WeightedRoundRobin);
        for id in ["a", "b"] {
            let mut settings = InstanceSettings::new("pool-test", "openai", id);
            settings.weight = 0;
            pool.add_instance(Arc::new(ProviderInstance::new(settings)));
        }
        let picks: Vec<String> = (0..4)
            .map(|_| pool.select().unwrap().id().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_weighted_selection_distribution() {
        let pool = ProviderPool::new("pool-test", "openai", LoadBalancingAlgorithm::WeightedRoundRobin);
        for (id, weight) in [("heavy", 3), ("light", 1)] {
            let mut settings = InstanceSettings::new("pool-test", "openai", id);
            settings.weight = weight;
            pool.add_instance(Arc::new(ProviderInstance::new(settings)));
        }

        let heavy = (0..4000)
            .filter(|_| pool.select().unwrap().id() == "heavy")
            .count();
        let ratio = heavy as f64 / (4000 - heavy) as f64;
        assert!(ratio > 2.2 && ratio < 4.0, "Ratio was {}", ratio);
    }

    #[test]
    fn test_add_and_remove_instance() {
        let pool = pool_with(LoadBalancingAlgorithm::RoundRobin, &["a"]);
        pool.add_instance(instance("b"));
        assert_eq!(pool.instances().len(), 2);
        assert!(pool.remove_instance("a"));
        assert!(!pool.remove_instance("a"));
        assert_eq!(pool.select().unwrap().id(), "b");
    }

    #[test]
    fn test_pool_stats() {
        let pool = pool_with(LoadBalancingAlgorithm::LeastLoaded, &["a", "b"]);
        pool.find("b").unwrap().set_status(ProviderStatus::Unhealthy);
        let stats = pool.stats();
        assert_eq!(stats.total_instances, 2);
        assert_eq!(stats.healthy_instances, 1);
        assert_eq!(stats.health_percentage, 50.0);
        assert_eq!(stats.algorithm, LoadBalancingAlgorithm::LeastLoaded);
        assert_eq!(stats.instances[1].status, ProviderStatus::Unhealthy);
    }
}
