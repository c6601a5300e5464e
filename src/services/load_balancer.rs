//! Model-keyed provider pools and the background health-check loop.

use crate::core::cancel::CancellationSignal;
use crate::core::config::{AppConfig, InstanceConfig};
use crate::core::error::{AppError, Result};
use crate::services::health_check_service::HealthChecker;
use crate::services::model_registry::ProviderKind;
use crate::services::provider_pool::{
    InstanceSettings, LoadBalancingAlgorithm, PoolStats, ProviderInstance, ProviderPool,
    ProviderStatus,
};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use utoipa::ToSchema;

/// Upper bound on a single check so one hung backend cannot stall a sweep.
const CHECK_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoadBalancerStats {
    pub total_pools: usize,
    pub healthy_pools: usize,
    pub pools: BTreeMap<String, PoolStats>,
}

struct HealthTask {
    cancel: CancellationSignal,
    handle: JoinHandle<()>,
}

/// Owns one [`ProviderPool`] per logical model.
pub struct LoadBalancer {
    pools: DashMap<String, Arc<ProviderPool>>,
    health_check_interval: Duration,
    health_task: Mutex<Option<HealthTask>>,
}

impl LoadBalancer {
    pub fn new(health_check_interval: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            health_check_interval,
            health_task: Mutex::new(None),
        }
    }

    /// Build pools for every configured model.
    ///
    /// Models without an explicit instance list get a single `{provider}_default`
    /// instance using the model's own `api_base` and `api_key`.
    pub fn from_config(config: &AppConfig) -> Self {
        let lb_settings = &config.router_settings.load_balancing;
        let algorithm = LoadBalancingAlgorithm::parse_or_default(&lb_settings.algorithm);
        let balancer = Self::new(Duration::from_secs(lb_settings.health_check_interval.max(1)));

        for model in &config.model_list {
            let params = &model.litellm_params;
            let provider = ProviderKind::infer(&params.model);
            let pool = ProviderPool::new(&model.model_name, provider.as_str(), algorithm);

            match lb_settings.instances.get(&model.model_name) {
                Some(configured) if !configured.is_empty() => {
                    for (index, instance) in configured.iter().enumerate() {
                        let id = instance
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("{}_{}", provider, index));
                        let mut settings = settings_from(&model.model_name, provider, id, instance);
                        if settings.base_url.is_none() {
                            settings.base_url = params.api_base.clone();
                        }
                        if settings.api_key.is_none() {
                            settings.api_key = params.api_key.clone();
                        }
                        pool.add_instance(Arc::new(ProviderInstance::new(settings)));
                    }
                }
                _ => {
                    let mut settings = InstanceSettings::new(
                        &model.model_name,
                        provider.as_str(),
                        format!("{}_default", provider),
                    );
                    settings.base_url = params.api_base.clone();
                    settings.api_key = params.api_key.clone();
                    pool.add_instance(Arc::new(ProviderInstance::new(settings)));
                }
            }

            tracing::info!(
                model = %model.model_name,
                provider = %provider,
                algorithm = %algorithm,
                instances = pool.instances().len(),
                "Initialized provider pool"
            );
            balancer.add_pool(Arc::new(pool));
        }

        balancer
    }

    pub fn add_pool(&self, pool: Arc<ProviderPool>) {
        self.pools.insert(pool.model_name().to_string(), pool);
    }

    pub fn pool(&self, model: &str) -> Option<Arc<ProviderPool>> {
        self.pools.get(model).map(|p| Arc::clone(p.value()))
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn select_instance(&self, model: &str) -> Result<Arc<ProviderInstance>> {
        let pool = self
            .pool(model)
            .ok_or_else(|| AppError::NoPool(model.to_string()))?;
        pool.select()
    }

    pub fn record_request_result(
        &self,
        model: &str,
        instance_id: &str,
        success: bool,
        response_time_ms: Option<f64>,
    ) {
        let Some(instance) = self.pool(model).and_then(|p| p.find(instance_id)) else {
            tracing::warn!(
                model = %model,
                instance_id = %instance_id,
                "Result recorded for unknown instance"
            );
            return;
        };
        instance.record_request_complete(success, response_time_ms);
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let pools: BTreeMap<String, PoolStats> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        let healthy_pools = pools.values().filter(|p| p.healthy_instances > 0).count();
        LoadBalancerStats {
            total_pools: pools.len(),
            healthy_pools,
            pools,
        }
    }

    pub fn pool_stats(&self, model: &str) -> Option<PoolStats> {
        self.pool(model).map(|p| p.stats())
    }

    /// Check every instance whose health-check interval has elapsed.
    ///
    /// Instances in maintenance are left alone.
    pub async fn run_health_checks(&self, checker: &dyn HealthChecker) {
        for pool in self.pools.iter().map(|p| Arc::clone(p.value())).collect::<Vec<_>>() {
            for instance in pool.instances() {
                let now = Instant::now();
                if instance.status() == ProviderStatus::Maintenance
                    || !instance.needs_health_check(now)
                {
                    continue;
                }

                let healthy = tokio::time::timeout(CHECK_DEADLINE, checker.check(&instance))
                    .await
                    .unwrap_or(false);
                instance.set_status(if healthy {
                    ProviderStatus::Healthy
                } else {
                    ProviderStatus::Unhealthy
                });
                instance.mark_health_checked(now);

                if !healthy {
                    tracing::warn!(
                        model = %pool.model_name(),
                        instance_id = %instance.id(),
                        "Health check failed"
                    );
                }
            }
        }
    }

    /// Start the periodic sweep. A second call while running is a no-op.
    pub fn start_health_checks(self: &Arc<Self>, checker: Arc<dyn HealthChecker>) {
        let mut task = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            tracing::warn!("Health checks already running");
            return;
        }

        let cancel = CancellationSignal::new();
        let balancer = Arc::clone(self);
        let stop = cancel.clone();
        let interval = self.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => balancer.run_health_checks(checker.as_ref()).await,
                    _ = stop.cancelled() => break,
                }
            }
            tracing::info!("Health check loop stopped");
        });

        tracing::info!(interval_secs = interval.as_secs(), "Started health checks");
        *task = Some(HealthTask { cancel, handle });
    }

    /// Cancel the sweep and wait for it to exit.
    pub async fn stop_health_checks(&self) {
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::error!("Health check task ended abnormally: {}", e);
            }
        }
    }

    pub fn health_checks_running(&self) -> bool {
        self.health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn settings_from(
    model_name: &str,
    provider: ProviderKind,
    id: String,
    config: &InstanceConfig,
) -> InstanceSettings {
    InstanceSettings {
        model_name: model_name.to_string(),
        provider_name: provider.as_str().to_string(),
        instance_id: id,
        base_url: config.base_url.clone(),
        api_key: config.api_key.clone(),
        weight: config.weight,
        max_concurrent: config.max_concurrent,
        timeout: Duration::from_secs(config.timeout),
        max_consecutive_failures: config.max_consecutive_failures,
        circuit_breaker_timeout: Duration::from_secs(config.circuit_breaker_timeout),
        health_check_interval: Duration::from_secs(config.health_check_interval),
        max_queue_size: config.max_queue_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{LitellmParams, ModelConfig};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedChecker {
        healthy: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthChecker for FixedChecker {
        async fn check(&self, _instance: &ProviderInstance) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.healthy
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig {
            model_list: vec![
                ModelConfig {
                    model_name: "haiku".into(),
                    litellm_params: LitellmParams {
                        model: "claude-3-haiku".into(),
                        api_key: Some("sk-ant".into()),
                        ..Default::default()
                    },
                },
                ModelConfig {
                    model_name: "local".into(),
                    litellm_params: LitellmParams {
                        model: "llama3:8b".into(),
                        api_base: Some("http://gpu-box:11434/v1".into()),
                        ..Default::default()
                    },
                },
            ],
            ..Default::default()
        };
        config.router_settings.load_balancing.algorithm = "least_loaded".into();
        config.router_settings.load_balancing.instances.insert(
            "local".into(),
            vec![
                InstanceConfig {
                    id: Some("gpu-a".into()),
                    weight: 2,
                    ..Default::default()
                },
                InstanceConfig::default(),
            ],
        );
        config
    }

    #[test]
    fn test_from_config_builds_default_and_configured_instances() {
        let lb = LoadBalancer::from_config(&config());

        let haiku = lb.pool("haiku").unwrap();
        let instances = haiku.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id(), "anthropic_default");
        assert_eq!(instances[0].settings().api_key.as_deref(), Some("sk-ant"));
        assert_eq!(haiku.algorithm(), LoadBalancingAlgorithm::LeastLoaded);

        let local = lb.pool("local").unwrap();
        let ids: Vec<String> = local.instances().iter().map(|i| i.id().to_string()).collect();
        assert_eq!(ids, vec!["gpu-a", "ollama_1"]);
        assert_eq!(
            local.instances()[1].settings().base_url.as_deref(),
            Some("http://gpu-box:11434/v1")
        );
    }

    #[test]
    fn test_invalid_algorithm_falls_back() {
        let mut config = config();
        config.router_settings.load_balancing.algorithm = "fastest_first".into();
        let lb = LoadBalancer::from_config(&config);
        assert_eq!(
            lb.pool("haiku").unwrap().algorithm(),
            LoadBalancingAlgorithm::RoundRobin
        );
    }

    #[test]
    fn test_select_unknown_model_is_no_pool() {
        let lb = LoadBalancer::from_config(&config());
        assert_matches!(lb.select_instance("nope"), Err(AppError::NoPool(_)));
    }

    #[test]
    fn test_record_request_result_updates_instance() {
        let lb = LoadBalancer::from_config(&config());
        let instance = lb.select_instance("haiku").unwrap();
        instance.record_request_start();
        lb.record_request_result("haiku", instance.id(), true, Some(42.0));
        assert_eq!(instance.active_requests(), 0);
        assert_eq!(instance.avg_response_time_ms(), Some(42.0));

        // unknown ids are ignored
        lb.record_request_result("haiku", "ghost", false, None);
    }

    #[test]
    fn test_stats_counts_healthy_pools() {
        let lb = LoadBalancer::from_config(&config());
        for instance in lb.pool("local").unwrap().instances() {
            instance.set_status(ProviderStatus::Unhealthy);
        }
        let stats = lb.stats();
        assert_eq!(stats.total_pools, 2);
        assert_eq!(stats.healthy_pools, 1);
        assert_eq!(stats.pools["local"].healthy_instances, 0);
        assert!(lb.pool_stats("haiku").is_some());
        assert!(lb.pool_stats("missing").is_none());
    }

    #[tokio::test]
    async fn test_health_sweep_respects_interval_and_maintenance() {
        let mut config = config();
        config
            .router_settings
            .load_balancing
            .instances
            .get_mut("local")
            .unwrap()
            .iter_mut()
            .for_each(|i| i.health_check_interval = 0);
        let lb = LoadBalancer::from_config(&config);
        lb.pool("local").unwrap().instances()[1].set_status(ProviderStatus::Maintenance);

        let checker = FixedChecker {
            healthy: false,
            calls: AtomicUsize::new(0),
        };
        lb.run_health_checks(&checker).await;

        // haiku's default instance was just created, so its 60s interval has not elapsed
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
        let local = lb.pool("local").unwrap().instances();
        assert_eq!(local[0].status(), ProviderStatus::Unhealthy);
        assert_eq!(local[1].status(), ProviderStatus::Maintenance);
    }

    #[tokio::test]
    async fn test_start_and_stop_health_checks() {
        let lb = Arc::new(LoadBalancer::new(Duration::from_millis(10)));
        let checker = Arc::new(FixedChecker {
            healthy: true,
            calls: AtomicUsize::new(0),
        });
        lb.start_health_checks(checker.clone());
        lb.start_health_checks(checker);
        assert!(lb.health_checks_running());

        lb.stop_health_checks().await;
        assert!(!lb.health_checks_running());
    }
}
