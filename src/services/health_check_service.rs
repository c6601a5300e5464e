//! Health checks run by the load balancer's background sweep.
//!
//! Local backends (Ollama) get a real reachability check against `/api/tags`.
//! Hosted providers are considered healthy when a key is configured, since a
//! real completion call would cost tokens on every sweep.

use crate::services::model_registry::ProviderKind;
use crate::services::provider_pool::ProviderInstance;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434";
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Whether the instance is reachable. Errors are folded into `false`.
    async fn check(&self, instance: &ProviderInstance) -> bool;
}

/// Provider-aware checker backed by the shared reqwest client.
pub struct HttpHealthChecker {
    client: Client,
}

impl HttpHealthChecker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn check_ollama(&self, instance: &ProviderInstance) -> bool {
        let base = instance
            .settings()
            .base_url
            .as_deref()
            .unwrap_or(OLLAMA_DEFAULT_BASE)
            .trim_end_matches('/');
        // base_url may point at the OpenAI-compatible /v1 root
        let base = base.strip_suffix("/v1").unwrap_or(base);
        let url = format!("{}/api/tags", base);

        match self.client.get(&url).timeout(CHECK_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(
                    instance_id = %instance.id(),
                    url = %url,
                    error = %e,
                    "Ollama health check failed"
                );
                false
            }
        }
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, instance: &ProviderInstance) -> bool {
        let kind = ProviderKind::from_name(instance.provider_name());
        match kind {
            ProviderKind::Ollama => self.check_ollama(instance).await,
            kind if kind.requires_api_key() => instance
                .settings()
                .api_key
                .as_deref()
                .is_some_and(|k| !k.is_empty()),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::provider_pool::InstanceSettings;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance(provider: &str, base_url: Option<String>, api_key: Option<&str>) -> ProviderInstance {
        let mut settings = InstanceSettings::new("health-test", provider, format!("{}_default", provider));
        settings.base_url = base_url;
        settings.api_key = api_key.map(str::to_string);
        ProviderInstance::new(settings)
    }

    #[tokio::test]
    async fn test_hosted_provider_requires_key() {
        let checker = HttpHealthChecker::new(Client::new());
        assert!(checker.check(&instance("openai", None, Some("sk-1"))).await);
        assert!(!checker.check(&instance("anthropic", None, None)).await);
        assert!(!checker.check(&instance("deepseek", None, Some(""))).await);
        assert!(checker.check(&instance("google", None, None)).await);
    }

    #[tokio::test]
    async fn test_ollama_check_hits_tags_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .expect(2)
            .mount(&server)
            .await;

        let checker = HttpHealthChecker::new(Client::new());
        assert!(checker.check(&instance("ollama", Some(server.uri()), None)).await);
        assert!(
            checker
                .check(&instance("ollama", Some(format!("{}/v1", server.uri())), None))
                .await
        );
    }

    #[tokio::test]
    async fn test_ollama_check_failure_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let checker = HttpHealthChecker::new(Client::new());
        assert!(!checker.check(&instance("ollama", Some(server.uri()), None)).await);
    }
}
