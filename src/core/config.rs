//! Configuration management for the gateway.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion and overrides.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CHATVAULT_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-?([^}]*))?\}").expect("valid env pattern")
});

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Master key, JWT and enforcement settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// PostgreSQL URL for usage logs; in-memory logging when absent
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_true")]
    pub enable_usage_logging: bool,

    #[serde(default = "default_true")]
    pub enable_cost_calculation: bool,

    /// Timeout in seconds for the shared upstream HTTP client
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// Logical models exposed to callers
    #[serde(default)]
    pub model_list: Vec<ModelConfig>,

    #[serde(default)]
    pub router_settings: RouterSettings,

    /// Named API clients with their own bearer tokens
    #[serde(default)]
    pub clients: HashMap<String, ClientConfig>,

    /// Per-token pricing keyed by upstream model id
    #[serde(default)]
    pub custom_costs: HashMap<String, CustomCost>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            database_url: None,
            enable_usage_logging: true,
            enable_cost_calculation: true,
            request_timeout_secs: default_request_timeout(),
            verify_ssl: true,
            model_list: Vec::new(),
            router_settings: RouterSettings::default(),
            clients: HashMap::new(),
            custom_costs: HashMap::new(),
        }
    }
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Master API key; grants access to every model
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_true")]
    pub auth_required: bool,

    /// HS256 secret for bearer JWTs; JWT auth is disabled when absent
    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            auth_required: true,
            jwt_secret: None,
            jwt_issuer: default_jwt_issuer(),
        }
    }
}

/// One entry of `model_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name callers use in requests
    pub model_name: String,

    pub litellm_params: LitellmParams,
}

/// Upstream parameters for a logical model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LitellmParams {
    /// Upstream model id, optionally prefixed with `provider/`
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub api_base: Option<String>,

    /// Any other request parameters (temperature, max_tokens, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default)]
    pub load_balancing: LoadBalancingSettings,

    #[serde(default)]
    pub rate_limit_per_user: RateLimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingSettings {
    /// One of round_robin, least_loaded, random, weighted_round_robin
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Seconds between health-check sweeps
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Explicit instances per logical model name
    #[serde(default)]
    pub instances: HashMap<String, Vec<InstanceConfig>>,
}

impl Default for LoadBalancingSettings {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            health_check_interval: default_health_check_interval(),
            instances: HashMap::new(),
        }
    }
}

/// One backend endpoint in a model's pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Seconds
    #[serde(default = "default_instance_timeout")]
    pub timeout: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Seconds
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout: u64,

    /// Seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            id: None,
            base_url: None,
            api_key: None,
            weight: default_weight(),
            max_concurrent: default_max_concurrent(),
            timeout: default_instance_timeout(),
            max_consecutive_failures: default_max_consecutive_failures(),
            circuit_breaker_timeout: default_circuit_breaker_timeout(),
            health_check_interval: default_health_check_interval(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            window_seconds: default_window_seconds(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// A named API client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Model names this client may call; `*` allows all
    #[serde(default)]
    pub allowed_models: Vec<String>,

    /// Overrides the global per-user limit
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomCost {
    #[serde(default)]
    pub input_cost_per_token: f64,

    #[serde(default)]
    pub output_cost_per_token: f64,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_request_timeout() -> u64 {
    300
}

fn default_jwt_issuer() -> String {
    "chatvault".to_string()
}

fn default_algorithm() -> String {
    "round_robin".to_string()
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_weight() -> u32 {
    1
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_instance_timeout() -> u64 {
    30
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_circuit_breaker_timeout() -> u64 {
    300
}

fn default_max_queue_size() -> usize {
    100
}

fn default_requests_per_minute() -> u32 {
    100
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chatvault_gateway::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        // Skip .env in tests to avoid interference
        #[cfg(not(test))]
        dotenvy::dotenv().ok();

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let expanded = expand_env_vars(&content);

        let mut config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolve the startup configuration.
    ///
    /// The path comes from `CHATVAULT_CONFIG` and defaults to
    /// [`DEFAULT_CONFIG_PATH`]. A missing file falls back to [`AppConfig::from_env`];
    /// a file that exists but cannot be read or parsed is an error.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        Self::load_or_env(&path)
    }

    /// Load `path` when it exists, otherwise defaults plus environment overrides.
    pub fn load_or_env(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            tracing::info!("Loading configuration from {}", path);
            Self::load(path)
        } else {
            tracing::warn!(
                "Config file {} not found, using environment configuration",
                path
            );
            Ok(Self::from_env())
        }
    }

    /// Defaults plus environment overrides, with no models configured.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT") {
            self.server.port = port;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.database_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("CHATVAULT_API_KEY") {
            if !key.is_empty() {
                self.auth.api_key = Some(key);
            }
        }
        if let Ok(value) = std::env::var("AUTH_REQUIRED") {
            self.auth.auth_required = str_to_bool(&value);
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                self.auth.jwt_secret = Some(secret);
            }
        }
        if let Some(requests) = env_parse::<u32>("RATE_LIMIT_REQUESTS") {
            self.router_settings.rate_limit_per_user.requests_per_minute = requests;
        }
        if let Some(window) = env_parse::<u64>("RATE_LIMIT_WINDOW") {
            self.router_settings.rate_limit_per_user.window_seconds = window;
        }
        if let Some(timeout) = env_parse::<u64>("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = timeout;
        }
        if let Ok(value) = std::env::var("ENABLE_USAGE_LOGGING") {
            self.enable_usage_logging = str_to_bool(&value);
        }
        if let Ok(value) = std::env::var("ENABLE_COST_CALCULATION") {
            self.enable_cost_calculation = str_to_bool(&value);
        }
        if let Ok(value) = std::env::var("VERIFY_SSL") {
            self.verify_ssl = str_to_bool(&value);
        }
    }

    /// Look up a `model_list` entry by its public name.
    pub fn find_model(&self, model_name: &str) -> Option<&ModelConfig> {
        self.model_list.iter().find(|m| m.model_name == model_name)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}. An unset or empty
/// variable takes the default, or the empty string when none is given.
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            match std::env::var(&caps[1]) {
                Ok(value) if !value.is_empty() => value,
                _ => default_value.to_string(),
            }
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
pub(crate) fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const OVERRIDE_VARS: &[&str] = &[
        "HOST",
        "PORT",
        "DATABASE_URL",
        "CHATVAULT_API_KEY",
        "AUTH_REQUIRED",
        "JWT_SECRET",
        "RATE_LIMIT_REQUESTS",
        "RATE_LIMIT_WINDOW",
        "REQUEST_TIMEOUT_SECS",
        "ENABLE_USAGE_LOGGING",
        "ENABLE_COST_CALCULATION",
        "VERIFY_SSL",
    ];

    fn clear_overrides() {
        for var in OVERRIDE_VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    #[serial]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("CV_TEST_KEY", "sk-test");
        }
        assert_eq!(expand_env_vars("key: ${CV_TEST_KEY}"), "key: sk-test");
        unsafe {
            std::env::remove_var("CV_TEST_KEY");
        }
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_with_default() {
        unsafe {
            std::env::remove_var("CV_TEST_MISSING");
        }
        assert_eq!(
            expand_env_vars("url: ${CV_TEST_MISSING:-http://localhost:11434}"),
            "url: http://localhost:11434"
        );
        assert_eq!(expand_env_vars("n: ${CV_TEST_MISSING:5}"), "n: 5");
        assert_eq!(expand_env_vars("n: ${CV_TEST_MISSING}"), "n: ");
    }

    #[test]
    fn test_str_to_bool() {
        assert!(str_to_bool("true"));
        assert!(str_to_bool("TRUE"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("yes"));
        assert!(str_to_bool("on"));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool(""));
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 4000);
        assert!(config.auth.auth_required);
        assert!(config.enable_usage_logging);
        assert_eq!(config.router_settings.load_balancing.algorithm, "round_robin");
        assert_eq!(config.router_settings.load_balancing.health_check_interval, 60);
        assert_eq!(config.router_settings.rate_limit_per_user.requests_per_minute, 100);
        assert_eq!(config.router_settings.rate_limit_per_user.window_seconds, 60);
        assert_eq!(config.router_settings.rate_limit_per_user.cleanup_interval_secs, 300);
    }

    #[test]
    fn test_instance_config_defaults() {
        let instance: InstanceConfig = serde_yaml::from_str("base_url: http://a").unwrap();
        assert_eq!(instance.weight, 1);
        assert_eq!(instance.max_concurrent, 10);
        assert_eq!(instance.timeout, 30);
        assert_eq!(instance.max_consecutive_failures, 3);
        assert_eq!(instance.circuit_breaker_timeout, 300);
        assert_eq!(instance.max_queue_size, 100);
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        clear_overrides();

        let temp_file = write_config(
            r#"
server:
  host: 127.0.0.1
  port: 8080
auth:
  api_key: master-key
model_list:
  - model_name: claude-haiku
    litellm_params:
      model: claude-3-haiku-20240307
      api_key: sk-ant
      temperature: 0.2
  - model_name: local-llama
    litellm_params:
      model: llama3:8b
      api_base: http://localhost:11434
router_settings:
  load_balancing:
    algorithm: least_loaded
    instances:
      local-llama:
        - id: gpu-a
          base_url: http://gpu-a:11434
          weight: 3
        - base_url: http://gpu-b:11434
  rate_limit_per_user:
    requests_per_minute: 20
clients:
  mobile:
    bearer_token: tok-mobile
    allowed_models: [claude-haiku]
    requests_per_minute: 5
custom_costs:
  claude-3-haiku-20240307:
    input_cost_per_token: 0.00000025
    output_cost_per_token: 0.00000125
"#,
        );

        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.auth.api_key.as_deref(), Some("master-key"));
        assert_eq!(config.model_list.len(), 2);

        let haiku = config.find_model("claude-haiku").unwrap();
        assert_eq!(haiku.litellm_params.model, "claude-3-haiku-20240307");
        assert_eq!(haiku.litellm_params.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(
            haiku.litellm_params.extra.get("temperature"),
            Some(&serde_json::json!(0.2))
        );

        let lb = &config.router_settings.load_balancing;
        assert_eq!(lb.algorithm, "least_loaded");
        let instances = &lb.instances["local-llama"];
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id.as_deref(), Some("gpu-a"));
        assert_eq!(instances[0].weight, 3);
        assert_eq!(instances[1].id, None);

        assert_eq!(config.router_settings.rate_limit_per_user.requests_per_minute, 20);
        assert_eq!(config.clients["mobile"].requests_per_minute, Some(5));
        assert_eq!(config.clients["mobile"].allowed_models, vec!["claude-haiku"]);
        assert!(config.custom_costs["claude-3-haiku-20240307"].output_cost_per_token > 0.0);
    }

    #[test]
    #[serial]
    fn test_load_config_with_env_vars() {
        clear_overrides();
        unsafe {
            std::env::set_var("CV_TEST_ANTHROPIC_KEY", "env-key");
        }

        let temp_file = write_config(
            r#"
model_list:
  - model_name: claude
    litellm_params:
      model: claude-3-5-sonnet
      api_key: ${CV_TEST_ANTHROPIC_KEY}
"#,
        );

        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(
            config.model_list[0].litellm_params.api_key.as_deref(),
            Some("env-key")
        );

        unsafe {
            std::env::remove_var("CV_TEST_ANTHROPIC_KEY");
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(AppConfig::load("nonexistent_file.yaml").is_err());
    }

    #[test]
    #[serial]
    fn test_load_or_env_falls_back_when_file_missing() {
        clear_overrides();
        unsafe {
            std::env::set_var("PORT", "9200");
        }

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.yaml");
        let config = AppConfig::load_or_env(missing.to_str().unwrap()).unwrap();

        assert_eq!(config.server.port, 9200);
        assert!(config.model_list.is_empty());

        clear_overrides();
    }

    #[test]
    #[serial]
    fn test_load_or_env_reads_existing_file() {
        clear_overrides();
        let temp_file = write_config(
            r#"
server:
  port: 8181
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
"#,
        );

        let config = AppConfig::load_or_env(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 8181);
        assert!(config.find_model("gpt-4o").is_some());
    }

    #[test]
    #[serial]
    fn test_load_or_env_rejects_invalid_existing_file() {
        clear_overrides();
        let temp_file = write_config("model_list: [this is: not: valid");
        assert!(AppConfig::load_or_env(temp_file.path().to_str().unwrap()).is_err());
    }

    #[test]
    #[serial]
    fn test_load_default_uses_config_path_env() {
        clear_overrides();
        let temp_file = write_config("server:\n  port: 8282\n");
        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, temp_file.path().to_str().unwrap());
        }

        let config = AppConfig::load_default().unwrap();
        assert_eq!(config.server.port, 8282);

        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let temp_file = write_config("model_list: [this is: not: valid");
        assert!(AppConfig::load(temp_file.path().to_str().unwrap()).is_err());
    }

    #[test]
    #[serial]
    fn test_env_var_overrides() {
        clear_overrides();
        unsafe {
            std::env::set_var("PORT", "9100");
            std::env::set_var("AUTH_REQUIRED", "false");
            std::env::set_var("RATE_LIMIT_REQUESTS", "7");
            std::env::set_var("ENABLE_COST_CALCULATION", "no");
        }

        let config = AppConfig::from_env();
        assert_eq!(config.server.port, 9100);
        assert!(!config.auth.auth_required);
        assert_eq!(config.router_settings.rate_limit_per_user.requests_per_minute, 7);
        assert!(!config.enable_cost_calculation);

        clear_overrides();
    }
}
