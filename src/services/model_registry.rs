//! Logical model lookup and provider inference.

use crate::core::config::{AppConfig, ModelConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Backend family a model is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    DeepSeek,
    Ollama,
    Google,
    Unknown,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::DeepSeek => "deepseek",
            Self::Ollama => "ollama",
            Self::Google => "google",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "anthropic" => Self::Anthropic,
            "deepseek" => Self::DeepSeek,
            "ollama" => Self::Ollama,
            "google" | "gemini" => Self::Google,
            _ => Self::Unknown,
        }
    }

    /// Infer the provider from an upstream model id such as `claude-3-haiku`,
    /// `ollama/llama3` or `llama3:8b`.
    pub fn infer(model: &str) -> Self {
        if let Some((prefix, _)) = model.split_once('/') {
            let explicit = Self::from_name(prefix);
            if explicit != Self::Unknown {
                return explicit;
            }
        }

        if model.starts_with("claude") {
            Self::Anthropic
        } else if model.starts_with("deepseek") {
            Self::DeepSeek
        } else if model.starts_with("gpt") || model.starts_with("text-") {
            Self::OpenAi
        } else if model.contains(':') {
            Self::Ollama
        } else if model.starts_with("gemini") {
            Self::Google
        } else {
            Self::Unknown
        }
    }

    /// OpenAI-compatible base URL used when none is configured.
    pub fn default_api_base(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::Anthropic => Some("https://api.anthropic.com/v1"),
            Self::DeepSeek => Some("https://api.deepseek.com/v1"),
            Self::Ollama => Some("http://localhost:11434/v1"),
            Self::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Self::Unknown => None,
        }
    }

    /// Hosted providers are only usable with a key.
    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Anthropic | Self::DeepSeek)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remove a known `provider/` prefix from an upstream model id.
pub fn strip_provider_prefix(model: &str) -> &str {
    match model.split_once('/') {
        Some((prefix, rest)) if ProviderKind::from_name(prefix) != ProviderKind::Unknown => rest,
        _ => model,
    }
}

/// Resolved upstream parameters for one logical model.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub model_name: String,
    /// Upstream model id as configured, possibly with a provider prefix
    pub upstream_model: String,
    pub provider: ProviderKind,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    /// Extra per-model request parameters merged under caller overrides
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Lookup of logical model names.
pub trait ModelConfigResolver: Send + Sync {
    fn get_params(&self, model: &str) -> Option<ModelParams>;

    fn get_provider(&self, model: &str) -> Option<ProviderKind> {
        self.get_params(model).map(|p| p.provider)
    }

    fn list_models(&self) -> Vec<String>;
}

/// Models from `model_list`, in configuration order.
pub struct ModelRegistry {
    order: Vec<String>,
    models: HashMap<String, ModelParams>,
}

impl ModelRegistry {
    pub fn from_config(config: &AppConfig) -> Self {
        let mut order = Vec::with_capacity(config.model_list.len());
        let mut models = HashMap::with_capacity(config.model_list.len());
        for model in &config.model_list {
            if models.contains_key(&model.model_name) {
                tracing::warn!(model = %model.model_name, "Duplicate model_name ignored");
                continue;
            }
            order.push(model.model_name.clone());
            models.insert(model.model_name.clone(), params_from(model));
        }
        Self { order, models }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn params_from(model: &ModelConfig) -> ModelParams {
    let params = &model.litellm_params;
    ModelParams {
        model_name: model.model_name.clone(),
        upstream_model: params.model.clone(),
        provider: ProviderKind::infer(&params.model),
        api_base: params.api_base.clone(),
        api_key: params.api_key.clone().filter(|k| !k.is_empty()),
        extra: params.extra.clone(),
    }
}

impl ModelConfigResolver for ModelRegistry {
    fn get_params(&self, model: &str) -> Option<ModelParams> {
        self.models.get(model).cloned()
    }

    fn list_models(&self) -> Vec<String> {
        self.order.clone()
    }
}
