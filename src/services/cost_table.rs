//! Fixed-rate pricing lookup.

use crate::core::config::AppConfig;
use std::collections::HashMap;

/// Per-token rates in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenRates {
    pub input: f64,
    pub output: f64,
}

pub trait CostTable: Send + Sync {
    /// Cost in USD; 0.0 for models without pricing.
    fn price_for(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64;
}

/// Rates keyed by upstream model id.
#[derive(Debug, Clone, Default)]
pub struct StaticCostTable {
    rates: HashMap<String, TokenRates>,
}

impl StaticCostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, model: impl Into<String>, input: f64, output: f64) -> Self {
        self.rates.insert(model.into(), TokenRates { input, output });
        self
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let rates = config
            .custom_costs
            .iter()
            .map(|(model, cost)| {
                (
                    model.clone(),
                    TokenRates {
                        input: cost.input_cost_per_token,
                        output: cost.output_cost_per_token,
                    },
                )
            })
            .collect();
        Self { rates }
    }
}

impl CostTable for StaticCostTable {
    fn price_for(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        match self.rates.get(model) {
            Some(rates) => input_tokens as f64 * rates.input + output_tokens as f64 * rates.output,
            None => {
                tracing::debug!(model = %model, "No pricing configured, cost recorded as 0");
                0.0
            }
        }
    }
}
