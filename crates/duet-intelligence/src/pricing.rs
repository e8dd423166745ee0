//! Per-model token rates used to turn usage into cost.

use std::collections::HashMap;

use duet_core::config::PricingEntry;
use duet_core::types::TokenUsage;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Model Pricing
// ---------------------------------------------------------------------------

/// Per-model pricing in USD per 1M tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub provider: String,
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
}

impl ModelPricing {
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        input_cost_per_1m: f64,
        output_cost_per_1m: f64,
    ) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            input_cost_per_1m,
            output_cost_per_1m,
        }
    }

    /// Calculate cost for a request with the given token counts.
    pub fn calculate_cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_cost_per_1m
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_cost_per_1m
    }
}

/// Default pricing table for common models.
pub fn default_pricing_table() -> Vec<ModelPricing> {
    vec![
        ModelPricing::new("claude-opus-4-20250514", "anthropic", 15.0, 75.0),
        ModelPricing::new("claude-sonnet-4-20250514", "anthropic", 3.0, 15.0),
        ModelPricing::new("claude-haiku-4-20250514", "anthropic", 0.80, 4.0),
        ModelPricing::new("gpt-4o", "openai", 2.50, 10.0),
        ModelPricing::new("gpt-4o-mini", "openai", 0.15, 0.60),
    ]
}

// ---------------------------------------------------------------------------
// RateTable
// ---------------------------------------------------------------------------

/// Lookup table from model name to pricing.
#[derive(Debug, Clone)]
pub struct RateTable {
    rates: HashMap<String, ModelPricing>,
}

impl RateTable {
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    /// Built-in table extended (or overridden) by configured entries.
    pub fn with_overrides(entries: &[PricingEntry]) -> Self {
        let mut table = Self::default();
        for entry in entries {
            table.insert(ModelPricing::new(
                entry.model.clone(),
                "configured",
                entry.input_cost_per_1m,
                entry.output_cost_per_1m,
            ));
        }
        table
    }

    pub fn insert(&mut self, pricing: ModelPricing) {
        self.rates.insert(pricing.model.clone(), pricing);
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.rates.get(model)
    }

    /// Cost of `usage` on `model`; 0.0 when the model is not in the table.
    pub fn cost(&self, model: &str, usage: TokenUsage) -> f64 {
        match self.rates.get(model) {
            Some(p) => p.calculate_cost(usage),
            None => {
                debug!(model, "no rate for model; cost recorded as zero");
                0.0
            }
        }
    }
}

impl Default for RateTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for p in default_pricing_table() {
            table.insert(p);
        }
        table
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
