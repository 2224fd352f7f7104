//! Model pricing and cost estimation.
//!
//! Rates are USD per million tokens. Lookups match by substring so dated
//! model ids (`gpt-4o-2024-08-06`) resolve to their family. Entries are
//! checked longest-key first so `gpt-4o-mini` wins over `gpt-4o`; among
//! keys of equal length the alphabetically first one applies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::TokenUsage;

/// Chars-per-token heuristic used for projected input size.
pub const CHARS_PER_TOKEN: usize = 4;

/// Price of one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// USD per million input tokens
    pub input: f64,

    /// USD per million output tokens
    pub output: f64,
}

impl ModelPrice {
    /// Create a price entry.
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Cost of a usage at this price.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output
    }
}

/// Pricing table with a fallback rate for unknown models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    models: BTreeMap<String, ModelPrice>,

    #[serde(default = "default_price")]
    default: ModelPrice,
}

fn default_price() -> ModelPrice {
    // Sonnet-class pricing
    ModelPrice::new(3.0, 15.0)
}

impl Default for PricingTable {
    fn default() -> Self {
        let models = [
            ("claude-sonnet-4-5", ModelPrice::new(3.0, 15.0)),
            ("claude-opus-4-5", ModelPrice::new(5.0, 25.0)),
            ("claude-haiku-4-5", ModelPrice::new(1.0, 5.0)),
            ("gpt-4o-mini", ModelPrice::new(0.15, 0.6)),
            ("gpt-4o", ModelPrice::new(2.5, 10.0)),
            ("gpt-4.1-mini", ModelPrice::new(0.4, 1.6)),
            ("gpt-4.1", ModelPrice::new(2.0, 8.0)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            models,
            default: default_price(),
        }
    }
}

impl PricingTable {
    /// Empty table that prices everything at `default`.
    pub fn flat(default: ModelPrice) -> Self {
        Self {
            models: BTreeMap::new(),
            default,
        }
    }

    /// Add or replace a model price.
    pub fn insert(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.models.insert(model.into(), price);
    }

    /// Overlay another table's explicit entries on this one.
    pub fn merge(&mut self, overrides: &BTreeMap<String, ModelPrice>) {
        for (model, price) in overrides {
            self.models.insert(model.clone(), *price);
        }
    }

    /// Price for a model id.
    pub fn price(&self, model_id: &str) -> ModelPrice {
        if let Some(price) = self.models.get(model_id) {
            return *price;
        }
        self.models
            .iter()
            .filter(|(key, _)| model_id.contains(key.as_str()))
            // Longest key wins; equal lengths go to the first key in order
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(_, price)| *price)
            .unwrap_or(self.default)
    }

    /// Cost of a usage on a model.
    pub fn cost(&self, model_id: &str, usage: &TokenUsage) -> f64 {
        self.price(model_id).cost(usage)
    }

    /// Projected cost of a call before it is made.
    pub fn projected_cost(&self, model_id: &str, payload_chars: usize, max_output_tokens: u32) -> f64 {
        let usage = TokenUsage {
            input_tokens: (payload_chars / CHARS_PER_TOKEN) as u32,
            output_tokens: max_output_tokens,
        };
        self.cost(model_id, &usage)
    }
}
