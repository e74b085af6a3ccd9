//! Token and cost accounting for oracle calls.
//!
//! Informational only: counters are monotonic and never feed back into
//! control flow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::Usage;

/// Model used for pricing when the configured model has no table entry.
pub const FALLBACK_MODEL: &str = "gpt-4o";

/// USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl ModelPrice {
    const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }
}

/// Built-in price table keyed by model name.
pub fn default_pricing() -> BTreeMap<String, ModelPrice> {
    [
        ("gpt-5.2", ModelPrice::new(1.75, 14.00)),
        ("gpt-5.2-pro", ModelPrice::new(21.00, 168.00)),
        ("gpt-5.2-codex", ModelPrice::new(1.75, 14.00)),
        ("gpt-5.1", ModelPrice::new(1.25, 10.00)),
        ("gpt-5.1-codex", ModelPrice::new(1.25, 10.00)),
        ("gpt-5", ModelPrice::new(1.25, 10.00)),
        ("gpt-5-pro", ModelPrice::new(15.00, 120.00)),
        ("gpt-5-mini", ModelPrice::new(0.25, 2.00)),
        ("gpt-5-nano", ModelPrice::new(0.05, 0.40)),
        ("gpt-4o", ModelPrice::new(2.50, 10.00)),
        ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
        ("gpt-4-turbo", ModelPrice::new(10.00, 30.00)),
        ("gpt-4", ModelPrice::new(30.00, 60.00)),
        ("gpt-4.1", ModelPrice::new(2.00, 8.00)),
        ("gpt-4.1-mini", ModelPrice::new(0.40, 1.60)),
        ("gpt-4.1-nano", ModelPrice::new(0.10, 0.40)),
        ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50)),
        ("o1", ModelPrice::new(15.00, 60.00)),
        ("o1-pro", ModelPrice::new(150.00, 600.00)),
        ("o3", ModelPrice::new(2.00, 8.00)),
        ("o3-mini", ModelPrice::new(1.10, 4.40)),
        ("o4-mini", ModelPrice::new(1.10, 4.40)),
    ]
    .into_iter()
    .map(|(model, price)| (model.to_string(), price))
    .collect()
}

/// Resolve the price for `model`, falling back to [`FALLBACK_MODEL`], then to zero.
pub fn price_for(table: &BTreeMap<String, ModelPrice>, model: &str) -> ModelPrice {
    table
        .get(model)
        .or_else(|| table.get(FALLBACK_MODEL))
        .copied()
        .unwrap_or(ModelPrice::new(0.0, 0.0))
}

/// Cost of one oracle call plus the running total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StepCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub step_cost: f64,
    pub total_cost: f64,
}

/// Accumulates usage across a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostMeter {
    price: ModelPrice,
    input_tokens: u64,
    output_tokens: u64,
    total_cost: f64,
    calls: u32,
}

impl CostMeter {
    pub fn new(price: ModelPrice) -> Self {
        Self {
            price: ModelPrice::new(price.input.max(0.0), price.output.max(0.0)),
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            calls: 0,
        }
    }

    pub fn record(&mut self, usage: Usage) -> StepCost {
        let step_cost = (usage.input_tokens as f64 / 1_000_000.0) * self.price.input
            + (usage.output_tokens as f64 / 1_000_000.0) * self.price.output;
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.total_cost += step_cost;
        self.calls += 1;
        StepCost {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            step_cost,
            total_cost: self.total_cost,
        }
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }
}
