use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelTier;

/// A single recorded LLM spend. `estimated_cost_usd` is kept as `f64` at the
/// boundary for human-readable persistence; internal accounting always uses
/// integer microdollars (see `conductor-budget`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub skill: String,
    pub model_tier: ModelTier,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// Per-million-token rates in USD for a model tier (§4.1 step 14).
#[derive(Debug, Clone, Copy)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelTier {
    pub fn rates(self) -> ModelRates {
        match self {
            ModelTier::Opus => ModelRates {
                input_per_million: 15.0,
                output_per_million: 75.0,
            },
            ModelTier::Sonnet => ModelRates {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
            ModelTier::Haiku => ModelRates {
                input_per_million: 0.80,
                output_per_million: 4.0,
            },
        }
    }
}

/// `estimateCost(tier, input, output) = (input × rate_in + output × rate_out) / 1,000,000`.
pub fn estimate_cost_usd(tier: ModelTier, input_tokens: u64, output_tokens: u64) -> f64 {
    let rates = tier.rates();
    (input_tokens as f64 * rates.input_per_million
        + output_tokens as f64 * rates.output_per_million)
        / 1_000_000.0
}
