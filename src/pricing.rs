//! Model price table and cost calculation
//!
//! Prices are per 1M tokens, keyed by model id. The table is YAML-shaped:
//!
//! ```yaml
//! claude-3-5-haiku:
//!   input_per_1m: 0.80
//!   output_per_1m: 4.00
//! ```
//!
//! Cost is computed at the moment a usage entry is recorded; later edits to
//! the table never alter already-emitted records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Default pricing per 1M tokens when a model id is not in the table
const DEFAULT_INPUT_COST_PER_M: f64 = 3.00;
const DEFAULT_OUTPUT_COST_PER_M: f64 = 15.00;

/// Per-model price entry (per 1M tokens)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

/// Model id → price table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    #[serde(flatten)]
    models: HashMap<String, ModelPrice>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "claude-sonnet-4".to_string(),
            ModelPrice { input_per_1m: 3.00, output_per_1m: 15.00 },
        );
        models.insert(
            "claude-3-5-haiku".to_string(),
            ModelPrice { input_per_1m: 0.80, output_per_1m: 4.00 },
        );
        models.insert(
            "gpt-4o-mini".to_string(),
            ModelPrice { input_per_1m: 0.15, output_per_1m: 0.60 },
        );
        models.insert(
            "nomic-embed-text".to_string(),
            ModelPrice { input_per_1m: 0.02, output_per_1m: 0.0 },
        );
        Self { models }
    }
}

impl PriceTable {
    /// Load a price table from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Configuration(format!("Invalid price table {}: {e}", path.display())))
    }

    /// Load from PRICE_TABLE_PATH if set, otherwise the built-in defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var("PRICE_TABLE_PATH") {
            Ok(path) => Self::from_yaml_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Cost in USD for a call against `model_id`.
    ///
    /// Unknown models fall back to the default rates rather than erroring:
    /// a missing price entry must never fail a user query.
    pub fn cost_usd(&self, model_id: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let price = self.models.get(model_id).copied().unwrap_or(ModelPrice {
            input_per_1m: DEFAULT_INPUT_COST_PER_M,
            output_per_1m: DEFAULT_OUTPUT_COST_PER_M,
        });

        let input_cost = (input_tokens as f64 / 1_000_000.0) * price.input_per_1m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * price.output_per_1m;
        input_cost + output_cost
    }

    pub fn insert(&mut self, model_id: impl Into<String>, price: ModelPrice) {
        self.models.insert(model_id.into(), price);
    }
}

/// Heuristic token estimate (~4 chars per token) used when a provider
/// response is a partial failure and reports no usage.
pub fn estimate_tokens(content: &str) -> u32 {
    ((content.len() as u32) / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_known_model() {
        let table = PriceTable::default();
        let cost = table.cost_usd("claude-3-5-haiku", 1_000_000, 1_000_000);
        assert!((cost - 4.80).abs() < 1e-9);
    }

    #[test]
    fn test_cost_unknown_model_uses_defaults() {
        let table = PriceTable::default();
        let cost = table.cost_usd("mystery-model", 1_000_000, 0);
        assert!((cost - DEFAULT_INPUT_COST_PER_M).abs() < 1e-9);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = "claude-3-5-haiku:\n  input_per_1m: 0.80\n  output_per_1m: 4.00\n";
        let table: PriceTable = serde_yaml::from_str(yaml).unwrap();
        let cost = table.cost_usd("claude-3-5-haiku", 2_000_000, 0);
        assert!((cost - 1.60).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_edits_do_not_affect_prior_costs() {
        let mut table = PriceTable::default();
        let before = table.cost_usd("claude-3-5-haiku", 1_000_000, 0);
        table.insert(
            "claude-3-5-haiku",
            ModelPrice { input_per_1m: 100.0, output_per_1m: 100.0 },
        );
        let after = table.cost_usd("claude-3-5-haiku", 1_000_000, 0);
        assert!((before - 0.80).abs() < 1e-9);
        assert!((after - 100.0).abs() < 1e-9);
    }
}
