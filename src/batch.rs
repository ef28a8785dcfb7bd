//! Turn-budget-aware batch planning for AI analysis work.
//!
//! A single AI invocation has a bounded interaction budget; exceeding it
//! fails the invocation before all items complete. Work is therefore
//! pre-chunked into independent batches, each fully completable within the
//! budget, instead of risking partial completion. Pure and unit-testable
//! independent of any AI client.

use serde::{Deserialize, Serialize};

/// Configuration for the batch planner.
///
/// `turns_per_item` is an empirical estimate and deliberately configuration,
/// not a hardcoded constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum interaction round-trips one AI invocation may consume.
    pub turn_budget: u32,
    /// Estimated round-trips consumed per work item.
    pub turns_per_item: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            turn_budget: 20,
            turns_per_item: 4,
        }
    }
}

impl BatchConfig {
    /// Items per batch: `floor(turn_budget / turns_per_item)`, minimum 1.
    pub fn batch_size(&self) -> usize {
        let per_item = self.turns_per_item.max(1);
        ((self.turn_budget / per_item) as usize).max(1)
    }
}

/// Split `items` into ordered batches sized to the turn budget.
///
/// Every item appears in exactly one batch, input order is preserved, and
/// no batch exceeds `config.batch_size()`.
pub fn plan_batches<T: Clone>(items: &[T], config: &BatchConfig) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    items
        .chunks(config.batch_size())
        .map(|chunk| chunk.to_vec())
        .collect()
}
