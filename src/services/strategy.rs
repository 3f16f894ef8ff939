//! Fetch strategy selection.
//!
//! Per-symbol fetch costs one call per candidate but runs in parallel;
//! grouped-by-day costs one call per trading day but must run sequentially.
//! Below the break-even candidate count parallelism wins, above it the call
//! count dominates.

use crate::types::{FetchPlan, FetchStrategy};

#[derive(Debug, Clone, Copy)]
pub struct FetchStrategySelector {
    break_even_symbols: usize,
}

impl FetchStrategySelector {
    pub fn new(break_even_symbols: usize) -> Self {
        Self { break_even_symbols }
    }

    /// Pick a strategy for `estimated_candidates` symbols over a history
    /// window of `trading_days` days.
    pub fn select(&self, estimated_candidates: usize, trading_days: usize) -> FetchPlan {
        let (strategy, expected_calls) = if estimated_candidates < self.break_even_symbols {
            (FetchStrategy::PerSymbol, estimated_candidates)
        } else {
            (FetchStrategy::GroupedByDay, trading_days)
        };

        FetchPlan {
            strategy,
            estimated_candidates,
            expected_calls,
        }
    }
}

impl FetchPlan {
    /// Human-readable decision line for progress and diagnostics.
    pub fn describe(&self) -> String {
        format!(
            "Using {} fetch: ~{} candidates, {} upstream calls expected",
            self.strategy.as_str(),
            self.estimated_candidates,
            self.expected_calls
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_candidate_set_uses_per_symbol() {
        let plan = FetchStrategySelector::new(8_000).select(500, 260);
        assert_eq!(plan.strategy, FetchStrategy::PerSymbol);
        assert_eq!(plan.expected_calls, 500);
    }

    #[test]
    fn test_large_candidate_set_uses_grouped_by_day() {
        let plan = FetchStrategySelector::new(8_000).select(50_000, 260);
        assert_eq!(plan.strategy, FetchStrategy::GroupedByDay);
        assert_eq!(plan.expected_calls, 260);
    }

    #[test]
    fn test_break_even_is_inclusive_for_grouped() {
        let selector = FetchStrategySelector::new(8_000);
        assert_eq!(selector.select(7_999, 10).strategy, FetchStrategy::PerSymbol);
        assert_eq!(selector.select(8_000, 10).strategy, FetchStrategy::GroupedByDay);
    }

    #[test]
    fn test_break_even_is_configurable() {
        let plan = FetchStrategySelector::new(100).select(500, 20);
        assert_eq!(plan.strategy, FetchStrategy::GroupedByDay);
    }

    #[test]
    fn test_describe_mentions_strategy() {
        let plan = FetchStrategySelector::new(8_000).select(3, 5);
        assert!(plan.describe().contains("per_symbol"));
    }
}
