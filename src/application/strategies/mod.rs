//! Strategy framework: a pure capability over an immutable per-cycle context.
//!
//! Strategies never call the exchange and never mutate state; they map
//! (universe, triggers, regime, read-only portfolio) to proposals by value.

mod registry;
mod rules;

pub use registry::StrategyRegistry;
pub use rules::RulesStrategy;

use crate::config::RiskBudgets;
use crate::domain::portfolio::PortfolioState;
use crate::domain::proposal::TradeProposal;
use crate::domain::regime::Regime;
use crate::domain::triggers::TriggerSignal;
use crate::domain::universe::UniverseSnapshot;
use chrono::{DateTime, Utc};

/// Immutable context passed to strategies for one cycle.
pub struct StrategyContext<'a> {
    pub universe: &'a UniverseSnapshot,
    pub triggers: &'a [TriggerSignal],
    pub regime: Regime,
    pub timestamp: DateTime<Utc>,
    pub cycle_number: u64,
    pub portfolio: &'a PortfolioState,
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    fn risk_budgets(&self) -> &RiskBudgets;

    /// Map the context to proposals. Must not panic; a panicking strategy is
    /// isolated by the registry and contributes an empty result.
    fn generate_proposals(&self, context: &StrategyContext<'_>) -> Vec<TradeProposal>;
}
