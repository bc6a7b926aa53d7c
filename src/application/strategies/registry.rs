//! Central registry for trading strategies: loads them from configuration,
//! isolates failures, validates output, and aggregates proposals.

use crate::application::strategies::{RulesStrategy, Strategy, StrategyContext};
use crate::config::{PolicyConfig, StrategiesConfig};
use crate::domain::proposal::TradeProposal;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

pub struct StrategyRegistry {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn from_config(config: &StrategiesConfig, policy: &PolicyConfig) -> Self {
        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
        let mut enabled_count = 0;

        for (name, entry) in &config.strategies {
            let strategy: Box<dyn Strategy> = match entry.kind.as_str() {
                "rules" | "rules_engine" => Box::new(RulesStrategy::new(
                    name.clone(),
                    entry.enabled,
                    entry.risk_budgets.clone(),
                    policy.strategy.clone(),
                    &policy.position_sizing,
                )),
                other => {
                    warn!("strategy type '{other}' not registered, skipping '{name}'");
                    continue;
                }
            };
            if strategy.enabled() {
                enabled_count += 1;
                info!("loaded and ENABLED strategy: {name} ({})", entry.kind);
            } else {
                info!("loaded but DISABLED strategy: {name} ({})", entry.kind);
            }
            strategies.push(strategy);
        }

        info!(
            "strategy registry initialized: {} strategies loaded, {enabled_count} enabled",
            strategies.len()
        );
        if enabled_count == 0 {
            warn!("no strategies enabled; cycles will not generate proposals");
        }

        Self { strategies }
    }

    #[cfg(test)]
    pub fn from_strategies(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    pub fn enabled_count(&self) -> usize {
        self.strategies.iter().filter(|s| s.enabled()).count()
    }

    /// Run every enabled strategy. A panicking strategy is isolated: it
    /// contributes an empty result for the cycle, never an aborted cycle.
    pub fn run_all(
        &self,
        context: &StrategyContext<'_>,
    ) -> BTreeMap<String, Vec<TradeProposal>> {
        let mut results = BTreeMap::new();
        for strategy in self.strategies.iter().filter(|s| s.enabled()) {
            let name = strategy.name().to_string();
            let proposals =
                match catch_unwind(AssertUnwindSafe(|| strategy.generate_proposals(context))) {
                    Ok(proposals) => proposals,
                    Err(_) => {
                        error!("[{name}] strategy panicked; treating as empty result");
                        Vec::new()
                    }
                };
            let validated = self.validate(strategy.as_ref(), proposals);
            info!("[{name}] generated {} proposals", validated.len());
            results.insert(name, validated);
        }
        results
    }

    fn validate(&self, strategy: &dyn Strategy, proposals: Vec<TradeProposal>) -> Vec<TradeProposal> {
        let mut validated: Vec<TradeProposal> = proposals
            .into_iter()
            .filter(|p| {
                if p.symbol.is_empty() {
                    warn!("[{}] dropping proposal with empty symbol", strategy.name());
                    return false;
                }
                if !(0.0..=1.0).contains(&p.confidence) {
                    warn!(
                        "[{}] dropping {} proposal with confidence {} outside [0, 1]",
                        strategy.name(),
                        p.symbol,
                        p.confidence
                    );
                    return false;
                }
                if p.size_pct <= 0.0 && p.exit.is_none() {
                    warn!(
                        "[{}] dropping {} proposal with non-positive size",
                        strategy.name(),
                        p.symbol
                    );
                    return false;
                }
                true
            })
            .map(|mut p| {
                p.strategy = Some(strategy.name().to_string());
                let tag = strategy.name().to_string();
                if !p.has_tag(&tag) {
                    p.tags.push(tag);
                }
                p
            })
            .collect();

        if let Some(max_trades) = strategy.risk_budgets().max_trades_per_cycle {
            if validated.len() > max_trades {
                warn!(
                    "[{}] generated {} proposals, limiting to max_trades_per_cycle={max_trades}",
                    strategy.name(),
                    validated.len()
                );
                validated.truncate(max_trades);
            }
        }
        validated
    }

    /// Flatten all strategy outputs, optionally keeping only the
    /// highest-confidence proposal per symbol (ties: first encountered).
    pub fn aggregate(
        &self,
        context: &StrategyContext<'_>,
        dedupe_by_symbol: bool,
    ) -> Vec<TradeProposal> {
        let by_strategy = self.run_all(context);
        let mut all: Vec<TradeProposal> = by_strategy.into_values().flatten().collect();
        if all.is_empty() {
            return all;
        }
        if dedupe_by_symbol {
            all = Self::dedupe(all);
        }
        info!("aggregated {} proposals for the risk gate", all.len());
        all
    }

    fn dedupe(proposals: Vec<TradeProposal>) -> Vec<TradeProposal> {
        let mut best: BTreeMap<String, TradeProposal> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        for proposal in proposals {
            match best.get(&proposal.symbol) {
                Some(existing) if existing.confidence >= proposal.confidence => {
                    debug!(
                        "deduped {} proposal from {:?} (confidence {:.2} <= {:.2})",
                        proposal.symbol, proposal.strategy, proposal.confidence,
                        existing.confidence
                    );
                }
                Some(_) => {
                    best.insert(proposal.symbol.clone(), proposal);
                }
                None => {
                    order.push(proposal.symbol.clone());
                    best.insert(proposal.symbol.clone(), proposal);
                }
            }
        }
        order.into_iter().filter_map(|symbol| best.remove(&symbol)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskBudgets;
    use crate::domain::portfolio::{PendingOrders, PortfolioState};
    use crate::domain::regime::Regime;
    use crate::domain::types::OrderSide;
    use crate::domain::universe::UniverseSnapshot;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap as Map;

    struct FixedStrategy {
        name: String,
        enabled: bool,
        budgets: RiskBudgets,
        proposals: Vec<TradeProposal>,
        panics: bool,
    }

    impl Strategy for FixedStrategy {
        fn name(&self) -> &str {
            &self.name
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        fn risk_budgets(&self) -> &RiskBudgets {
            &self.budgets
        }
        fn generate_proposals(&self, _context: &StrategyContext<'_>) -> Vec<TradeProposal> {
            if self.panics {
                panic!("boom");
            }
            self.proposals.clone()
        }
    }

    fn ts() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn proposal(symbol: &str, confidence: f64) -> TradeProposal {
        TradeProposal::new(symbol, OrderSide::Buy, 2.0, "test", confidence, ts())
    }

    fn empty_universe() -> UniverseSnapshot {
        UniverseSnapshot {
            timestamp: ts(),
            regime: Regime::Chop,
            tier_1_assets: vec![],
            tier_2_assets: vec![],
            tier_3_assets: vec![],
            excluded_assets: vec![],
        }
    }

    fn empty_portfolio() -> PortfolioState {
        PortfolioState {
            account_value_usd: 10_000.0,
            open_positions: Map::new(),
            managed_positions: Map::new(),
            pending_orders: PendingOrders::default(),
            daily_pnl_pct: 0.0,
            weekly_pnl_pct: 0.0,
            max_drawdown_pct: 0.0,
            trades_today: 0,
            trades_this_hour: 0,
            consecutive_losses: 0,
            last_loss_time: None,
            current_time: ts(),
        }
    }

    fn run(registry: &StrategyRegistry) -> Vec<TradeProposal> {
        let universe = empty_universe();
        let portfolio = empty_portfolio();
        let context = StrategyContext {
            universe: &universe,
            triggers: &[],
            regime: Regime::Chop,
            timestamp: ts(),
            cycle_number: 0,
            portfolio: &portfolio,
        };
        registry.aggregate(&context, true)
    }

    #[test]
    fn test_panicking_strategy_is_isolated() {
        let registry = StrategyRegistry::from_strategies(vec![
            Box::new(FixedStrategy {
                name: "broken".into(),
                enabled: true,
                budgets: RiskBudgets::default(),
                proposals: vec![],
                panics: true,
            }),
            Box::new(FixedStrategy {
                name: "healthy".into(),
                enabled: true,
                budgets: RiskBudgets::default(),
                proposals: vec![proposal("BTC-USD", 0.8)],
                panics: false,
            }),
        ]);
        let proposals = run(&registry);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].symbol, "BTC-USD");
    }

    #[test]
    fn test_disabled_strategy_skipped() {
        let registry = StrategyRegistry::from_strategies(vec![Box::new(FixedStrategy {
            name: "dormant".into(),
            enabled: false,
            budgets: RiskBudgets::default(),
            proposals: vec![proposal("BTC-USD", 0.8)],
            panics: false,
        })]);
        assert_eq!(registry.enabled_count(), 0);
        assert!(run(&registry).is_empty());
    }

    #[test]
    fn test_dedupe_keeps_highest_confidence() {
        let registry = StrategyRegistry::from_strategies(vec![
            Box::new(FixedStrategy {
                name: "alpha".into(),
                enabled: true,
                budgets: RiskBudgets::default(),
                proposals: vec![proposal("BTC-USD", 0.6), proposal("ETH-USD", 0.7)],
                panics: false,
            }),
            Box::new(FixedStrategy {
                name: "beta".into(),
                enabled: true,
                budgets: RiskBudgets::default(),
                proposals: vec![proposal("BTC-USD", 0.9)],
                panics: false,
            }),
        ]);
        let proposals = run(&registry);
        assert_eq!(proposals.len(), 2);
        let btc = proposals.iter().find(|p| p.symbol == "BTC-USD").unwrap();
        assert_eq!(btc.confidence, 0.9);
        assert_eq!(btc.strategy.as_deref(), Some("beta"));
    }

    #[test]
    fn test_dedupe_tie_keeps_first_encountered() {
        let registry = StrategyRegistry::from_strategies(vec![
            Box::new(FixedStrategy {
                name: "alpha".into(),
                enabled: true,
                budgets: RiskBudgets::default(),
                proposals: vec![proposal("BTC-USD", 0.8)],
                panics: false,
            }),
            Box::new(FixedStrategy {
                name: "beta".into(),
                enabled: true,
                budgets: RiskBudgets::default(),
                proposals: vec![proposal("BTC-USD", 0.8)],
                panics: false,
            }),
        ]);
        let proposals = run(&registry);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].strategy.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_validation_drops_bad_confidence_and_truncates() {
        let mut bad = proposal("DOGE-USD", 1.5);
        bad.confidence = 1.5;
        let registry = StrategyRegistry::from_strategies(vec![Box::new(FixedStrategy {
            name: "greedy".into(),
            enabled: true,
            budgets: RiskBudgets { max_at_risk_pct: None, max_trades_per_cycle: Some(2) },
            proposals: vec![
                proposal("BTC-USD", 0.9),
                proposal("ETH-USD", 0.8),
                proposal("SOL-USD", 0.7),
                bad,
            ],
            panics: false,
        })]);
        let proposals = run(&registry);
        assert_eq!(proposals.len(), 2);
        assert!(proposals.iter().all(|p| p.confidence <= 1.0));
        // Strategy tag is stamped
        assert!(proposals.iter().all(|p| p.has_tag("greedy")));
    }

    #[test]
    fn test_registry_from_config_builds_rules() {
        let config = StrategiesConfig::default();
        let policy = PolicyConfig::default();
        let registry = StrategyRegistry::from_config(&config, &policy);
        assert_eq!(registry.enabled_count(), 1);
    }
}
