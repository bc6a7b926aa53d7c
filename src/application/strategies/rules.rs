//! Baseline deterministic rules strategy: translates each trigger type into a
//! sized proposal. Universe defines WHAT is tradeable, triggers define WHEN to
//! look closer, rules define direction and size.

use crate::application::strategies::{Strategy, StrategyContext};
use crate::config::{RiskBudgets, SizingPolicy, StrategyPolicy};
use crate::domain::proposal::{ConvictionBreakdown, TradeProposal};
use crate::domain::regime::Regime;
use crate::domain::triggers::{TriggerKind, TriggerSignal};
use crate::domain::types::{OrderSide, OrderType};
use crate::domain::universe::{Tier, UniverseAsset};
use tracing::{debug, info};

struct RuleOutcome {
    side: OrderSide,
    reason: String,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    max_hold_hours: f64,
    size_boost: f64,
    confidence_scale: f64,
}

pub struct RulesStrategy {
    name: String,
    enabled: bool,
    budgets: RiskBudgets,
    policy: StrategyPolicy,
    target_risk_pct: f64,
}

impl RulesStrategy {
    pub fn new(
        name: String,
        enabled: bool,
        budgets: RiskBudgets,
        policy: StrategyPolicy,
        sizing: &SizingPolicy,
    ) -> Self {
        info!(
            "rules strategy '{name}': T1={:.1}% T2={:.1}% T3={:.1}% min_conviction={}",
            policy.base_position_pct.tier1,
            policy.base_position_pct.tier2,
            policy.base_position_pct.tier3,
            policy.min_conviction_to_propose
        );
        Self { name, enabled, budgets, policy, target_risk_pct: sizing.target_risk_pct }
    }

    fn tier_base_size(&self, tier: Tier) -> f64 {
        match tier {
            Tier::T1 => self.policy.base_position_pct.tier1,
            Tier::T2 => self.policy.base_position_pct.tier2,
            Tier::T3 => self.policy.base_position_pct.tier3,
        }
    }

    fn rule_for(&self, trigger: &TriggerSignal, regime: Regime) -> Option<RuleOutcome> {
        match trigger.kind {
            TriggerKind::PriceMove => {
                let change = trigger.price_change_pct?;
                if change > 1.5 {
                    Some(RuleOutcome {
                        side: OrderSide::Buy,
                        reason: format!("price move: {change:+.1}% ({})", trigger.reason),
                        stop_loss_pct: 6.0,
                        take_profit_pct: 12.0,
                        max_hold_hours: 48.0,
                        size_boost: 1.0,
                        confidence_scale: 1.0,
                    })
                } else if change < -2.5 {
                    // Catching the bounce: wider stop, shorter hold
                    Some(RuleOutcome {
                        side: OrderSide::Buy,
                        reason: format!("price move reversal: {change:+.1}% ({})", trigger.reason),
                        stop_loss_pct: 10.0,
                        take_profit_pct: 20.0,
                        max_hold_hours: 24.0,
                        size_boost: 0.7,
                        confidence_scale: 1.0,
                    })
                } else {
                    None
                }
            }
            TriggerKind::VolumeSpike => {
                let change = trigger.price_change_pct?;
                let ratio = trigger.volume_ratio.unwrap_or(0.0);
                if change > 2.0 {
                    Some(RuleOutcome {
                        side: OrderSide::Buy,
                        reason: format!("volume spike {ratio:.1}x + price up {change:+.1}%"),
                        stop_loss_pct: 8.0,
                        take_profit_pct: 15.0,
                        max_hold_hours: 72.0,
                        size_boost: 1.0,
                        confidence_scale: 1.0,
                    })
                } else if change < -2.0 {
                    Some(RuleOutcome {
                        side: OrderSide::Buy,
                        reason: format!(
                            "volume spike {ratio:.1}x + price down {change:+.1}% (reversal)"
                        ),
                        stop_loss_pct: 8.0,
                        take_profit_pct: 15.0,
                        max_hold_hours: 72.0,
                        size_boost: 1.0,
                        confidence_scale: 1.0,
                    })
                } else {
                    None
                }
            }
            TriggerKind::Breakout => Some(RuleOutcome {
                side: OrderSide::Buy,
                reason: format!("breakout: {}", trigger.reason),
                stop_loss_pct: 6.0,
                take_profit_pct: 20.0,
                max_hold_hours: 120.0,
                size_boost: 1.2,
                confidence_scale: 1.0,
            }),
            TriggerKind::Reversal => {
                if regime == Regime::Crash {
                    return None;
                }
                Some(RuleOutcome {
                    side: OrderSide::Buy,
                    reason: format!("reversal: {}", trigger.reason),
                    stop_loss_pct: 12.0,
                    take_profit_pct: 25.0,
                    max_hold_hours: 48.0,
                    size_boost: 0.8,
                    confidence_scale: 0.8,
                })
            }
            TriggerKind::Momentum => {
                let change = trigger.price_change_pct?;
                if change <= 0.0 {
                    // No shorts: down-momentum never proposes
                    return None;
                }
                Some(RuleOutcome {
                    side: OrderSide::Buy,
                    reason: format!("momentum: {}", trigger.reason),
                    stop_loss_pct: 8.0,
                    take_profit_pct: 15.0,
                    max_hold_hours: 72.0,
                    size_boost: 1.0,
                    confidence_scale: 1.0,
                })
            }
        }
    }

    /// Risk-parity sizing: position that risks `target_risk_pct` given the
    /// stop distance, scaled down in high volatility, capped at the tier base.
    fn volatility_adjusted_size(
        &self,
        trigger: &TriggerSignal,
        base_size_pct: f64,
        stop_loss_pct: f64,
    ) -> f64 {
        let mut size = self.target_risk_pct / stop_loss_pct * 100.0;
        if let Some(volatility) = trigger.volatility {
            if volatility > 0.0 {
                size *= 50.0 / volatility.max(10.0);
            }
        }
        size.min(base_size_pct).max(0.5)
    }

    fn conviction(
        &self,
        trigger: &TriggerSignal,
        asset: &UniverseAsset,
    ) -> (f64, ConvictionBreakdown) {
        let weights = &self.policy.conviction_weights;
        let strength_component = weights.trigger_strength * trigger.strength;
        let confidence_component = weights.trigger_confidence * trigger.confidence;

        let mut boosts_total = 0.0;
        let mut boosts = Vec::new();
        for (key, boost) in &weights.quality_boosts {
            let applied = if let Some(tier_label) = key.strip_prefix("tier_bias_") {
                tier_label.eq_ignore_ascii_case(&asset.tier.to_string())
            } else {
                trigger.qualifiers.get(key).copied().unwrap_or(false)
            };
            if applied {
                boosts_total += boost;
                boosts.push((key.clone(), *boost));
            }
        }

        let conviction =
            (weights.base + strength_component + confidence_component + boosts_total).clamp(0.0, 1.0);
        let breakdown = ConvictionBreakdown {
            base: weights.base,
            strength_component,
            confidence_component,
            boosts_total,
            boosts,
            trigger_score: trigger.score(),
        };
        (conviction, breakdown)
    }

    /// Scaled-down maker-only trial entry when conviction falls just short of
    /// the threshold with exactly one qualified trigger in play.
    fn try_canary(
        &self,
        mut proposal: TradeProposal,
        asset: &UniverseAsset,
        conviction: f64,
        threshold: f64,
        total_qualified: usize,
    ) -> Option<TradeProposal> {
        let canary = &self.policy.canary;
        if !canary.enabled || total_qualified != 1 {
            return None;
        }

        let upper = canary.conviction_window.upper.unwrap_or(threshold);
        let upper_ok = if canary.conviction_window.inclusive_upper {
            conviction <= upper
        } else {
            conviction < upper
        };
        if !(conviction >= canary.conviction_window.lower && upper_ok) {
            return None;
        }

        if !canary.require_tier_in.is_empty()
            && !canary
                .require_tier_in
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&asset.tier.to_string()))
        {
            return None;
        }

        if asset.spread_bps > canary.max_spread_bps || asset.depth_usd < canary.min_depth_usd {
            info!(
                "canary blocked: {} liquidity guard failed (depth={:.0}, spread={:.1}bps)",
                asset.symbol, asset.depth_usd, asset.spread_bps
            );
            return None;
        }

        proposal.size_pct *= canary.size_multiplier;
        proposal.add_tag("canary");
        proposal.reason = format!("{} | CANARY", proposal.reason);
        if canary.maker_only {
            proposal.order_type_override = Some(OrderType::LimitPostOnly);
        }
        info!(
            "canary: {} conviction={conviction:.3} (< {threshold:.2}) size={:.2}%",
            proposal.symbol, proposal.size_pct
        );
        Some(proposal)
    }
}

impl Strategy for RulesStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn risk_budgets(&self) -> &RiskBudgets {
        &self.budgets
    }

    fn generate_proposals(&self, context: &StrategyContext<'_>) -> Vec<TradeProposal> {
        let min_conviction = self.policy.min_conviction(context.regime);
        let qualified: Vec<&TriggerSignal> = context
            .triggers
            .iter()
            .filter(|t| t.score() >= self.policy.min_trigger_score)
            .collect();
        debug!(
            "qualified triggers: {} of {} (min_score={})",
            qualified.len(),
            context.triggers.len(),
            self.policy.min_trigger_score
        );

        let mut proposals = Vec::new();
        for trigger in &qualified {
            let Some(asset) = context.universe.get_asset(&trigger.symbol) else {
                debug!("trigger for {} but asset not in universe", trigger.symbol);
                continue;
            };
            let Some(rule) = self.rule_for(trigger, context.regime) else {
                debug!("no rule fired for {} {}", trigger.symbol, trigger.kind);
                continue;
            };

            let base_size = self.tier_base_size(asset.tier) * rule.size_boost;
            let size_pct = self.volatility_adjusted_size(trigger, base_size, rule.stop_loss_pct)
                * trigger.confidence
                * rule.confidence_scale;

            let (conviction, breakdown) = self.conviction(trigger, asset);
            let mut proposal = TradeProposal::new(
                trigger.symbol.clone(),
                rule.side,
                size_pct,
                rule.reason,
                conviction,
                context.timestamp,
            );
            proposal.stop_loss_pct = Some(rule.stop_loss_pct);
            proposal.take_profit_pct = Some(rule.take_profit_pct);
            proposal.max_hold_hours = Some(rule.max_hold_hours);
            proposal.tier = Some(asset.tier);
            proposal.conviction = Some(breakdown);
            proposal.trigger = Some((*trigger).clone());

            if conviction >= min_conviction {
                info!(
                    "proposal: {} {} size={:.2}% conviction={conviction:.2} reason='{}'",
                    proposal.side, proposal.symbol, proposal.size_pct, proposal.reason
                );
                proposals.push(proposal);
            } else if let Some(canary) =
                self.try_canary(proposal, asset, conviction, min_conviction, qualified.len())
            {
                proposals.push(canary);
            } else {
                info!(
                    "rejected: {} conviction={conviction:.2} < min_conviction={min_conviction:.2}",
                    trigger.symbol
                );
            }
        }

        info!(
            "generated {} proposals (min_conviction={min_conviction:.2})",
            proposals.len()
        );
        proposals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::portfolio::{PendingOrders, PortfolioState};
    use crate::domain::universe::UniverseSnapshot;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn asset(symbol: &str, tier: Tier) -> UniverseAsset {
        UniverseAsset {
            symbol: symbol.to_string(),
            tier,
            allocation_min_pct: 1.0,
            allocation_max_pct: 10.0,
            volume_24h: 100_000_000.0,
            spread_bps: 10.0,
            depth_usd: 1_000_000.0,
            eligible: true,
            ineligible_reason: None,
        }
    }

    fn trigger(symbol: &str, kind: TriggerKind, strength: f64, confidence: f64) -> TriggerSignal {
        TriggerSignal {
            symbol: symbol.to_string(),
            kind,
            strength,
            confidence,
            reason: "test trigger".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            current_price: 50_000.0,
            volume_ratio: Some(2.5),
            price_change_pct: Some(4.0),
            volatility: Some(50.0),
            qualifiers: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    fn portfolio() -> PortfolioState {
        PortfolioState {
            account_value_usd: 10_000.0,
            open_positions: BTreeMap::new(),
            managed_positions: BTreeMap::new(),
            pending_orders: PendingOrders::default(),
            daily_pnl_pct: 0.0,
            weekly_pnl_pct: 0.0,
            max_drawdown_pct: 0.0,
            trades_today: 0,
            trades_this_hour: 0,
            consecutive_losses: 0,
            last_loss_time: None,
            current_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn strategy(policy: StrategyPolicy) -> RulesStrategy {
        RulesStrategy::new(
            "rules".to_string(),
            true,
            RiskBudgets::default(),
            policy,
            &SizingPolicy::default(),
        )
    }

    fn context<'a>(
        universe: &'a UniverseSnapshot,
        triggers: &'a [TriggerSignal],
        portfolio: &'a PortfolioState,
    ) -> StrategyContext<'a> {
        StrategyContext {
            universe,
            triggers,
            regime: Regime::Chop,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            cycle_number: 1,
            portfolio,
        }
    }

    fn universe(assets: Vec<UniverseAsset>) -> UniverseSnapshot {
        UniverseSnapshot {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            regime: Regime::Chop,
            tier_1_assets: assets,
            tier_2_assets: vec![],
            tier_3_assets: vec![],
            excluded_assets: vec![],
        }
    }

    #[test]
    fn test_momentum_trigger_becomes_buy() {
        let strategy = strategy(StrategyPolicy::default());
        let universe = universe(vec![asset("BTC-USD", Tier::T1)]);
        let triggers = vec![trigger("BTC-USD", TriggerKind::Momentum, 0.8, 0.9)];
        let portfolio = portfolio();
        let proposals = strategy.generate_proposals(&context(&universe, &triggers, &portfolio));

        assert_eq!(proposals.len(), 1);
        let p = &proposals[0];
        assert_eq!(p.side, OrderSide::Buy);
        assert_eq!(p.stop_loss_pct, Some(8.0));
        assert_eq!(p.take_profit_pct, Some(15.0));
        assert!(p.size_pct > 0.0 && p.size_pct <= 2.0);
        assert_eq!(p.tier, Some(Tier::T1));
    }

    #[test]
    fn test_downward_momentum_proposes_nothing() {
        let strategy = strategy(StrategyPolicy::default());
        let universe = universe(vec![asset("BTC-USD", Tier::T1)]);
        let mut t = trigger("BTC-USD", TriggerKind::Momentum, 0.8, 0.9);
        t.price_change_pct = Some(-4.0);
        let portfolio = portfolio();
        let triggers = vec![t];
        assert!(strategy
            .generate_proposals(&context(&universe, &triggers, &portfolio))
            .is_empty());
    }

    #[test]
    fn test_reversal_skipped_in_crash() {
        let strategy = strategy(StrategyPolicy::default());
        let universe = universe(vec![asset("BTC-USD", Tier::T1)]);
        let triggers = vec![trigger("BTC-USD", TriggerKind::Reversal, 0.8, 0.9)];
        let portfolio = portfolio();
        let mut ctx = context(&universe, &triggers, &portfolio);
        ctx.regime = Regime::Crash;
        assert!(strategy.generate_proposals(&ctx).is_empty());
    }

    #[test]
    fn test_low_trigger_score_filtered() {
        let strategy = strategy(StrategyPolicy::default());
        let universe = universe(vec![asset("BTC-USD", Tier::T1)]);
        // score 0.1*0.5 = 0.05 < min 0.2
        let triggers = vec![trigger("BTC-USD", TriggerKind::Momentum, 0.1, 0.5)];
        let portfolio = portfolio();
        assert!(strategy
            .generate_proposals(&context(&universe, &triggers, &portfolio))
            .is_empty());
    }

    #[test]
    fn test_risk_parity_sizing_caps_at_tier_base() {
        let strategy = strategy(StrategyPolicy::default());
        // Stop of 8% risking 1% -> 12.5% raw, capped at T1 base 2%
        let t = trigger("BTC-USD", TriggerKind::Momentum, 0.8, 1.0);
        let size = strategy.volatility_adjusted_size(&t, 2.0, 8.0);
        assert_eq!(size, 2.0);
        // High volatility shrinks below the cap: 12.5 * 50/150 = 4.17, still over 2.0
        let mut wild = t.clone();
        wild.volatility = Some(150.0);
        assert_eq!(strategy.volatility_adjusted_size(&wild, 2.0, 8.0), 2.0);
        // But a very tight base shows the floor
        assert_eq!(strategy.volatility_adjusted_size(&t, 0.1, 8.0), 0.5);
    }

    #[test]
    fn test_conviction_quality_boosts_apply() {
        let mut policy = StrategyPolicy::default();
        policy
            .conviction_weights
            .quality_boosts
            .insert("reversal_rsi_cross_50".to_string(), 0.1);
        policy
            .conviction_weights
            .quality_boosts
            .insert("tier_bias_t1".to_string(), 0.05);
        let strategy = strategy(policy);

        let mut t = trigger("BTC-USD", TriggerKind::Reversal, 0.5, 0.6);
        t.qualifiers.insert("reversal_rsi_cross_50".to_string(), true);
        let a = asset("BTC-USD", Tier::T1);
        let (conviction, breakdown) = strategy.conviction(&t, &a);

        // 0.5*0.5 + 0.3*0.6 + 0.1 + 0.05 = 0.58
        assert!((conviction - 0.58).abs() < 1e-9);
        assert_eq!(breakdown.boosts.len(), 2);
    }

    #[test]
    fn test_below_threshold_reversal_emits_canary_when_single_trigger() {
        let mut policy = StrategyPolicy::default();
        policy.canary.enabled = true;
        policy.canary.conviction_window.lower = 0.30;
        let strategy = strategy(policy);
        let universe = universe(vec![asset("BTC-USD", Tier::T1)]);
        // Reversal conviction: 0.5*0.25 + 0.3*0.6 = 0.305 < 0.5 threshold
        let mut t = trigger("BTC-USD", TriggerKind::Reversal, 0.25, 0.60);
        t.price_change_pct = Some(6.0);
        let portfolio = portfolio();
        let triggers = vec![t];
        let proposals = strategy.generate_proposals(&context(&universe, &triggers, &portfolio));

        assert_eq!(proposals.len(), 1);
        let canary = &proposals[0];
        assert!(canary.has_tag("canary"));
        assert_eq!(canary.order_type_override, Some(OrderType::LimitPostOnly));
        assert!(canary.reason.contains("CANARY"));
    }

    #[test]
    fn test_no_canary_with_multiple_triggers_or_thin_book() {
        let mut policy = StrategyPolicy::default();
        policy.canary.enabled = true;
        policy.canary.conviction_window.lower = 0.0;
        let strategy = strategy(policy);
        let universe = universe(vec![asset("BTC-USD", Tier::T1), asset("ETH-USD", Tier::T1)]);
        let portfolio = portfolio();

        // Two qualified triggers: the single-trigger condition fails
        let triggers = vec![
            trigger("BTC-USD", TriggerKind::Reversal, 0.25, 0.60),
            trigger("ETH-USD", TriggerKind::Reversal, 0.25, 0.60),
        ];
        let proposals = strategy.generate_proposals(&context(&universe, &triggers, &portfolio));
        assert!(proposals.iter().all(|p| !p.has_tag("canary")));

        // Single trigger but the liquidity guard fails
        let mut thin = asset("BTC-USD", Tier::T1);
        thin.depth_usd = 1_000.0;
        let universe = super::tests::universe(vec![thin]);
        let triggers = vec![trigger("BTC-USD", TriggerKind::Reversal, 0.25, 0.60)];
        let proposals = strategy.generate_proposals(&context(&universe, &triggers, &portfolio));
        assert!(proposals.is_empty());
    }

    #[test]
    fn test_regime_specific_conviction_threshold() {
        let mut policy = StrategyPolicy::default();
        policy.min_conviction_by_regime.insert(Regime::Chop, 0.9);
        let strategy = strategy(policy);
        let universe = universe(vec![asset("BTC-USD", Tier::T1)]);
        // Conviction 0.5*0.8 + 0.3*0.9 = 0.67 < 0.9 chop threshold
        let triggers = vec![trigger("BTC-USD", TriggerKind::Momentum, 0.8, 0.9)];
        let portfolio = portfolio();
        assert!(strategy
            .generate_proposals(&context(&universe, &triggers, &portfolio))
            .is_empty());
    }
}
