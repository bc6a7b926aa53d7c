//! Exit logic for open positions: stop-loss, take-profit, max hold time, and
//! progressive early-exit checkpoints. Emits SELL proposals carrying explicit
//! quantity; these bypass percentage sizing but still pass the risk gate.

use crate::config::ExitPolicy;
use crate::domain::proposal::{ExitDetails, TradeProposal};
use crate::domain::types::{canonical_symbol, OrderSide};
use crate::infrastructure::state::{ManagedPosition, PositionLedger};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

struct ExitSignal {
    reason: String,
    confidence: f64,
}

pub struct PositionManager {
    config: ExitPolicy,
}

impl PositionManager {
    pub fn new(config: ExitPolicy) -> Self {
        info!(
            "position manager: enabled={} stop_loss={} take_profit={} max_hold={} progressive_steps={}",
            config.enabled,
            config.check_stop_loss,
            config.check_take_profit,
            config.check_max_hold,
            config.progressive.len()
        );
        Self { config }
    }

    /// Evaluate every open position and generate SELL proposals for exits.
    /// `momentum_24h_pct` feeds the progressive checkpoints; a symbol with no
    /// entry is treated as weak.
    pub fn evaluate(
        &self,
        positions: &BTreeMap<String, PositionLedger>,
        managed_positions: &BTreeMap<String, ManagedPosition>,
        current_prices: &BTreeMap<String, f64>,
        momentum_24h_pct: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<TradeProposal> {
        if !self.config.enabled {
            debug!("position exits disabled in config");
            return Vec::new();
        }

        let mut proposals = Vec::new();
        for (symbol, position) in positions {
            if position.units <= 0.0 {
                continue;
            }
            let Some(managed) = managed_positions.get(symbol) else {
                debug!("no managed metadata for {symbol}, skipping exit check");
                continue;
            };
            let (Some(entry_price), Some(entry_time)) = (managed.entry_price, managed.entry_time)
            else {
                debug!("missing entry price/time for {symbol}, skipping");
                continue;
            };
            let Some(&current_price) = current_prices
                .get(symbol)
                .or_else(|| current_prices.get(&canonical_symbol(symbol)))
            else {
                debug!("no current price for {symbol}, skipping exit check");
                continue;
            };
            if current_price <= 0.0 || entry_price <= 0.0 {
                continue;
            }

            let pnl_pct = (current_price - entry_price) / entry_price * 100.0;
            let hold_hours = (now - entry_time).num_seconds() as f64 / 3600.0;

            let Some(signal) = self.exit_signal(
                managed,
                pnl_pct,
                hold_hours,
                momentum_24h_pct.get(symbol).copied(),
            ) else {
                continue;
            };

            info!(
                "EXIT SIGNAL: {symbol} {} - pnl {pnl_pct:+.2}%, hold {hold_hours:.1}h, ${entry_price:.4} -> ${current_price:.4}",
                signal.reason
            );
            let mut proposal = TradeProposal::new(
                canonical_symbol(symbol),
                OrderSide::Sell,
                0.0,
                format!("exit_{}", signal.reason),
                signal.confidence,
                now,
            );
            proposal.exit = Some(ExitDetails {
                exit_reason: signal.reason,
                entry_price,
                current_price,
                pnl_pct,
                hold_hours,
                quantity: position.units,
                notional_usd: position.units * current_price,
            });
            proposals.push(proposal);
        }

        if proposals.is_empty() {
            debug!("no positions met exit criteria");
        } else {
            info!("generated {} SELL proposals from position exits", proposals.len());
        }
        proposals
    }

    /// Exit priority: stop_loss > take_profit > max_hold > progressive
    /// checkpoints.
    fn exit_signal(
        &self,
        managed: &ManagedPosition,
        pnl_pct: f64,
        hold_hours: f64,
        momentum_24h_pct: Option<f64>,
    ) -> Option<ExitSignal> {
        if self.config.check_stop_loss {
            if let Some(stop_loss) = managed.stop_loss_pct {
                if pnl_pct <= -stop_loss.abs() {
                    return Some(ExitSignal { reason: "stop_loss".to_string(), confidence: 1.0 });
                }
            }
        }

        if self.config.check_take_profit {
            if let Some(take_profit) = managed.take_profit_pct {
                if pnl_pct >= take_profit {
                    return Some(ExitSignal { reason: "take_profit".to_string(), confidence: 1.0 });
                }
            }
        }

        if self.config.check_max_hold {
            if let Some(max_hold) = managed.max_hold_hours {
                if hold_hours >= max_hold {
                    // Forced time-based exit carries lower confidence
                    return Some(ExitSignal { reason: "max_hold".to_string(), confidence: 0.8 });
                }
            }
        }

        for step in &self.config.progressive {
            if hold_hours < step.after_hours {
                continue;
            }
            if pnl_pct > step.max_pnl_pct {
                continue;
            }
            let weak = momentum_24h_pct
                .map(|m| m < step.weak_momentum_max_pct)
                .unwrap_or(true);
            if weak {
                return Some(ExitSignal { reason: step.name.clone(), confidence: 0.7 });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressiveExitStep;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn ledger(units: f64, entry_price: f64, entry_time: DateTime<Utc>) -> PositionLedger {
        PositionLedger {
            units,
            entry_price,
            usd: units * entry_price,
            entry_value_usd: units * entry_price,
            fees_paid: 0.0,
            entry_time,
            last_updated: entry_time,
            last_fill_price: entry_price,
        }
    }

    fn managed(
        entry_price: f64,
        entry_time: DateTime<Utc>,
        stop: f64,
        take: f64,
        hold: f64,
    ) -> ManagedPosition {
        ManagedPosition {
            entry_price: Some(entry_price),
            entry_time: Some(entry_time),
            stop_loss_pct: Some(stop),
            take_profit_pct: Some(take),
            max_hold_hours: Some(hold),
        }
    }

    fn setup(
        entry_price: f64,
        current_price: f64,
        hold_hours: i64,
    ) -> (
        BTreeMap<String, PositionLedger>,
        BTreeMap<String, ManagedPosition>,
        BTreeMap<String, f64>,
    ) {
        let entry_time = now() - Duration::hours(hold_hours);
        let mut positions = BTreeMap::new();
        positions.insert("BTC-USD".to_string(), ledger(0.1, entry_price, entry_time));
        let mut managed_map = BTreeMap::new();
        managed_map
            .insert("BTC-USD".to_string(), managed(entry_price, entry_time, 8.0, 15.0, 72.0));
        let mut prices = BTreeMap::new();
        prices.insert("BTC-USD".to_string(), current_price);
        (positions, managed_map, prices)
    }

    #[test]
    fn test_stop_loss_fires_with_full_quantity() {
        let manager = PositionManager::new(ExitPolicy::default());
        let (positions, managed_map, prices) = setup(50_000.0, 45_000.0, 5); // -10%
        let proposals =
            manager.evaluate(&positions, &managed_map, &prices, &BTreeMap::new(), now());

        assert_eq!(proposals.len(), 1);
        let exit = proposals[0].exit.as_ref().unwrap();
        assert_eq!(exit.exit_reason, "stop_loss");
        assert_eq!(exit.quantity, 0.1);
        assert!((exit.pnl_pct + 10.0).abs() < 1e-9);
        assert_eq!(proposals[0].side, OrderSide::Sell);
        assert_eq!(proposals[0].confidence, 1.0);
    }

    #[test]
    fn test_take_profit_fires() {
        let manager = PositionManager::new(ExitPolicy::default());
        let (positions, managed_map, prices) = setup(50_000.0, 58_000.0, 5); // +16%
        let proposals =
            manager.evaluate(&positions, &managed_map, &prices, &BTreeMap::new(), now());
        assert_eq!(proposals[0].exit.as_ref().unwrap().exit_reason, "take_profit");
    }

    #[test]
    fn test_stop_loss_beats_take_profit_priority() {
        // Contrived targets where both would match; stop wins
        let manager = PositionManager::new(ExitPolicy::default());
        let entry_time = now() - Duration::hours(5);
        let mut positions = BTreeMap::new();
        positions.insert("BTC-USD".to_string(), ledger(0.1, 50_000.0, entry_time));
        let mut managed_map = BTreeMap::new();
        managed_map.insert(
            "BTC-USD".to_string(),
            ManagedPosition {
                entry_price: Some(50_000.0),
                entry_time: Some(entry_time),
                stop_loss_pct: Some(5.0),
                take_profit_pct: Some(-20.0),
                max_hold_hours: Some(72.0),
            },
        );
        let mut prices = BTreeMap::new();
        prices.insert("BTC-USD".to_string(), 45_000.0);
        let proposals =
            manager.evaluate(&positions, &managed_map, &prices, &BTreeMap::new(), now());
        assert_eq!(proposals[0].exit.as_ref().unwrap().exit_reason, "stop_loss");
    }

    #[test]
    fn test_max_hold_forces_exit_with_lower_confidence() {
        let manager = PositionManager::new(ExitPolicy::default());
        let (positions, managed_map, prices) = setup(50_000.0, 50_500.0, 80); // 80h > 72h
        let proposals =
            manager.evaluate(&positions, &managed_map, &prices, &BTreeMap::new(), now());
        assert_eq!(proposals[0].exit.as_ref().unwrap().exit_reason, "max_hold");
        assert_eq!(proposals[0].confidence, 0.8);
    }

    #[test]
    fn test_healthy_position_holds() {
        let manager = PositionManager::new(ExitPolicy::default());
        let (positions, managed_map, prices) = setup(50_000.0, 51_000.0, 5); // +2%
        let proposals =
            manager.evaluate(&positions, &managed_map, &prices, &BTreeMap::new(), now());
        assert!(proposals.is_empty());
    }

    #[test]
    fn test_progressive_checkpoint_exits_losers_with_weak_momentum() {
        let mut config = ExitPolicy::default();
        config.progressive = vec![ProgressiveExitStep {
            after_hours: 12.0,
            name: "progressive_12h".to_string(),
            max_pnl_pct: 0.0,
            weak_momentum_max_pct: 1.0,
        }];
        let manager = PositionManager::new(config);

        // -2% after 14h with weak momentum -> checkpoint exit
        let (positions, managed_map, prices) = setup(50_000.0, 49_000.0, 14);
        let mut momentum = BTreeMap::new();
        momentum.insert("BTC-USD".to_string(), 0.2);
        let proposals = manager.evaluate(&positions, &managed_map, &prices, &momentum, now());
        assert_eq!(proposals[0].exit.as_ref().unwrap().exit_reason, "progressive_12h");
        assert_eq!(proposals[0].confidence, 0.7);

        // Strong momentum keeps the position
        momentum.insert("BTC-USD".to_string(), 3.0);
        let proposals = manager.evaluate(&positions, &managed_map, &prices, &momentum, now());
        assert!(proposals.is_empty());

        // Unknown momentum counts as weak
        let proposals =
            manager.evaluate(&positions, &managed_map, &prices, &BTreeMap::new(), now());
        assert_eq!(proposals.len(), 1);
    }

    #[test]
    fn test_unmanaged_position_skipped() {
        let manager = PositionManager::new(ExitPolicy::default());
        let (positions, _, prices) = setup(50_000.0, 40_000.0, 5);
        let proposals =
            manager.evaluate(&positions, &BTreeMap::new(), &prices, &BTreeMap::new(), now());
        assert!(proposals.is_empty());
    }

    #[test]
    fn test_disabled_manager_emits_nothing() {
        let mut config = ExitPolicy::default();
        config.enabled = false;
        let manager = PositionManager::new(config);
        let (positions, managed_map, prices) = setup(50_000.0, 40_000.0, 5);
        let proposals =
            manager.evaluate(&positions, &managed_map, &prices, &BTreeMap::new(), now());
        assert!(proposals.is_empty());
    }
}
