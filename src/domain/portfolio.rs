use crate::domain::types::{base_currency, canonical_symbol, OrderSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub units: f64,
    pub usd: f64,
}

/// Pending order notionals by side, rehydrated each cycle from the
/// authoritative open-order list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingOrders {
    pub buy: BTreeMap<String, f64>,
    pub sell: BTreeMap<String, f64>,
}

impl PendingOrders {
    fn side_bucket(&self, side: OrderSide) -> &BTreeMap<String, f64> {
        match side {
            OrderSide::Buy => &self.buy,
            OrderSide::Sell => &self.sell,
        }
    }
}

/// Snapshot of portfolio state for risk checks. Built once at the start of a
/// cycle from the state store's most recent snapshot; never mutated mid-cycle.
///
/// Position schema: the `usd` mark drives all risk calculations; `units` is
/// for reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub account_value_usd: f64,
    pub open_positions: BTreeMap<String, PositionSnapshot>,
    pub managed_positions: BTreeMap<String, bool>,
    pub pending_orders: PendingOrders,
    pub daily_pnl_pct: f64,
    pub weekly_pnl_pct: f64,
    pub max_drawdown_pct: f64,
    pub trades_today: u32,
    pub trades_this_hour: u32,
    pub consecutive_losses: u32,
    pub last_loss_time: Option<DateTime<Utc>>,
    pub current_time: DateTime<Utc>,
}

impl PortfolioState {
    /// Net asset value; alias of `account_value_usd`.
    pub fn nav(&self) -> f64 {
        self.account_value_usd
    }

    pub fn position_usd(&self, symbol: &str) -> f64 {
        self.open_positions
            .get(&canonical_symbol(symbol))
            .or_else(|| self.open_positions.get(symbol))
            .map(|p| p.usd)
            .unwrap_or(0.0)
    }

    pub fn total_exposure_usd(&self) -> f64 {
        self.open_positions.values().map(|p| p.usd).sum()
    }

    /// Exposure attributable to positions this system opened.
    pub fn managed_exposure_usd(&self) -> f64 {
        self.managed_positions
            .iter()
            .filter(|(_, managed)| **managed)
            .map(|(symbol, _)| self.position_usd(symbol))
            .sum()
    }

    /// Exposure for positions held in the account but not tagged as managed.
    pub fn external_exposure_usd(&self) -> f64 {
        (self.total_exposure_usd() - self.managed_exposure_usd()).max(0.0)
    }

    /// Aggregate pending notional for a side, optionally for one symbol.
    /// Symbol lookup tolerates both `BTC` and `BTC-USD` keys.
    pub fn pending_notional_usd(&self, side: OrderSide, symbol: Option<&str>) -> f64 {
        let bucket = self.pending_orders.side_bucket(side);
        match symbol {
            None => bucket.values().sum(),
            Some(symbol) => {
                let canonical = canonical_symbol(symbol);
                let base = base_currency(&canonical).to_string();
                bucket
                    .get(&canonical)
                    .or_else(|| bucket.get(&base))
                    .copied()
                    .unwrap_or(0.0)
            }
        }
    }

    pub fn pct_of_nav(&self, usd: f64) -> f64 {
        if self.account_value_usd > 0.0 {
            usd / self.account_value_usd * 100.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn portfolio() -> PortfolioState {
        let mut open_positions = BTreeMap::new();
        open_positions.insert("BTC-USD".to_string(), PositionSnapshot { units: 0.1, usd: 5_000.0 });
        open_positions.insert("ETH-USD".to_string(), PositionSnapshot { units: 1.0, usd: 2_000.0 });
        let mut managed = BTreeMap::new();
        managed.insert("BTC-USD".to_string(), true);
        let mut pending = PendingOrders::default();
        pending.buy.insert("SOL-USD".to_string(), 600.0);
        pending.buy.insert("BTC".to_string(), 300.0);
        PortfolioState {
            account_value_usd: 10_000.0,
            open_positions,
            managed_positions: managed,
            pending_orders: pending,
            daily_pnl_pct: 0.0,
            weekly_pnl_pct: 0.0,
            max_drawdown_pct: 0.0,
            trades_today: 0,
            trades_this_hour: 0,
            consecutive_losses: 0,
            last_loss_time: None,
            current_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_exposure_split() {
        let p = portfolio();
        assert_eq!(p.total_exposure_usd(), 7_000.0);
        assert_eq!(p.managed_exposure_usd(), 5_000.0);
        assert_eq!(p.external_exposure_usd(), 2_000.0);
    }

    #[test]
    fn test_pending_lookup_tolerates_base_keys() {
        let p = portfolio();
        assert_eq!(p.pending_notional_usd(OrderSide::Buy, None), 900.0);
        assert_eq!(p.pending_notional_usd(OrderSide::Buy, Some("SOL-USD")), 600.0);
        // Stored under the bare base currency, looked up canonically
        assert_eq!(p.pending_notional_usd(OrderSide::Buy, Some("BTC-USD")), 300.0);
        assert_eq!(p.pending_notional_usd(OrderSide::Sell, None), 0.0);
    }

    #[test]
    fn test_pct_of_nav_zero_nav() {
        let mut p = portfolio();
        p.account_value_usd = 0.0;
        assert_eq!(p.pct_of_nav(500.0), 0.0);
    }

    #[test]
    fn test_position_usd_canonicalizes() {
        let p = portfolio();
        assert_eq!(p.position_usd("BTC"), 5_000.0);
        assert_eq!(p.position_usd("BTC-USD"), 5_000.0);
        assert_eq!(p.position_usd("DOGE-USD"), 0.0);
    }
}
