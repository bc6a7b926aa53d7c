use crate::domain::regime::Regime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liquidity class. T1 is deepest/tightest, T3 thinnest. Governs base
/// position size, eligibility thresholds, and slippage assumptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    T1,
    T2,
    T3,
}

impl Tier {
    pub fn rank(&self) -> u8 {
        match self {
            Tier::T1 => 1,
            Tier::T2 => 2,
            Tier::T3 => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.rank())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseAsset {
    pub symbol: String,
    pub tier: Tier,
    pub allocation_min_pct: f64,
    pub allocation_max_pct: f64,
    pub volume_24h: f64,
    pub spread_bps: f64,
    pub depth_usd: f64,
    pub eligible: bool,
    pub ineligible_reason: Option<String>,
}

/// Immutable per-cycle view of the eligible universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseSnapshot {
    pub timestamp: DateTime<Utc>,
    pub regime: Regime,
    pub tier_1_assets: Vec<UniverseAsset>,
    pub tier_2_assets: Vec<UniverseAsset>,
    pub tier_3_assets: Vec<UniverseAsset>,
    pub excluded_assets: Vec<String>,
}

impl UniverseSnapshot {
    pub fn total_eligible(&self) -> usize {
        self.tier_1_assets.len() + self.tier_2_assets.len() + self.tier_3_assets.len()
    }

    /// All eligible assets, tiers processed T1 -> T2 -> T3 with config order
    /// preserved inside each tier.
    pub fn all_eligible(&self) -> Vec<&UniverseAsset> {
        self.tier_1_assets
            .iter()
            .chain(self.tier_2_assets.iter())
            .chain(self.tier_3_assets.iter())
            .collect()
    }

    pub fn get_asset(&self, symbol: &str) -> Option<&UniverseAsset> {
        self.all_eligible().into_iter().find(|a| a.symbol == symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.total_eligible() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn asset(symbol: &str, tier: Tier) -> UniverseAsset {
        UniverseAsset {
            symbol: symbol.to_string(),
            tier,
            allocation_min_pct: 1.0,
            allocation_max_pct: 10.0,
            volume_24h: 50_000_000.0,
            spread_bps: 10.0,
            depth_usd: 500_000.0,
            eligible: true,
            ineligible_reason: None,
        }
    }

    #[test]
    fn test_tier_ordering_preserved() {
        let snapshot = UniverseSnapshot {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            regime: Regime::Chop,
            tier_1_assets: vec![asset("BTC-USD", Tier::T1), asset("ETH-USD", Tier::T1)],
            tier_2_assets: vec![asset("SOL-USD", Tier::T2)],
            tier_3_assets: vec![],
            excluded_assets: vec![],
        };
        let symbols: Vec<&str> =
            snapshot.all_eligible().iter().map(|a| a.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTC-USD", "ETH-USD", "SOL-USD"]);
        assert_eq!(snapshot.total_eligible(), 3);
        assert!(snapshot.get_asset("SOL-USD").is_some());
        assert!(snapshot.get_asset("DOGE-USD").is_none());
    }

    #[test]
    fn test_tier_rank() {
        assert!(Tier::T1 < Tier::T2);
        assert_eq!(Tier::T3.rank(), 3);
        assert_eq!(Tier::T2.to_string(), "T2");
    }
}
