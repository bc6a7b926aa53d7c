use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    PriceMove,
    VolumeSpike,
    Breakout,
    Reversal,
    Momentum,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerKind::PriceMove => "price_move",
            TriggerKind::VolumeSpike => "volume_spike",
            TriggerKind::Breakout => "breakout",
            TriggerKind::Reversal => "reversal",
            TriggerKind::Momentum => "momentum",
        };
        write!(f, "{label}")
    }
}

/// A ranked signal for one symbol. At most one per symbol survives the scan;
/// the engine keeps the strongest by `strength * confidence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSignal {
    pub symbol: String,
    pub kind: TriggerKind,
    pub strength: f64,
    pub confidence: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub current_price: f64,
    pub volume_ratio: Option<f64>,
    pub price_change_pct: Option<f64>,
    /// Annualized volatility for downstream sizing.
    pub volatility: Option<f64>,
    /// Named boolean confirmations. Not gates: conviction-boost inputs
    /// consumed by strategies.
    #[serde(default)]
    pub qualifiers: BTreeMap<String, bool>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl TriggerSignal {
    pub fn score(&self) -> f64 {
        self.strength * self.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_score() {
        let signal = TriggerSignal {
            symbol: "BTC-USD".into(),
            kind: TriggerKind::Momentum,
            strength: 0.5,
            confidence: 0.8,
            reason: "test".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            current_price: 50_000.0,
            volume_ratio: None,
            price_change_pct: Some(4.0),
            volatility: Some(55.0),
            qualifiers: BTreeMap::new(),
            metrics: BTreeMap::new(),
        };
        assert!((signal.score() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TriggerKind::VolumeSpike.to_string(), "volume_spike");
        assert_eq!(TriggerKind::PriceMove.to_string(), "price_move");
    }
}
