use crate::domain::types::Candle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;

/// Macro market state label. Parameterizes trigger thresholds and
/// position-sizing multipliers downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Bull,
    Chop,
    Bear,
    Crash,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Bull => write!(f, "bull"),
            Regime::Chop => write!(f, "chop"),
            Regime::Bear => write!(f, "bear"),
            Regime::Crash => write!(f, "crash"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSignal {
    pub regime: Regime,
    pub confidence: f64,
    pub trend_pct: f64,
    pub annualized_vol_pct: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Threshold multipliers handed to the trigger engine. Bull loosens
/// thresholds, bear and crash tighten them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerMultipliers {
    pub volume_spike: f64,
    pub momentum: f64,
    pub breakout: f64,
}

/// Classifies market regime from a reference asset's recent hourly candles.
///
/// Rules:
/// - crash: trend < -10% in lookback OR annualized vol > 100%
/// - bull:  trend >= +10% and vol < 60%
/// - bear:  trend <= -5%
/// - chop:  everything else
pub struct RegimeDetector {
    lookback_days: usize,
}

impl RegimeDetector {
    pub fn new(lookback_days: usize) -> Self {
        Self { lookback_days }
    }

    pub fn detect(&self, candles: &[Candle], now: DateTime<Utc>) -> RegimeSignal {
        let lookback_hours = self.lookback_days * 24;
        if candles.len() < lookback_hours {
            return RegimeSignal {
                regime: Regime::Chop,
                confidence: 0.5,
                trend_pct: 0.0,
                annualized_vol_pct: 0.0,
                timestamp: now,
                reason: format!(
                    "insufficient data ({} candles < {lookback_hours}) - defaulting to chop",
                    candles.len()
                ),
            };
        }

        let window = &candles[candles.len() - lookback_hours..];
        let start_price = window[0].close;
        let current_price = window[window.len() - 1].close;
        let trend_pct = if start_price > 0.0 {
            (current_price - start_price) / start_price * 100.0
        } else {
            0.0
        };

        let hourly_returns: Vec<f64> = window
            .windows(2)
            .filter(|pair| pair[0].close > 0.0)
            .map(|pair| (pair[1].close - pair[0].close) / pair[0].close * 100.0)
            .collect();
        let vol_hourly = if hourly_returns.len() > 1 {
            hourly_returns.std_dev()
        } else {
            0.0
        };
        let annualized_vol_pct = vol_hourly * (24.0 * 365.0f64).sqrt();

        let (regime, confidence, reason) = Self::classify(trend_pct, annualized_vol_pct);

        RegimeSignal {
            regime,
            confidence,
            trend_pct,
            annualized_vol_pct,
            timestamp: now,
            reason,
        }
    }

    fn classify(trend_pct: f64, vol_pct: f64) -> (Regime, f64, String) {
        // Crash: extreme moves or extreme vol
        if trend_pct < -10.0 || vol_pct > 100.0 {
            if trend_pct < -15.0 && vol_pct > 120.0 {
                return (
                    Regime::Crash,
                    0.9,
                    format!("severe drawdown ({trend_pct:.1}%) + high vol ({vol_pct:.0}%)"),
                );
            }
            return (
                Regime::Crash,
                0.7,
                format!("crash conditions: trend={trend_pct:.1}%, vol={vol_pct:.0}%"),
            );
        }

        // Bull: strong uptrend with manageable vol
        if trend_pct >= 10.0 && vol_pct < 60.0 {
            let confidence = (0.5 + (trend_pct - 10.0) / 50.0).min(0.9);
            return (
                Regime::Bull,
                confidence,
                format!("strong uptrend ({trend_pct:+.1}%) + low vol ({vol_pct:.0}%)"),
            );
        }

        // Bear: downtrend
        if trend_pct <= -5.0 {
            let confidence = (0.5 + (trend_pct + 5.0).abs() / 20.0).min(0.8);
            return (
                Regime::Bear,
                confidence,
                format!("downtrend ({trend_pct:.1}%) + elevated vol ({vol_pct:.0}%)"),
            );
        }

        if trend_pct.abs() < 5.0 {
            (
                Regime::Chop,
                0.8,
                format!("ranging market: trend={trend_pct:+.1}%, vol={vol_pct:.0}%"),
            )
        } else {
            (
                Regime::Chop,
                0.6,
                format!("mild trend ({trend_pct:+.1}%), choppy conditions"),
            )
        }
    }

    pub fn trigger_multipliers(regime: Regime) -> TriggerMultipliers {
        match regime {
            Regime::Bull => TriggerMultipliers { volume_spike: 0.8, momentum: 0.75, breakout: 0.9 },
            Regime::Chop => TriggerMultipliers { volume_spike: 1.0, momentum: 1.0, breakout: 1.0 },
            Regime::Bear => TriggerMultipliers { volume_spike: 1.2, momentum: 1.25, breakout: 1.1 },
            Regime::Crash => TriggerMultipliers { volume_spike: 1.5, momentum: 1.5, breakout: 1.3 },
        }
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new(7)
    }
}
