use crate::domain::errors::ConfigError;
use crate::domain::regime::Regime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeThresholds {
    pub pct_change_15m: f64,
    pub pct_change_60m: f64,
    pub volume_ratio_1h: f64,
    pub atr_filter_min_mult: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        // Chop baseline
        Self { pct_change_15m: 2.0, pct_change_60m: 4.0, volume_ratio_1h: 1.9, atr_filter_min_mult: 1.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierGuardConfig {
    pub enabled: bool,
    pub max_price_deviation_pct: f64,
    pub min_volume_ratio: f64,
    pub lookback_periods: usize,
}

impl Default for OutlierGuardConfig {
    fn default() -> Self {
        Self { enabled: true, max_price_deviation_pct: 10.0, min_volume_ratio: 0.1, lookback_periods: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtrFilterConfig {
    pub enabled: bool,
    pub lookback_periods: usize,
}

impl Default for AtrFilterConfig {
    fn default() -> Self {
        Self { enabled: true, lookback_periods: 14 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversalConfirmConfig {
    pub close_above_vwap: bool,
    pub higher_low_vs_prev: bool,
    pub rsi_cross_up_50: bool,
    /// 0 disables the bounce confirmation.
    pub min_bounce_from_low_pct: f64,
    pub vwap_window_hours: usize,
}

impl Default for ReversalConfirmConfig {
    fn default() -> Self {
        Self {
            close_above_vwap: true,
            higher_low_vs_prev: true,
            rsi_cross_up_50: true,
            min_bounce_from_low_pct: 2.0,
            vwap_window_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendFilterConfig {
    pub enabled: bool,
    pub ema_period_hours: usize,
    pub slope_lookback_hours: usize,
    pub min_slope_pct_per_hour: BTreeMap<Regime, f64>,
    pub min_slope_default: f64,
}

impl Default for TrendFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ema_period_hours: 21,
            slope_lookback_hours: 3,
            min_slope_pct_per_hour: BTreeMap::new(),
            min_slope_default: 0.0,
        }
    }
}

impl TrendFilterConfig {
    pub fn min_slope(&self, regime: Regime) -> f64 {
        self.min_slope_pct_per_hour.get(&regime).copied().unwrap_or(self.min_slope_default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackScanConfig {
    pub enabled: bool,
    pub min_no_trigger_streak: u32,
    pub relax_pct: f64,
    pub max_new_positions_per_cycle: usize,
    pub allow_downside: bool,
}

impl Default for FallbackScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_no_trigger_streak: 1,
            relax_pct: 0.30,
            max_new_positions_per_cycle: 1,
            allow_downside: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggersConfig {
    pub min_score: f64,
    pub max_triggers_per_cycle: usize,
    pub only_upside: bool,
    pub history_limit_hours: usize,
    pub breakout_lookback_hours: usize,
    pub momentum_min_return_pct: f64,
    pub regime_thresholds: BTreeMap<Regime, RegimeThresholds>,
    pub outlier_guard: OutlierGuardConfig,
    pub atr_filter: AtrFilterConfig,
    pub reversal_confirm: ReversalConfirmConfig,
    pub trend_filter: TrendFilterConfig,
    pub fallback: FallbackScanConfig,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        let mut regime_thresholds = BTreeMap::new();
        regime_thresholds.insert(Regime::Chop, RegimeThresholds::default());
        regime_thresholds.insert(
            Regime::Bull,
            RegimeThresholds { pct_change_15m: 3.5, pct_change_60m: 7.0, volume_ratio_1h: 2.0, atr_filter_min_mult: 1.2 },
        );
        regime_thresholds.insert(
            Regime::Bear,
            RegimeThresholds { pct_change_15m: 3.0, pct_change_60m: 7.0, volume_ratio_1h: 2.0, atr_filter_min_mult: 1.2 },
        );
        regime_thresholds.insert(
            Regime::Crash,
            RegimeThresholds { pct_change_15m: 4.0, pct_change_60m: 8.0, volume_ratio_1h: 2.5, atr_filter_min_mult: 1.3 },
        );
        Self {
            min_score: 0.2,
            max_triggers_per_cycle: 5,
            only_upside: false,
            history_limit_hours: 168,
            breakout_lookback_hours: 24,
            momentum_min_return_pct: 2.0,
            regime_thresholds,
            outlier_guard: OutlierGuardConfig::default(),
            atr_filter: AtrFilterConfig::default(),
            reversal_confirm: ReversalConfirmConfig::default(),
            trend_filter: TrendFilterConfig::default(),
            fallback: FallbackScanConfig::default(),
        }
    }
}

impl TriggersConfig {
    /// Missing regimes fall back to the chop baseline.
    pub fn thresholds(&self, regime: Regime) -> RegimeThresholds {
        self.regime_thresholds
            .get(&regime)
            .or_else(|| self.regime_thresholds.get(&Regime::Chop))
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub triggers: TriggersConfig,
}

impl SignalsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let t = &self.triggers;
        if !(0.0..=1.0).contains(&t.min_score) {
            errors.push("triggers.min_score must be in [0, 1]".into());
        }
        if !(0.0..=0.9).contains(&t.fallback.relax_pct) {
            errors.push("triggers.fallback.relax_pct must be in [0, 0.9]".into());
        }
        if t.breakout_lookback_hours == 0 || t.history_limit_hours < t.breakout_lookback_hours {
            errors.push("triggers.breakout_lookback_hours must fit within history_limit_hours".into());
        }
        if t.atr_filter.lookback_periods == 0 {
            errors.push("triggers.atr_filter.lookback_periods must be >= 1".into());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SignalsConfig::default().validate().unwrap();
    }

    #[test]
    fn test_unknown_regime_falls_back_to_chop() {
        let mut config = TriggersConfig::default();
        config.regime_thresholds.remove(&Regime::Crash);
        let thresholds = config.thresholds(Regime::Crash);
        assert_eq!(thresholds.pct_change_15m, 2.0);
    }

    #[test]
    fn test_parse_toml_regime_thresholds() {
        let doc = r#"
            [triggers]
            min_score = 0.25
            only_upside = true

            [triggers.regime_thresholds.bear]
            pct_change_15m = 3.3
            pct_change_60m = 7.5
            volume_ratio_1h = 2.2
            atr_filter_min_mult = 1.25

            [triggers.trend_filter]
            enabled = true
            [triggers.trend_filter.min_slope_pct_per_hour]
            bear = 0.05
        "#;
        let config: SignalsConfig = toml::from_str(doc).unwrap();
        assert_eq!(config.triggers.min_score, 0.25);
        assert!(config.triggers.only_upside);
        assert_eq!(config.triggers.thresholds(Regime::Bear).pct_change_15m, 3.3);
        assert_eq!(config.triggers.trend_filter.min_slope(Regime::Bear), 0.05);
        assert_eq!(config.triggers.trend_filter.min_slope(Regime::Bull), 0.0);
    }

    #[test]
    fn test_validation_rejects_bad_relax() {
        let mut config = SignalsConfig::default();
        config.triggers.fallback.relax_pct = 0.95;
        assert!(config.validate().is_err());
    }
}
