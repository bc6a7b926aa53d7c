use crate::domain::errors::ConfigError;
use crate::domain::regime::Regime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hard risk constraints. No component (strategy or human) can violate these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    pub daily_stop_pnl_pct: f64,
    pub weekly_stop_pnl_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_total_at_risk_pct: f64,
    pub count_external_positions: bool,
    pub external_exposure_buffer_pct: f64,
    pub max_trades_per_day: u32,
    pub max_new_trades_per_hour: u32,
    pub cooldown_after_loss_trades: u32,
    pub cooldown_minutes: i64,
    pub max_open_positions: usize,
    pub max_new_positions_per_cycle: Option<usize>,
    pub count_open_orders_in_cap: bool,
    pub allow_adds_when_over_cap: bool,
    pub max_position_size_pct: f64,
    pub min_position_size_pct: f64,
    pub min_trade_notional_usd: f64,
    pub dust_threshold_usd: f64,
    pub per_symbol_cooldown_enabled: bool,
    pub per_symbol_cooldown_win_minutes: i64,
    pub per_symbol_cooldown_loss_minutes: i64,
    pub per_symbol_cooldown_after_stop: i64,
    pub min_seconds_between_trades: i64,
    pub per_symbol_trade_spacing_seconds: i64,
    /// Cluster exposure caps. Pending buys count as additive; pending sells
    /// are not treated as reducers.
    pub max_per_theme_pct: BTreeMap<String, f64>,
    pub resize_to_fit: bool,
    pub allow_min_bump: bool,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            daily_stop_pnl_pct: 3.0,
            weekly_stop_pnl_pct: 7.0,
            max_drawdown_pct: 10.0,
            max_total_at_risk_pct: 15.0,
            count_external_positions: true,
            external_exposure_buffer_pct: 0.0,
            max_trades_per_day: 120,
            max_new_trades_per_hour: 5,
            cooldown_after_loss_trades: 3,
            cooldown_minutes: 60,
            max_open_positions: 8,
            max_new_positions_per_cycle: None,
            count_open_orders_in_cap: true,
            allow_adds_when_over_cap: true,
            max_position_size_pct: 5.0,
            min_position_size_pct: 0.5,
            min_trade_notional_usd: 10.0,
            dust_threshold_usd: 1.0,
            per_symbol_cooldown_enabled: true,
            per_symbol_cooldown_win_minutes: 10,
            per_symbol_cooldown_loss_minutes: 60,
            per_symbol_cooldown_after_stop: 120,
            min_seconds_between_trades: 180,
            per_symbol_trade_spacing_seconds: 900,
            max_per_theme_pct: BTreeMap::new(),
            resize_to_fit: true,
            allow_min_bump: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingPolicy {
    pub allow_pyramiding: bool,
    pub target_risk_pct: f64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self { allow_pyramiding: false, target_risk_pct: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeOverride {
    pub position_size_multiplier: f64,
}

impl Default for RegimeOverride {
    fn default() -> Self {
        Self { position_size_multiplier: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimePolicy {
    pub enabled: bool,
    pub overrides: BTreeMap<Regime, RegimeOverride>,
}

impl Default for RegimePolicy {
    fn default() -> Self {
        Self { enabled: true, overrides: BTreeMap::new() }
    }
}

impl RegimePolicy {
    pub fn position_size_multiplier(&self, regime: Regime) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        self.overrides.get(&regime).map(|o| o.position_size_multiplier).unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernancePolicy {
    pub kill_switch_file: String,
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        Self { kill_switch_file: "data/KILL_SWITCH".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerPolicy {
    pub pause_on_rate_limit: bool,
    pub rate_limit_cooldown_seconds: i64,
    pub max_consecutive_api_errors: u32,
    pub api_error_window_seconds: i64,
    pub check_exchange_status: bool,
    pub check_product_status: bool,
    pub min_eligible_assets: usize,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            pause_on_rate_limit: true,
            rate_limit_cooldown_seconds: 60,
            max_consecutive_api_errors: 3,
            api_error_window_seconds: 300,
            check_exchange_status: true,
            check_product_status: true,
            min_eligible_assets: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBaseSizes {
    pub tier1: f64,
    pub tier2: f64,
    pub tier3: f64,
}

impl Default for TierBaseSizes {
    fn default() -> Self {
        Self { tier1: 2.0, tier2: 1.0, tier3: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvictionWeights {
    pub base: f64,
    pub trigger_strength: f64,
    pub trigger_confidence: f64,
    pub quality_boosts: BTreeMap<String, f64>,
}

impl Default for ConvictionWeights {
    fn default() -> Self {
        Self {
            base: 0.0,
            trigger_strength: 0.5,
            trigger_confidence: 0.3,
            quality_boosts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvictionWindow {
    pub lower: f64,
    /// Defaults to the regime's conviction threshold when unset.
    pub upper: Option<f64>,
    pub inclusive_upper: bool,
}

impl Default for ConvictionWindow {
    fn default() -> Self {
        Self { lower: 0.0, upper: None, inclusive_upper: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryPolicy {
    pub enabled: bool,
    pub conviction_window: ConvictionWindow,
    pub require_tier_in: Vec<String>,
    pub size_multiplier: f64,
    pub maker_only: bool,
    pub max_spread_bps: f64,
    pub min_depth_usd: f64,
}

impl Default for CanaryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            conviction_window: ConvictionWindow::default(),
            require_tier_in: vec!["T1".to_string(), "T2".to_string()],
            size_multiplier: 0.25,
            maker_only: true,
            max_spread_bps: 40.0,
            min_depth_usd: 50_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyPolicy {
    pub base_position_pct: TierBaseSizes,
    pub min_conviction_to_propose: f64,
    pub min_conviction_by_regime: BTreeMap<Regime, f64>,
    pub min_trigger_score: f64,
    pub conviction_weights: ConvictionWeights,
    pub canary: CanaryPolicy,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self {
            base_position_pct: TierBaseSizes::default(),
            min_conviction_to_propose: 0.5,
            min_conviction_by_regime: BTreeMap::new(),
            min_trigger_score: 0.2,
            conviction_weights: ConvictionWeights::default(),
            canary: CanaryPolicy::default(),
        }
    }
}

impl StrategyPolicy {
    pub fn min_conviction(&self, regime: Regime) -> f64 {
        self.min_conviction_by_regime
            .get(&regime)
            .copied()
            .unwrap_or(self.min_conviction_to_propose)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressiveExitStep {
    pub after_hours: f64,
    pub name: String,
    /// Exit fires only while PnL is at or below this ceiling.
    pub max_pnl_pct: f64,
    /// 24h momentum below this counts as weak.
    pub weak_momentum_max_pct: f64,
}

impl Default for ProgressiveExitStep {
    fn default() -> Self {
        Self {
            after_hours: 12.0,
            name: "progressive_12h".to_string(),
            max_pnl_pct: 0.0,
            weak_momentum_max_pct: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitPolicy {
    pub enabled: bool,
    pub check_stop_loss: bool,
    pub check_take_profit: bool,
    pub check_max_hold: bool,
    pub progressive: Vec<ProgressiveExitStep>,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            check_stop_loss: true,
            check_take_profit: true,
            check_max_hold: true,
            progressive: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub risk: RiskPolicy,
    pub position_sizing: SizingPolicy,
    pub regime: RegimePolicy,
    pub governance: GovernancePolicy,
    pub circuit_breakers: CircuitBreakerPolicy,
    pub strategy: StrategyPolicy,
    pub exits: ExitPolicy,
}

impl PolicyConfig {
    /// Out-of-range values abort startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let r = &self.risk;

        if r.min_seconds_between_trades < 0 || r.min_seconds_between_trades > 3600 {
            errors.push("risk.min_seconds_between_trades must be in [0, 3600]".into());
        }
        if r.per_symbol_trade_spacing_seconds < 0 || r.per_symbol_trade_spacing_seconds > 86_400 {
            errors.push("risk.per_symbol_trade_spacing_seconds must be in [0, 86400]".into());
        }
        if r.max_new_trades_per_hour < 1 || r.max_new_trades_per_hour > 100 {
            errors.push("risk.max_new_trades_per_hour must be in [1, 100]".into());
        }
        if r.max_trades_per_day < 1 || r.max_trades_per_day > 1000 {
            errors.push("risk.max_trades_per_day must be in [1, 1000]".into());
        }
        for (name, minutes) in [
            ("per_symbol_cooldown_win_minutes", r.per_symbol_cooldown_win_minutes),
            ("per_symbol_cooldown_loss_minutes", r.per_symbol_cooldown_loss_minutes),
            ("per_symbol_cooldown_after_stop", r.per_symbol_cooldown_after_stop),
            ("cooldown_minutes", r.cooldown_minutes),
        ] {
            if !(0..=1440).contains(&minutes) {
                errors.push(format!("risk.{name} must be in [0, 1440]"));
            }
        }
        if r.cooldown_after_loss_trades < 1 || r.cooldown_after_loss_trades > 20 {
            errors.push("risk.cooldown_after_loss_trades must be in [1, 20]".into());
        }
        if r.min_position_size_pct < 0.0 || r.max_position_size_pct <= 0.0 {
            errors.push("risk position size limits must be positive".into());
        }
        if r.min_position_size_pct > r.max_position_size_pct {
            errors.push("risk.min_position_size_pct must be <= max_position_size_pct".into());
        }
        if r.max_total_at_risk_pct <= 0.0 || r.max_total_at_risk_pct > 100.0 {
            errors.push("risk.max_total_at_risk_pct must be in (0, 100]".into());
        }
        if self.strategy.canary.size_multiplier <= 0.0 || self.strategy.canary.size_multiplier > 1.0 {
            errors.push("strategy.canary.size_multiplier must be in (0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.strategy.min_conviction_to_propose) {
            errors.push("strategy.min_conviction_to_propose must be in [0, 1]".into());
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
    fn test_defaults_are_valid() {
        PolicyConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn test_validation_rejects_out_of_range_spacing() {
        let mut policy = PolicyConfig::default();
        policy.risk.min_seconds_between_trades = 7200;
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("min_seconds_between_trades"));
    }

    #[test]
    fn test_validation_rejects_inverted_size_limits() {
        let mut policy = PolicyConfig::default();
        policy.risk.min_position_size_pct = 10.0;
        policy.risk.max_position_size_pct = 5.0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_regime_multiplier_lookup() {
        let mut policy = RegimePolicy::default();
        policy
            .overrides
            .insert(Regime::Bear, RegimeOverride { position_size_multiplier: 0.5 });
        assert_eq!(policy.position_size_multiplier(Regime::Bear), 0.5);
        assert_eq!(policy.position_size_multiplier(Regime::Bull), 1.0);
        policy.enabled = false;
        assert_eq!(policy.position_size_multiplier(Regime::Bear), 1.0);
    }

    #[test]
    fn test_min_conviction_by_regime() {
        let mut strategy = StrategyPolicy::default();
        strategy.min_conviction_by_regime.insert(Regime::Bear, 0.65);
        assert_eq!(strategy.min_conviction(Regime::Bear), 0.65);
        assert_eq!(strategy.min_conviction(Regime::Chop), 0.5);
    }

    #[test]
    fn test_parse_partial_toml() {
        let doc = r#"
            [risk]
            daily_stop_pnl_pct = 5.0
            max_total_at_risk_pct = 20.0

            [strategy.canary]
            enabled = true
        "#;
        let policy: PolicyConfig = toml::from_str(doc).unwrap();
        assert_eq!(policy.risk.daily_stop_pnl_pct, 5.0);
        assert_eq!(policy.risk.max_total_at_risk_pct, 20.0);
        // Untouched sections keep defaults
        assert_eq!(policy.risk.max_position_size_pct, 5.0);
        assert!(policy.strategy.canary.enabled);
        assert!(!policy.position_sizing.allow_pyramiding);
    }
}
