use crate::domain::errors::ConfigError;
use crate::domain::regime::Regime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniverseMethod {
    Static,
    DynamicDiscovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicDiscoveryConfig {
    pub tier1_min_volume_usd: f64,
    pub tier2_min_volume_usd: f64,
    pub tier3_min_volume_usd: f64,
    /// Quote probe cap to stay under exchange rate limits.
    pub max_symbols: usize,
    pub tier3_max_symbols: usize,
}

impl Default for DynamicDiscoveryConfig {
    fn default() -> Self {
        Self {
            tier1_min_volume_usd: 100_000_000.0,
            tier2_min_volume_usd: 20_000_000.0,
            tier3_min_volume_usd: 5_000_000.0,
            max_symbols: 50,
            tier3_max_symbols: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NearThresholdOverride {
    pub enable: bool,
    /// Fraction of the volume floor that still qualifies (0.95 = within 5%).
    pub lower_mult: f64,
    pub max_spread_bps: f64,
    pub require_depth_mult: f64,
}

impl Default for NearThresholdOverride {
    fn default() -> Self {
        Self { enable: false, lower_mult: 0.95, max_spread_bps: 30.0, require_depth_mult: 12.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConstraints {
    pub min_allocation_pct: f64,
    pub max_allocation_pct: f64,
    pub min_24h_volume_usd: Option<f64>,
    pub max_spread_bps: Option<f64>,
    pub near_threshold_override: NearThresholdOverride,
}

impl Default for TierConstraints {
    fn default() -> Self {
        Self {
            min_allocation_pct: 1.0,
            max_allocation_pct: 10.0,
            min_24h_volume_usd: None,
            max_spread_bps: None,
            near_threshold_override: NearThresholdOverride::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierDefinition {
    pub symbols: Vec<String>,
    pub constraints: TierConstraints,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub tier_1_core: TierDefinition,
    pub tier_2_rotational: TierDefinition,
    pub tier_3_event_driven: TierDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityConfig {
    pub min_24h_volume_usd: f64,
    pub max_spread_bps: f64,
    pub min_orderbook_depth_usd: f64,
    pub min_orderbook_depth_usd_t1: Option<f64>,
    pub min_orderbook_depth_usd_t2: Option<f64>,
    pub min_orderbook_depth_usd_t3: Option<f64>,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            min_24h_volume_usd: 5_000_000.0,
            max_spread_bps: 100.0,
            min_orderbook_depth_usd: 10_000.0,
            min_orderbook_depth_usd_t1: None,
            min_orderbook_depth_usd_t2: None,
            min_orderbook_depth_usd_t3: None,
        }
    }
}

impl LiquidityConfig {
    pub fn min_depth_for_tier(&self, tier: u8) -> f64 {
        let tier_specific = match tier {
            1 => self.min_orderbook_depth_usd_t1,
            2 => self.min_orderbook_depth_usd_t2,
            3 => self.min_orderbook_depth_usd_t3,
            _ => None,
        };
        tier_specific.unwrap_or(self.min_orderbook_depth_usd)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClustersConfig {
    pub definitions: BTreeMap<String, Vec<String>>,
}

impl ClustersConfig {
    pub fn cluster_of(&self, symbol: &str) -> Option<&str> {
        self.definitions
            .iter()
            .find(|(_, symbols)| symbols.iter().any(|s| s == symbol))
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionsConfig {
    pub never_trade: Vec<String>,
    pub red_flags: Vec<String>,
    pub red_flag_ban_hours: i64,
}

impl Default for ExclusionsConfig {
    fn default() -> Self {
        Self { never_trade: Vec::new(), red_flags: Vec::new(), red_flag_ban_hours: 72 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeModifier {
    pub tier_1_multiplier: f64,
    pub tier_2_multiplier: f64,
    pub tier_3_multiplier: f64,
}

impl Default for RegimeModifier {
    fn default() -> Self {
        Self { tier_1_multiplier: 1.0, tier_2_multiplier: 1.0, tier_3_multiplier: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseSettings {
    pub method: UniverseMethod,
    pub refresh_interval_hours: f64,
    pub dynamic: DynamicDiscoveryConfig,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        Self {
            method: UniverseMethod::Static,
            refresh_interval_hours: 24.0,
            dynamic: DynamicDiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    pub universe: UniverseSettings,
    pub tiers: TiersConfig,
    pub liquidity: LiquidityConfig,
    pub clusters: ClustersConfig,
    pub exclusions: ExclusionsConfig,
    pub regime_modifiers: BTreeMap<Regime, RegimeModifier>,
}

impl UniverseConfig {
    pub fn regime_modifier(&self, regime: Regime) -> RegimeModifier {
        self.regime_modifiers.get(&regime).copied().unwrap_or_default()
    }

    /// Hardcoded core list used when dynamic discovery returns nothing.
    /// Treating zero products as an empty universe would silently halt
    /// trading; it is a failure with a fallback instead.
    pub fn fallback_symbols(&self) -> Vec<String> {
        let layer1 = self.clusters.definitions.get("LAYER1");
        match layer1 {
            Some(symbols) if !symbols.is_empty() => symbols.clone(),
            _ => vec!["BTC-USD".to_string(), "ETH-USD".to_string(), "SOL-USD".to_string()],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let d = &self.universe.dynamic;
        if d.tier1_min_volume_usd < d.tier2_min_volume_usd
            || d.tier2_min_volume_usd < d.tier3_min_volume_usd
        {
            errors.push("universe.dynamic tier volume thresholds must be descending".into());
        }
        if self.universe.refresh_interval_hours <= 0.0 {
            errors.push("universe.refresh_interval_hours must be positive".into());
        }
        if self.exclusions.red_flag_ban_hours < 0 {
            errors.push("exclusions.red_flag_ban_hours must be >= 0".into());
        }
        for (tier, def) in [
            ("tier_1_core", &self.tiers.tier_1_core),
            ("tier_2_rotational", &self.tiers.tier_2_rotational),
            ("tier_3_event_driven", &self.tiers.tier_3_event_driven),
        ] {
            let o = &def.constraints.near_threshold_override;
            if o.enable && !(0.0..=1.0).contains(&o.lower_mult) {
                errors.push(format!("tiers.{tier} near_threshold_override.lower_mult must be in [0, 1]"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}
