//! Configuration documents, parsed once at start-up and validated.
//!
//! Four policy documents live in the config directory (`policy.toml`,
//! `universe.toml`, `signals.toml`, `strategies.toml`) plus the app-level
//! `app.toml`. Missing files fall back to defaults with a warning; invalid or
//! out-of-range values are fatal.

mod policy;
mod signals;
mod strategies;
mod universe;

pub use policy::{
    CanaryPolicy, CircuitBreakerPolicy, ConvictionWeights, ConvictionWindow, ExitPolicy,
    GovernancePolicy, PolicyConfig, ProgressiveExitStep, RegimeOverride, RegimePolicy, RiskPolicy,
    SizingPolicy, StrategyPolicy, TierBaseSizes,
};
pub use signals::{
    AtrFilterConfig, FallbackScanConfig, OutlierGuardConfig, RegimeThresholds,
    ReversalConfirmConfig, SignalsConfig, TrendFilterConfig, TriggersConfig,
};
pub use strategies::{RiskBudgets, StrategiesConfig, StrategyEntry};
pub use universe::{
    ClustersConfig, DynamicDiscoveryConfig, ExclusionsConfig, LiquidityConfig,
    NearThresholdOverride, RegimeModifier, TierConstraints, TierDefinition, TiersConfig,
    UniverseConfig, UniverseMethod, UniverseSettings,
};

use crate::domain::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Application execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Full pipeline, order placement bypassed.
    DryRun,
    /// Deterministic simulated fills.
    Paper,
    /// Real exchange adapter.
    Live,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dry_run" | "dryrun" => Ok(Mode::DryRun),
            "paper" => Ok(Mode::Paper),
            "live" => Ok(Mode::Live),
            other => Err(ConfigError::Invalid(format!(
                "invalid mode '{other}': must be 'dry_run', 'paper', or 'live'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub mode: Mode,
    pub cycle_interval_secs: u64,
    pub state_backend: StateBackendKind,
    pub state_file: String,
    pub state_db: String,
    pub lock_file: String,
    /// Reference asset for regime detection.
    pub reference_symbol: String,
    pub regime_lookback_days: usize,
    pub exchange_timeout_secs: u64,
    pub paper_starting_cash_usd: f64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            mode: Mode::DryRun,
            cycle_interval_secs: 300,
            state_backend: StateBackendKind::Json,
            state_file: "data/state.json".to_string(),
            state_db: "data/state.db".to_string(),
            lock_file: "data/tidetrader.lock".to_string(),
            reference_symbol: "BTC-USD".to_string(),
            regime_lookback_days: 7,
            exchange_timeout_secs: 10,
            paper_starting_cash_usd: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub enabled: bool,
    pub webhook_url: String,
    pub min_severity: String,
    pub dry_run: bool,
    pub timeout_secs: u64,
    pub dedupe_secs: u64,
    pub escalation_secs: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            min_severity: "warning".to_string(),
            dry_run: false,
            timeout_secs: 5,
            dedupe_secs: 60,
            escalation_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub alerting: AlertSettings,
}

/// All configuration the process runs with.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub app: AppSettings,
    pub alerting: AlertSettings,
    pub policy: PolicyConfig,
    pub universe: UniverseConfig,
    pub signals: SignalsConfig,
    pub strategies: StrategiesConfig,
}

impl Config {
    /// Load every config document from `dir`, falling back to defaults for
    /// missing files, then validate. Validation failures are fatal.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let app: AppConfig = load_document(&dir.join("app.toml"))?;
        let policy: PolicyConfig = load_document(&dir.join("policy.toml"))?;
        let universe: UniverseConfig = load_document(&dir.join("universe.toml"))?;
        let signals: SignalsConfig = load_document(&dir.join("signals.toml"))?;
        let strategies: StrategiesConfig = load_document(&dir.join("strategies.toml"))?;

        let config = Self {
            app: app.app,
            alerting: app.alerting,
            policy,
            universe,
            signals,
            strategies,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()?;
        self.universe.validate()?;
        self.signals.validate()?;
        self.strategies.validate()?;
        if self.app.cycle_interval_secs == 0 {
            return Err(ConfigError::Invalid("app.cycle_interval_secs must be >= 1".into()));
        }
        if self.app.exchange_timeout_secs == 0 {
            return Err(ConfigError::Invalid("app.exchange_timeout_secs must be >= 1".into()));
        }
        Ok(())
    }

    pub fn kill_switch_path(&self) -> PathBuf {
        PathBuf::from(&self.policy.governance.kill_switch_file)
    }
}

fn load_document<T>(path: &Path) -> Result<T, ConfigError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        warn!("config file {} not found, using defaults", path.display());
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str(&raw).map_err(|e| ConfigError::Parse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })
}
