use crate::domain::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskBudgets {
    pub max_at_risk_pct: Option<f64>,
    pub max_trades_per_cycle: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyEntry {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub risk_budgets: RiskBudgets,
    pub params: toml::Table,
}

impl Default for StrategyEntry {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: String::new(),
            description: String::new(),
            risk_budgets: RiskBudgets::default(),
            params: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub strategies: BTreeMap<String, StrategyEntry>,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        let mut strategies = BTreeMap::new();
        strategies.insert(
            "rules".to_string(),
            StrategyEntry {
                enabled: true,
                kind: "rules".to_string(),
                description: "Deterministic rules engine (baseline strategy)".to_string(),
                risk_budgets: RiskBudgets {
                    max_at_risk_pct: Some(15.0),
                    max_trades_per_cycle: Some(5),
                },
                params: toml::Table::new(),
            },
        );
        Self { strategies }
    }
}

impl StrategiesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, entry) in &self.strategies {
            if let Some(max_trades) = entry.risk_budgets.max_trades_per_cycle {
                if max_trades == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "strategies.{name}.risk_budgets.max_trades_per_cycle must be >= 1"
                    )));
                }
            }
            if let Some(at_risk) = entry.risk_budgets.max_at_risk_pct {
                if !(0.0..=100.0).contains(&at_risk) {
                    return Err(ConfigError::Invalid(format!(
                        "strategies.{name}.risk_budgets.max_at_risk_pct must be in [0, 100]"
                    )));
                }
            }
        }
        Ok(())
    }
}
