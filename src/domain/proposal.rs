use crate::domain::triggers::TriggerSignal;
use crate::domain::types::{OrderSide, OrderType};
use crate::domain::universe::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the conviction score was assembled, kept for the audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvictionBreakdown {
    pub base: f64,
    pub strength_component: f64,
    pub confidence_component: f64,
    pub boosts_total: f64,
    pub boosts: Vec<(String, f64)>,
    pub trigger_score: f64,
}

/// Exit context carried by Position-Manager SELL proposals. These bypass
/// percentage sizing (quantity is explicit) but still pass the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDetails {
    pub exit_reason: String,
    pub entry_price: f64,
    pub current_price: f64,
    pub pnl_pct: f64,
    pub hold_hours: f64,
    pub quantity: f64,
    pub notional_usd: f64,
}

/// A candidate trade before the risk gate. An order is a proposal that
/// survived and was submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    pub side: OrderSide,
    /// Percent of account value. Zero for exits, which carry quantity instead.
    pub size_pct: f64,
    pub reason: String,
    pub confidence: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub max_hold_hours: Option<f64>,
    pub tier: Option<Tier>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub strategy: Option<String>,
    pub order_type_override: Option<OrderType>,
    pub exit: Option<ExitDetails>,
    pub conviction: Option<ConvictionBreakdown>,
    #[serde(skip)]
    pub trigger: Option<TriggerSignal>,
    pub timestamp: DateTime<Utc>,
}

impl TradeProposal {
    pub fn new(symbol: impl Into<String>, side: OrderSide, size_pct: f64, reason: impl Into<String>, confidence: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size_pct,
            reason: reason.into(),
            confidence,
            stop_loss_pct: None,
            take_profit_pct: None,
            max_hold_hours: None,
            tier: None,
            tags: Vec::new(),
            strategy: None,
            order_type_override: None,
            exit: None,
            conviction: None,
            trigger: None,
            timestamp,
        }
    }

    pub fn is_buy(&self) -> bool {
        self.side == OrderSide::Buy
    }

    pub fn is_exit(&self) -> bool {
        self.exit.is_some()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn add_tag(&mut self, tag: &str) {
        if !self.has_tag(tag) {
            self.tags.push(tag.to_string());
        }
    }
}
