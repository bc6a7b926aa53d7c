use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonicalize a symbol to `BASE-QUOTE` form (bare base assets become `BASE-USD`).
pub fn canonical_symbol(symbol: &str) -> String {
    if symbol.is_empty() || symbol.contains('-') {
        symbol.to_string()
    } else {
        format!("{symbol}-USD")
    }
}

/// Base currency of a canonical symbol (`BTC-USD` -> `BTC`).
pub fn base_currency(symbol: &str) -> &str {
    symbol.split('-').next().unwrap_or(symbol)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    LimitPostOnly,
}

/// One OHLCV bar. Candle lists are always time-ordered ascending.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread_bps: f64,
    pub volume_24h: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate orderbook view, enough to evaluate depth gates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderBookSummary {
    pub total_depth_usd: f64,
    pub bid_depth_usd: f64,
    pub ask_depth_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductStatus {
    Online,
    PostOnly,
    LimitOnly,
    CancelOnly,
    Offline,
}

impl ProductStatus {
    /// Degraded statuses block new orders entirely.
    pub fn is_tradeable(&self) -> bool {
        matches!(self, ProductStatus::Online)
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProductStatus::Online => "ONLINE",
            ProductStatus::PostOnly => "POST_ONLY",
            ProductStatus::LimitOnly => "LIMIT_ONLY",
            ProductStatus::CancelOnly => "CANCEL_ONLY",
            ProductStatus::Offline => "OFFLINE",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub symbol: String,
    pub status: ProductStatus,
    pub base_increment: f64,
    pub quote_increment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub currency: String,
    pub available_balance: f64,
}

/// Descriptor of a live (not yet filled or canceled) order on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrderDescriptor {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub product_id: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: Option<f64>,
    pub notional_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeFill {
    pub product_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub fees: f64,
    pub trade_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quote_size_usd: f64,
    /// Base quantity for exits where the full position is unwound.
    pub base_size: Option<f64>,
    pub order_type: OrderType,
    pub client_order_id: String,
}

/// Outcome of a placement attempt. Business rejections are reported here,
/// never raised through the port.
#[derive(Debug, Clone, Default)]
pub struct OrderOutcome {
    pub success: bool,
    pub status: String,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub filled_price: Option<f64>,
    pub filled_size: Option<f64>,
    pub fees: Option<f64>,
    pub error_kind: Option<String>,
}
