//! Paper exchange: delegates market data to an inner adapter and simulates
//! the account, orders, and fills locally with a slippage model.

use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangePort;
use crate::domain::types::{
    base_currency, AccountBalance, Candle, ExchangeFill, OpenOrderDescriptor, OrderBookSummary,
    OrderOutcome, OrderRequest, OrderSide, OrderType, ProductMetadata, Quote,
};
use crate::domain::universe::Tier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Execution-cost model: tiered base slippage, log-scale market impact for
/// large orders, and a volatility widening factor.
#[derive(Debug, Clone)]
pub struct SlippageConfig {
    pub maker_fee_bps: f64,
    pub taker_fee_bps: f64,
    pub tier1_slippage_bps: f64,
    pub tier2_slippage_bps: f64,
    pub tier3_slippage_bps: f64,
    pub market_impact_multiplier: f64,
    pub volatility_multiplier: f64,
    pub high_volatility_threshold_pct: f64,
    pub enable_partial_fills: bool,
    pub partial_fill_probability: f64,
    pub partial_fill_min_pct: f64,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            maker_fee_bps: 40.0,
            taker_fee_bps: 60.0,
            tier1_slippage_bps: 10.0,
            tier2_slippage_bps: 25.0,
            tier3_slippage_bps: 50.0,
            market_impact_multiplier: 1.2,
            volatility_multiplier: 1.5,
            high_volatility_threshold_pct: 5.0,
            enable_partial_fills: false,
            partial_fill_probability: 0.1,
            partial_fill_min_pct: 0.5,
        }
    }
}

pub struct SlippageModel {
    config: SlippageConfig,
}

impl SlippageModel {
    pub fn new(config: SlippageConfig) -> Self {
        Self { config }
    }

    fn tier_slippage_bps(&self, tier: Tier) -> f64 {
        match tier {
            Tier::T1 => self.config.tier1_slippage_bps,
            Tier::T2 => self.config.tier2_slippage_bps,
            Tier::T3 => self.config.tier3_slippage_bps,
        }
    }

    /// Effective fill price including slippage. Slippage always moves against
    /// the order: buys fill above mid, sells below.
    pub fn fill_price(
        &self,
        mid_price: f64,
        side: OrderSide,
        tier: Tier,
        notional_usd: f64,
        volatility_pct: Option<f64>,
    ) -> f64 {
        let base_slippage_bps = self.tier_slippage_bps(tier);

        // $10k = 1.0x, $100k = 1.2x, $1M = 1.4x, capped
        let impact_multiplier = if notional_usd > 10_000.0 {
            let size_factor = (notional_usd / 10_000.0).log10();
            (1.0 + size_factor * 0.2).min(self.config.market_impact_multiplier)
        } else {
            1.0
        };

        let vol_multiplier = match volatility_pct {
            Some(vol) if vol > self.config.high_volatility_threshold_pct => {
                (vol / self.config.high_volatility_threshold_pct)
                    .min(self.config.volatility_multiplier)
            }
            _ => 1.0,
        };

        let slippage_fraction =
            base_slippage_bps * impact_multiplier * vol_multiplier / 10_000.0;
        match side {
            OrderSide::Buy => mid_price * (1.0 + slippage_fraction),
            OrderSide::Sell => mid_price * (1.0 - slippage_fraction),
        }
    }

    pub fn fee_bps(&self, order_type: OrderType) -> f64 {
        match order_type {
            OrderType::LimitPostOnly => self.config.maker_fee_bps,
            OrderType::Market => self.config.taker_fee_bps,
        }
    }

    fn maybe_partial_fill_fraction(&self, tier: Tier) -> f64 {
        if !self.config.enable_partial_fills {
            return 1.0;
        }
        let mut rng = rand::rng();
        let tier_probability = self.config.partial_fill_probability
            * match tier {
                Tier::T1 => 0.5,
                Tier::T2 => 1.0,
                Tier::T3 => 1.5,
            };
        if rng.random::<f64>() < tier_probability {
            rng.random_range(self.config.partial_fill_min_pct..1.0)
        } else {
            1.0
        }
    }
}

struct PaperAccount {
    cash: BTreeMap<String, f64>,
    holdings: BTreeMap<String, f64>,
    fills: Vec<ExchangeFill>,
}

/// Simulated exchange. Market data comes from `data_source`; orders fill
/// deterministically against the current quote plus modeled slippage.
pub struct PaperExchange {
    data_source: Arc<dyn ExchangePort>,
    slippage: SlippageModel,
    account: Mutex<PaperAccount>,
    tier_lookup: BTreeMap<String, Tier>,
}

impl PaperExchange {
    pub fn new(
        data_source: Arc<dyn ExchangePort>,
        slippage: SlippageModel,
        starting_cash_usd: f64,
        tier_lookup: BTreeMap<String, Tier>,
    ) -> Self {
        let mut cash = BTreeMap::new();
        cash.insert("USD".to_string(), starting_cash_usd);
        Self {
            data_source,
            slippage,
            account: Mutex::new(PaperAccount {
                cash,
                holdings: BTreeMap::new(),
                fills: Vec::new(),
            }),
            tier_lookup,
        }
    }

    fn tier_of(&self, symbol: &str) -> Tier {
        self.tier_lookup.get(symbol).copied().unwrap_or(Tier::T2)
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        self.data_source.get_quote(symbol).await
    }

    async fn get_orderbook(&self, symbol: &str) -> Result<OrderBookSummary, ExchangeError> {
        self.data_source.get_orderbook(symbol).await
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.data_source.get_ohlcv(symbol, interval, limit).await
    }

    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        let account = self.account.lock().await;
        let mut balances: Vec<AccountBalance> = account
            .cash
            .iter()
            .map(|(currency, amount)| AccountBalance {
                currency: currency.clone(),
                available_balance: *amount,
            })
            .collect();
        balances.extend(account.holdings.iter().filter(|(_, units)| **units > 0.0).map(
            |(currency, units)| AccountBalance {
                currency: currency.clone(),
                available_balance: *units,
            },
        ));
        Ok(balances)
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrderDescriptor>, ExchangeError> {
        // Paper fills are synchronous; nothing rests on the book.
        Ok(Vec::new())
    }

    async fn list_fills(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExchangeFill>, ExchangeError> {
        let account = self.account.lock().await;
        Ok(account
            .fills
            .iter()
            .filter(|f| f.trade_time >= since)
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_product_metadata(&self, symbol: &str) -> Result<ProductMetadata, ExchangeError> {
        self.data_source.get_product_metadata(symbol).await
    }

    async fn get_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        self.data_source.get_symbols().await
    }

    async fn check_connectivity(&self) -> bool {
        self.data_source.check_connectivity().await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderOutcome, ExchangeError> {
        let quote = self.data_source.get_quote(&request.symbol).await?;
        let tier = self.tier_of(&request.symbol);
        let mut account = self.account.lock().await;

        let order_id = Uuid::new_v4().to_string();
        let base = base_currency(&request.symbol).to_string();

        match request.side {
            OrderSide::Buy => {
                let notional = request.quote_size_usd;
                let cash = account.cash.get("USD").copied().unwrap_or(0.0);
                if notional > cash {
                    debug!("paper BUY rejected: notional {notional} > cash {cash}");
                    return Ok(OrderOutcome {
                        success: false,
                        status: "REJECTED".to_string(),
                        order_id: Some(order_id),
                        client_order_id: Some(request.client_order_id.clone()),
                        error_kind: Some("insufficient_funds".to_string()),
                        ..Default::default()
                    });
                }

                let fill_fraction = self.slippage.maybe_partial_fill_fraction(tier);
                let filled_notional = notional * fill_fraction;
                let fill_price = self.slippage.fill_price(
                    quote.mid,
                    OrderSide::Buy,
                    tier,
                    filled_notional,
                    None,
                );
                let size = filled_notional / fill_price;
                let fees =
                    filled_notional * self.slippage.fee_bps(request.order_type) / 10_000.0;

                *account.cash.entry("USD".to_string()).or_insert(0.0) -=
                    filled_notional + fees;
                *account.holdings.entry(base).or_insert(0.0) += size;
                account.fills.push(ExchangeFill {
                    product_id: request.symbol.clone(),
                    side: OrderSide::Buy,
                    price: fill_price,
                    size,
                    fees,
                    trade_time: Utc::now(),
                });

                info!(
                    "paper fill: BUY {size:.8} {} @ {fill_price:.2} (fees {fees:.2})",
                    request.symbol
                );
                Ok(OrderOutcome {
                    success: true,
                    status: "FILLED".to_string(),
                    order_id: Some(order_id),
                    client_order_id: Some(request.client_order_id.clone()),
                    filled_price: Some(fill_price),
                    filled_size: Some(size),
                    fees: Some(fees),
                    error_kind: None,
                })
            }
            OrderSide::Sell => {
                let held = account.holdings.get(&base).copied().unwrap_or(0.0);
                let size = request.base_size.unwrap_or_else(|| {
                    if quote.mid > 0.0 {
                        request.quote_size_usd / quote.mid
                    } else {
                        0.0
                    }
                });
                if size <= 0.0 || size > held + 1e-9 {
                    debug!("paper SELL rejected: size {size} vs held {held}");
                    return Ok(OrderOutcome {
                        success: false,
                        status: "REJECTED".to_string(),
                        order_id: Some(order_id),
                        client_order_id: Some(request.client_order_id.clone()),
                        error_kind: Some("insufficient_position".to_string()),
                        ..Default::default()
                    });
                }

                let fill_price =
                    self.slippage
                        .fill_price(quote.mid, OrderSide::Sell, tier, size * quote.mid, None);
                let notional = size * fill_price;
                let fees = notional * self.slippage.fee_bps(request.order_type) / 10_000.0;

                *account.holdings.entry(base).or_insert(0.0) -= size;
                *account.cash.entry("USD".to_string()).or_insert(0.0) += notional - fees;
                account.fills.push(ExchangeFill {
                    product_id: request.symbol.clone(),
                    side: OrderSide::Sell,
                    price: fill_price,
                    size,
                    fees,
                    trade_time: Utc::now(),
                });

                info!(
                    "paper fill: SELL {size:.8} {} @ {fill_price:.2} (fees {fees:.2})",
                    request.symbol
                );
                Ok(OrderOutcome {
                    success: true,
                    status: "FILLED".to_string(),
                    order_id: Some(order_id),
                    client_order_id: Some(request.client_order_id.clone()),
                    filled_price: Some(fill_price),
                    filled_size: Some(size),
                    fees: Some(fees),
                    error_kind: None,
                })
            }
        }
    }

    async fn cancel_orders(&self, _order_ids: &[String]) -> Result<(), ExchangeError> {
        Ok(())
    }
}
