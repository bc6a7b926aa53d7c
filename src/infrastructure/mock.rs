//! Scriptable in-memory exchange. Used by tests and by offline DRY_RUN
//! shakedowns when no API credentials are configured.

use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangePort;
use crate::domain::types::{
    AccountBalance, Candle, ExchangeFill, OpenOrderDescriptor, OrderBookSummary, OrderOutcome,
    OrderRequest, OrderSide, ProductMetadata, ProductStatus, Quote,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MockExchange {
    quotes: RwLock<HashMap<String, Quote>>,
    orderbooks: RwLock<HashMap<String, OrderBookSummary>>,
    candles: RwLock<HashMap<String, Vec<Candle>>>,
    metadata: RwLock<HashMap<String, ProductMetadata>>,
    accounts: RwLock<Vec<AccountBalance>>,
    open_orders: RwLock<Vec<OpenOrderDescriptor>>,
    fills: RwLock<Vec<ExchangeFill>>,
    symbols: RwLock<Vec<String>>,
    connectivity: AtomicBool,
    fail_orders: AtomicBool,
    pub placed_orders: RwLock<Vec<OrderRequest>>,
    pub canceled_order_ids: RwLock<Vec<String>>,
    place_order_calls: AtomicUsize,
}

impl MockExchange {
    pub fn new() -> Self {
        let exchange = Self::default();
        exchange.connectivity.store(true, Ordering::SeqCst);
        exchange
    }

    pub async fn set_quote(&self, symbol: &str, mid: f64, spread_bps: f64, volume_24h: f64) {
        let half_spread = mid * spread_bps / 10_000.0 / 2.0;
        self.quotes.write().await.insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                mid,
                bid: mid - half_spread,
                ask: mid + half_spread,
                spread_bps,
                volume_24h,
                timestamp: Utc::now(),
            },
        );
    }

    pub async fn set_orderbook(&self, symbol: &str, total_depth_usd: f64) {
        self.orderbooks.write().await.insert(
            symbol.to_string(),
            OrderBookSummary {
                total_depth_usd,
                bid_depth_usd: total_depth_usd / 2.0,
                ask_depth_usd: total_depth_usd / 2.0,
            },
        );
    }

    pub async fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.write().await.insert(symbol.to_string(), candles);
    }

    pub async fn set_status(&self, symbol: &str, status: ProductStatus) {
        self.metadata.write().await.insert(
            symbol.to_string(),
            ProductMetadata {
                symbol: symbol.to_string(),
                status,
                base_increment: 1e-8,
                quote_increment: 0.01,
            },
        );
    }

    pub async fn set_accounts(&self, balances: Vec<AccountBalance>) {
        *self.accounts.write().await = balances;
    }

    pub async fn set_open_orders(&self, orders: Vec<OpenOrderDescriptor>) {
        *self.open_orders.write().await = orders;
    }

    pub async fn set_fills(&self, fills: Vec<ExchangeFill>) {
        *self.fills.write().await = fills;
    }

    pub async fn set_symbols(&self, symbols: Vec<String>) {
        *self.symbols.write().await = symbols;
    }

    pub fn set_connectivity(&self, up: bool) {
        self.connectivity.store(up, Ordering::SeqCst);
    }

    pub fn set_fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn place_order_count(&self) -> usize {
        self.place_order_calls.load(Ordering::SeqCst)
    }

    /// Convenience for tests: a flat hourly candle series ending now.
    pub fn flat_candles(close: f64, volume: f64, hours: usize) -> Vec<Candle> {
        let end = Utc::now();
        (0..hours)
            .map(|i| {
                let offset = (hours - i) as i64;
                Candle {
                    timestamp: end - Duration::hours(offset),
                    open: close,
                    high: close * 1.001,
                    low: close * 0.999,
                    close,
                    volume,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ExchangePort for MockExchange {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        self.quotes
            .read()
            .await
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::BadRequest(format!("unknown symbol {symbol}")))
    }

    async fn get_orderbook(&self, symbol: &str) -> Result<OrderBookSummary, ExchangeError> {
        self.orderbooks
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::BadRequest(format!("unknown symbol {symbol}")))
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self.candles.read().await.get(symbol).cloned().unwrap_or_default();
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        Ok(self.accounts.read().await.clone())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrderDescriptor>, ExchangeError> {
        Ok(self.open_orders.read().await.clone())
    }

    async fn list_fills(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExchangeFill>, ExchangeError> {
        Ok(self
            .fills
            .read()
            .await
            .iter()
            .filter(|f| f.trade_time >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_product_metadata(&self, symbol: &str) -> Result<ProductMetadata, ExchangeError> {
        match self.metadata.read().await.get(symbol) {
            Some(metadata) => Ok(metadata.clone()),
            // Unscripted products default to ONLINE to keep test setup small
            None => Ok(ProductMetadata {
                symbol: symbol.to_string(),
                status: ProductStatus::Online,
                base_increment: 1e-8,
                quote_increment: 0.01,
            }),
        }
    }

    async fn get_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        Ok(self.symbols.read().await.clone())
    }

    async fn check_connectivity(&self) -> bool {
        self.connectivity.load(Ordering::SeqCst)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderOutcome, ExchangeError> {
        self.place_order_calls.fetch_add(1, Ordering::SeqCst);
        self.placed_orders.write().await.push(request.clone());

        if self.fail_orders.load(Ordering::SeqCst) {
            return Ok(OrderOutcome {
                success: false,
                status: "REJECTED".to_string(),
                client_order_id: Some(request.client_order_id.clone()),
                error_kind: Some("insufficient_funds".to_string()),
                ..Default::default()
            });
        }

        let quote = self.get_quote(&request.symbol).await?;
        let (size, price) = match request.side {
            OrderSide::Buy => (request.quote_size_usd / quote.mid, quote.ask),
            OrderSide::Sell => (
                request.base_size.unwrap_or(request.quote_size_usd / quote.mid),
                quote.bid,
            ),
        };
        let fees = size * price * 0.004;
        Ok(OrderOutcome {
            success: true,
            status: "FILLED".to_string(),
            order_id: Some(format!("mock-{}", self.place_order_count())),
            client_order_id: Some(request.client_order_id.clone()),
            filled_price: Some(price),
            filled_size: Some(size),
            fees: Some(fees),
            error_kind: None,
        })
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<(), ExchangeError> {
        self.canceled_order_ids.write().await.extend_from_slice(order_ids);
        Ok(())
    }
}
