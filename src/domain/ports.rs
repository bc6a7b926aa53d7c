use crate::domain::errors::ExchangeError;
use crate::domain::types::{
    AccountBalance, Candle, ExchangeFill, OpenOrderDescriptor, OrderBookSummary, OrderOutcome,
    OrderRequest, ProductMetadata, Quote,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Abstract exchange interface the trading core depends on.
///
/// A live adapter talks REST to a centralized exchange; the paper adapter
/// simulates fills with a slippage model. Both honor the same contract:
/// business rejections come back inside `OrderOutcome`, only transport-level
/// failures are errors.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExchangeError>;

    async fn get_orderbook(&self, symbol: &str) -> Result<OrderBookSummary, ExchangeError>;

    async fn get_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError>;

    async fn list_open_orders(&self) -> Result<Vec<OpenOrderDescriptor>, ExchangeError>;

    async fn list_fills(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExchangeFill>, ExchangeError>;

    async fn get_product_metadata(&self, symbol: &str) -> Result<ProductMetadata, ExchangeError>;

    /// All symbols tradeable on the venue; used by dynamic universe discovery.
    async fn get_symbols(&self) -> Result<Vec<String>, ExchangeError>;

    async fn check_connectivity(&self) -> bool;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderOutcome, ExchangeError>;

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<(), ExchangeError>;
}
