//! Coinbase Advanced Trade adapter.
//!
//! Authenticated REST with HMAC-SHA256 request signing. Transport failures
//! surface as classified `ExchangeError`s; order rejections come back inside
//! `OrderOutcome` per the port contract.

use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangePort;
use crate::domain::types::{
    AccountBalance, Candle, ExchangeFill, OpenOrderDescriptor, OrderBookSummary, OrderOutcome,
    OrderRequest, OrderSide, OrderType, ProductMetadata, ProductStatus, Quote,
};
use crate::infrastructure::http::HttpClientFactory;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub struct CoinbaseExchange {
    client: ClientWithMiddleware,
    api_key: String,
    api_secret: String,
    base_url: String,
    timeout_secs: u64,
}

impl CoinbaseExchange {
    pub fn new(api_key: String, api_secret: String, base_url: String, timeout_secs: u64) -> Self {
        Self {
            client: HttpClientFactory::create_client(timeout_secs),
            api_key,
            api_secret,
            base_url,
            timeout_secs,
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request<T>(&self, method: reqwest::Method, path: &str, body: Option<String>) -> Result<T, ExchangeError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let timestamp = Utc::now().timestamp().to_string();
        let body_str = body.clone().unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str);
        let url = format!("{}{path}", self.base_url);

        let mut request = self
            .client
            .request(method, &url)
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| match e {
            reqwest_middleware::Error::Reqwest(inner) if inner.is_timeout() => {
                ExchangeError::Timeout(self.timeout_secs)
            }
            other => ExchangeError::Transport(other.to_string()),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ExchangeError::RateLimited { retry_after_secs: 60 },
                401 | 403 => ExchangeError::Auth(body),
                400..=499 => ExchangeError::BadRequest(body),
                code => ExchangeError::Http { status: code, body },
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))
    }
}

fn parse_f64(raw: &str) -> f64 {
    raw.parse().unwrap_or(0.0)
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    best_bid: String,
    best_ask: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    volume_24h: String,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    product_id: String,
    status: String,
    #[serde(default)]
    base_increment: String,
    #[serde(default)]
    quote_increment: String,
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    products: Vec<ProductResponse>,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    start: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<CandleRow>,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct BookSide {
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
}

#[derive(Debug, Deserialize)]
struct ProductBookResponse {
    pricebook: BookSide,
}

#[derive(Debug, Deserialize)]
struct BalanceValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct AccountRow {
    currency: String,
    available_balance: BalanceValue,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<AccountRow>,
}

#[derive(Debug, Deserialize)]
struct OpenOrderRow {
    order_id: String,
    #[serde(default)]
    client_order_id: Option<String>,
    product_id: String,
    side: String,
    #[serde(default)]
    base_size: String,
    #[serde(default)]
    limit_price: String,
    #[serde(default)]
    outstanding_hold_amount: String,
}

#[derive(Debug, Deserialize)]
struct OpenOrdersResponse {
    orders: Vec<OpenOrderRow>,
}

#[derive(Debug, Deserialize)]
struct FillRow {
    product_id: String,
    side: String,
    price: String,
    size: String,
    #[serde(default)]
    commission: String,
    trade_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct FillsResponse {
    fills: Vec<FillRow>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderSuccess {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    client_order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    success: bool,
    #[serde(default)]
    success_response: Option<PlaceOrderSuccess>,
    #[serde(default)]
    error_response: Option<PlaceOrderError>,
}

fn parse_side(raw: &str) -> OrderSide {
    if raw.eq_ignore_ascii_case("sell") {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

fn parse_status(raw: &str) -> ProductStatus {
    match raw.to_uppercase().as_str() {
        "ONLINE" => ProductStatus::Online,
        "POST_ONLY" => ProductStatus::PostOnly,
        "LIMIT_ONLY" => ProductStatus::LimitOnly,
        "CANCEL_ONLY" => ProductStatus::CancelOnly,
        _ => ProductStatus::Offline,
    }
}

fn granularity(interval: &str) -> &'static str {
    match interval {
        "5m" => "FIVE_MINUTE",
        "15m" => "FIFTEEN_MINUTE",
        "1d" => "ONE_DAY",
        _ => "ONE_HOUR",
    }
}

fn interval_secs(interval: &str) -> i64 {
    match interval {
        "5m" => 300,
        "15m" => 900,
        "1d" => 86_400,
        _ => 3_600,
    }
}

#[async_trait]
impl ExchangePort for CoinbaseExchange {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        let path = format!("/api/v3/brokerage/products/{symbol}/ticker?limit=1");
        let ticker: TickerResponse = self.request(reqwest::Method::GET, &path, None).await?;
        let bid = parse_f64(&ticker.best_bid);
        let ask = parse_f64(&ticker.best_ask);
        let mid = if bid > 0.0 && ask > 0.0 { (bid + ask) / 2.0 } else { parse_f64(&ticker.price) };
        let spread_bps = if mid > 0.0 && ask >= bid { (ask - bid) / mid * 10_000.0 } else { 0.0 };
        Ok(Quote {
            symbol: symbol.to_string(),
            mid,
            bid,
            ask,
            spread_bps,
            volume_24h: parse_f64(&ticker.volume_24h),
            timestamp: Utc::now(),
        })
    }

    async fn get_orderbook(&self, symbol: &str) -> Result<OrderBookSummary, ExchangeError> {
        let path = format!("/api/v3/brokerage/product_book?product_id={symbol}&limit=50");
        let book: ProductBookResponse = self.request(reqwest::Method::GET, &path, None).await?;
        let bid_depth: f64 = book
            .pricebook
            .bids
            .iter()
            .map(|l| parse_f64(&l.price) * parse_f64(&l.size))
            .sum();
        let ask_depth: f64 = book
            .pricebook
            .asks
            .iter()
            .map(|l| parse_f64(&l.price) * parse_f64(&l.size))
            .sum();
        Ok(OrderBookSummary {
            total_depth_usd: bid_depth + ask_depth,
            bid_depth_usd: bid_depth,
            ask_depth_usd: ask_depth,
        })
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let end = Utc::now().timestamp();
        let start = end - interval_secs(interval) * limit as i64;
        let path = format!(
            "/api/v3/brokerage/products/{symbol}/candles?start={start}&end={end}&granularity={}",
            granularity(interval)
        );
        let response: CandlesResponse = self.request(reqwest::Method::GET, &path, None).await?;
        let mut candles: Vec<Candle> = response
            .candles
            .iter()
            .filter_map(|row| {
                let ts = row.start.parse::<i64>().ok()?;
                Some(Candle {
                    timestamp: Utc.timestamp_opt(ts, 0).single()?,
                    open: parse_f64(&row.open),
                    high: parse_f64(&row.high),
                    low: parse_f64(&row.low),
                    close: parse_f64(&row.close),
                    volume: parse_f64(&row.volume),
                })
            })
            .collect();
        // API returns newest-first; the core expects ascending time order
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        let response: AccountsResponse = self
            .request(reqwest::Method::GET, "/api/v3/brokerage/accounts?limit=250", None)
            .await?;
        Ok(response
            .accounts
            .into_iter()
            .map(|row| AccountBalance {
                currency: row.currency,
                available_balance: parse_f64(&row.available_balance.value),
            })
            .collect())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrderDescriptor>, ExchangeError> {
        let response: OpenOrdersResponse = self
            .request(
                reqwest::Method::GET,
                "/api/v3/brokerage/orders/historical/batch?order_status=OPEN",
                None,
            )
            .await?;
        Ok(response
            .orders
            .into_iter()
            .map(|row| {
                let size = parse_f64(&row.base_size);
                let price = parse_f64(&row.limit_price);
                let hold = parse_f64(&row.outstanding_hold_amount);
                OpenOrderDescriptor {
                    order_id: row.order_id,
                    client_order_id: row.client_order_id,
                    product_id: row.product_id,
                    side: parse_side(&row.side),
                    size,
                    price: (price > 0.0).then_some(price),
                    notional_usd: if hold > 0.0 { hold } else { size * price },
                }
            })
            .collect())
    }

    async fn list_fills(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExchangeFill>, ExchangeError> {
        let path = format!(
            "/api/v3/brokerage/orders/historical/fills?start_sequence_timestamp={}&limit={limit}",
            since.to_rfc3339()
        );
        let response: FillsResponse = self.request(reqwest::Method::GET, &path, None).await?;
        Ok(response
            .fills
            .into_iter()
            .map(|row| ExchangeFill {
                product_id: row.product_id,
                side: parse_side(&row.side),
                price: parse_f64(&row.price),
                size: parse_f64(&row.size),
                fees: parse_f64(&row.commission),
                trade_time: row.trade_time,
            })
            .collect())
    }

    async fn get_product_metadata(&self, symbol: &str) -> Result<ProductMetadata, ExchangeError> {
        let path = format!("/api/v3/brokerage/products/{symbol}");
        let product: ProductResponse = self.request(reqwest::Method::GET, &path, None).await?;
        Ok(ProductMetadata {
            symbol: product.product_id,
            status: parse_status(&product.status),
            base_increment: parse_f64(&product.base_increment),
            quote_increment: parse_f64(&product.quote_increment),
        })
    }

    async fn get_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        let response: ProductsResponse = self
            .request(reqwest::Method::GET, "/api/v3/brokerage/products", None)
            .await?;
        Ok(response.products.into_iter().map(|p| p.product_id).collect())
    }

    async fn check_connectivity(&self) -> bool {
        match self
            .request::<ProductsResponse>(reqwest::Method::GET, "/api/v3/brokerage/products?limit=1", None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("connectivity probe failed: {e}");
                false
            }
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderOutcome, ExchangeError> {
        let configuration = match (request.order_type, request.side) {
            (OrderType::Market, OrderSide::Buy) => serde_json::json!({
                "market_market_ioc": { "quote_size": format!("{:.2}", request.quote_size_usd) }
            }),
            (OrderType::Market, OrderSide::Sell) => serde_json::json!({
                "market_market_ioc": {
                    "base_size": format!("{:.8}", request.base_size.unwrap_or(0.0))
                }
            }),
            (OrderType::LimitPostOnly, _) => serde_json::json!({
                "limit_limit_gtc": {
                    "quote_size": format!("{:.2}", request.quote_size_usd),
                    "post_only": true
                }
            }),
        };
        let body = serde_json::json!({
            "client_order_id": request.client_order_id,
            "product_id": request.symbol,
            "side": request.side.to_string(),
            "order_configuration": configuration,
        })
        .to_string();

        let response: PlaceOrderResponse = self
            .request(reqwest::Method::POST, "/api/v3/brokerage/orders", Some(body))
            .await?;

        if response.success {
            let success = response.success_response.unwrap_or(PlaceOrderSuccess {
                order_id: String::new(),
                client_order_id: None,
            });
            debug!("order accepted: {} {}", request.side, request.symbol);
            Ok(OrderOutcome {
                success: true,
                status: "OPEN".to_string(),
                order_id: Some(success.order_id),
                client_order_id: success
                    .client_order_id
                    .or_else(|| Some(request.client_order_id.clone())),
                filled_price: None,
                filled_size: None,
                fees: None,
                error_kind: None,
            })
        } else {
            let error = response.error_response.unwrap_or(PlaceOrderError {
                error: "UNKNOWN".to_string(),
                message: String::new(),
            });
            warn!(
                "order rejected for {} {}: {} {}",
                request.side, request.symbol, error.error, error.message
            );
            Ok(OrderOutcome {
                success: false,
                status: "REJECTED".to_string(),
                order_id: None,
                client_order_id: Some(request.client_order_id.clone()),
                filled_price: None,
                filled_size: None,
                fees: None,
                error_kind: Some(error.error),
            })
        }
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<(), ExchangeError> {
        if order_ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "order_ids": order_ids }).to_string();
        let _: serde_json::Value = self
            .request(reqwest::Method::POST, "/api/v3/brokerage/orders/batch_cancel", Some(body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic_hex() {
        let exchange = CoinbaseExchange::new(
            "key".to_string(),
            "secret".to_string(),
            "https://api.coinbase.com".to_string(),
            10,
        );
        let a = exchange.sign("1700000000", "GET", "/api/v3/brokerage/accounts", "");
        let b = exchange.sign("1700000000", "GET", "/api/v3/brokerage/accounts", "");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // Different payload, different signature
        let c = exchange.sign("1700000001", "GET", "/api/v3/brokerage/accounts", "");
        assert_ne!(a, c);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(parse_status("online"), ProductStatus::Online);
        assert_eq!(parse_status("POST_ONLY"), ProductStatus::PostOnly);
        assert_eq!(parse_status("delisted"), ProductStatus::Offline);
    }

    #[test]
    fn test_granularity_mapping() {
        assert_eq!(granularity("1h"), "ONE_HOUR");
        assert_eq!(granularity("5m"), "FIVE_MINUTE");
        assert_eq!(interval_secs("1h"), 3_600);
    }
}
