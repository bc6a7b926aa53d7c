//! Persistent process-wide state: positions, PnL, cooldowns, pending markers,
//! the open-order cache, and counters.
//!
//! Single owner of mutable state. Every operation loads the document, applies
//! the mutation, and saves atomically through the backend. Reads run the
//! auto-reset rule (daily/hourly counters on UTC boundary change, lazy
//! cooldown expunge, expired pending markers). All timestamps are UTC by
//! construction; naive timestamps cannot enter the document.

mod backend;

pub use backend::{JsonFileBackend, SqliteBackend, StateBackend};

use crate::domain::errors::StateError;
use crate::domain::types::{base_currency, canonical_symbol, OrderSide};
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const PENDING_TTL_SECONDS: i64 = 120;
const MAX_PENDING_MARKERS: usize = 200;
const MAX_FILL_HISTORY: usize = 100;
const MAX_EVENTS: usize = 100;
const MAX_RECENT_ORDERS: usize = 50;
/// Remaining units at or below this are treated as dust and the position is
/// removed from the ledger.
const DUST_UNITS: f64 = 1e-4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLedger {
    pub units: f64,
    pub entry_price: f64,
    /// Mark value in USD; drives every risk calculation.
    pub usd: f64,
    pub entry_value_usd: f64,
    pub fees_paid: f64,
    pub entry_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_fill_price: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedPosition {
    pub entry_price: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub max_hold_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCacheEntry {
    pub product_id: String,
    pub side: OrderSide,
    pub quote_size_usd: f64,
    pub status: String,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMarker {
    pub product_id: String,
    pub base: String,
    pub side: OrderSide,
    pub client_order_id: Option<String>,
    pub order_id: Option<String>,
    pub notional_usd: Option<f64>,
    pub since: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcomeRecord {
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub at: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// The persisted state document. `#[serde(default)]` merges partial files
/// with defaults, so older documents keep loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderState {
    pub pnl_today: f64,
    /// Rolling accumulator; no automatic calendar reset.
    pub pnl_week: f64,
    pub trades_today: u32,
    pub trades_this_hour: u32,
    pub consecutive_losses: u32,
    pub last_loss_time: Option<DateTime<Utc>>,
    pub last_win_time: Option<DateTime<Utc>>,
    pub cooldowns: BTreeMap<String, DateTime<Utc>>,
    pub positions: BTreeMap<String, PositionLedger>,
    pub managed_positions: BTreeMap<String, ManagedPosition>,
    pub cash_balances: BTreeMap<String, f64>,
    pub open_orders: BTreeMap<String, OrderCacheEntry>,
    pub recent_orders: Vec<OrderCacheEntry>,
    pub pending_markers: BTreeMap<String, PendingMarker>,
    pub last_fill_times: BTreeMap<String, DateTime<Utc>>,
    pub fill_history: BTreeMap<String, Vec<DateTime<Utc>>>,
    pub last_trade_timestamp: Option<DateTime<Utc>>,
    pub last_trade_time_by_symbol: BTreeMap<String, DateTime<Utc>>,
    pub last_trade_result: BTreeMap<String, TradeOutcomeRecord>,
    pub high_water_mark: f64,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_reset_date: Option<NaiveDate>,
    pub last_reset_hour: Option<u32>,
    pub zero_trigger_cycles: u32,
    pub events: Vec<StateEvent>,
}

impl TraderState {
    pub fn push_event(&mut self, at: DateTime<Utc>, event: &str, detail: serde_json::Value) {
        self.events.push(StateEvent { at, event: event.to_string(), detail });
        if self.events.len() > MAX_EVENTS {
            let excess = self.events.len() - MAX_EVENTS;
            self.events.drain(..excess);
        }
    }

    fn purge_expired_pending(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .pending_markers
            .iter()
            .filter(|(_, marker)| marker.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.pending_markers.remove(key);
        }
        expired
    }

    fn expunge_cooldowns(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .cooldowns
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        if !expired.is_empty() {
            debug!("cleared expired cooldowns for {:?}", expired);
        }
        for symbol in expired {
            self.cooldowns.remove(&symbol);
        }
    }

    fn auto_reset(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.last_reset_date != Some(today) {
            info!(
                "resetting daily counters (last reset: {:?}, today: {})",
                self.last_reset_date, today
            );
            self.trades_today = 0;
            self.pnl_today = 0.0;
            self.last_reset_date = Some(today);
        }

        let current_hour = now.hour();
        let hour_changed = self.last_reset_hour != Some(current_hour);
        if hour_changed {
            debug!("resetting hourly counters (last reset: {:?}h)", self.last_reset_hour);
            self.trades_this_hour = 0;
            self.last_reset_hour = Some(current_hour);
        }

        self.expunge_cooldowns(now);
        self.purge_expired_pending(now);
    }

    fn trim_recent_orders(&mut self) {
        if self.recent_orders.len() > MAX_RECENT_ORDERS {
            let excess = self.recent_orders.len() - MAX_RECENT_ORDERS;
            self.recent_orders.drain(..excess);
        }
    }
}

pub fn fill_key(symbol: &str, side: OrderSide) -> String {
    format!("{}:{}", canonical_symbol(symbol), side)
}

/// Realized outcome of a SELL fill, used for cooldown classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealizedPnl {
    pub pnl_usd: f64,
    pub position_closed: bool,
}

pub struct StateStore {
    backend: Box<dyn StateBackend>,
}

impl StateStore {
    pub fn new(backend: Box<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Load the document, merging defaults and running auto-reset and lazy
    /// expiry. Corruption logs and falls back to defaults; no partial
    /// recovery is attempted.
    pub async fn load(&self) -> TraderState {
        self.load_at(Utc::now()).await
    }

    pub async fn load_at(&self, now: DateTime<Utc>) -> TraderState {
        let mut state = match self.backend.read().await {
            Ok(Some(raw)) => match serde_json::from_str::<TraderState>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    error!("state document corrupt ({e}), falling back to defaults");
                    TraderState::default()
                }
            },
            Ok(None) => {
                debug!("no state document found, using defaults");
                TraderState::default()
            }
            Err(e) => {
                error!("failed to read state ({e}), falling back to defaults");
                TraderState::default()
            }
        };
        state.auto_reset(now);
        state
    }

    pub async fn save(&self, state: &TraderState) -> Result<(), StateError> {
        let payload = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::Corrupt(e.to_string()))?;
        self.backend.write(&payload).await
    }

    /// Apply a fill ledger-style. BUY accumulates at weighted-average entry
    /// price; SELL realizes proportional PnL net of proportional entry fees
    /// and exit fees, zeroing the position under the dust threshold.
    /// Returns the realized PnL for SELLs.
    pub async fn record_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        filled_size: f64,
        fill_price: f64,
        fees: f64,
        timestamp: DateTime<Utc>,
        notional_usd: Option<f64>,
    ) -> Result<Option<RealizedPnl>, StateError> {
        let mut state = self.load_at(timestamp).await;

        let size_dec = Decimal::from_f64(filled_size).unwrap_or(Decimal::ZERO);
        let price_dec = Decimal::from_f64(fill_price).unwrap_or(Decimal::ZERO);
        let fees_dec = Decimal::from_f64(fees).unwrap_or(Decimal::ZERO);
        let notional_dec = match notional_usd {
            Some(n) => Decimal::from_f64(n).unwrap_or(Decimal::ZERO),
            None => size_dec * price_dec,
        };

        if size_dec <= Decimal::ZERO || price_dec <= Decimal::ZERO || notional_dec <= Decimal::ZERO
        {
            debug!(
                "record_fill skipped for {symbol}: size={filled_size} price={fill_price} notional={notional_dec}"
            );
            return Ok(None);
        }

        let symbol = canonical_symbol(symbol);
        let mut realized: Option<RealizedPnl> = None;

        match side {
            OrderSide::Buy => {
                let managed = state.managed_positions.entry(symbol.clone()).or_default();
                if managed.entry_time.is_none() {
                    managed.entry_price = Some(fill_price);
                    managed.entry_time = Some(timestamp);
                }

                match state.positions.get_mut(&symbol) {
                    Some(pos) => {
                        let old_qty = Decimal::from_f64(pos.units).unwrap_or(Decimal::ZERO);
                        let old_price =
                            Decimal::from_f64(pos.entry_price).unwrap_or(price_dec);
                        let total_value = old_qty * old_price + notional_dec;
                        let new_qty = old_qty + size_dec;
                        let new_entry = if new_qty > Decimal::ZERO {
                            total_value / new_qty
                        } else {
                            price_dec
                        };
                        let mark_value = new_qty * price_dec;

                        pos.units = new_qty.to_f64().unwrap_or(pos.units);
                        pos.entry_price = new_entry.to_f64().unwrap_or(pos.entry_price);
                        pos.entry_value_usd = total_value.to_f64().unwrap_or(pos.entry_value_usd);
                        pos.usd = mark_value.to_f64().unwrap_or(pos.usd);
                        pos.fees_paid += fees;
                        pos.last_updated = timestamp;
                        pos.last_fill_price = fill_price;

                        debug!(
                            "added to {symbol} position: {filled_size} @ {fill_price}, new avg entry {:.8}, qty {:.8}",
                            pos.entry_price, pos.units
                        );
                    }
                    None => {
                        state.positions.insert(
                            symbol.clone(),
                            PositionLedger {
                                units: filled_size,
                                entry_price: fill_price,
                                usd: notional_dec.to_f64().unwrap_or(filled_size * fill_price),
                                entry_value_usd: notional_dec
                                    .to_f64()
                                    .unwrap_or(filled_size * fill_price),
                                fees_paid: fees,
                                entry_time: timestamp,
                                last_updated: timestamp,
                                last_fill_price: fill_price,
                            },
                        );
                        info!("opened {symbol} position: {filled_size} @ {fill_price}");
                    }
                }
            }
            OrderSide::Sell => {
                let Some(pos) = state.positions.get_mut(&symbol) else {
                    warn!("SELL without open position for {symbol} - possible gap");
                    return Ok(None);
                };
                if pos.units <= 0.0 {
                    warn!("SELL for {symbol} but tracked quantity is zero");
                    return Ok(None);
                }

                let mut sell_size = filled_size;
                if sell_size > pos.units + DUST_UNITS {
                    warn!(
                        "SELL size {sell_size} > position size {} for {symbol}, clamping",
                        pos.units
                    );
                    sell_size = pos.units;
                }

                let size_dec = Decimal::from_f64(sell_size).unwrap_or(Decimal::ZERO);
                let entry_price_dec =
                    Decimal::from_f64(pos.entry_price).unwrap_or(price_dec);
                let current_qty_dec = Decimal::from_f64(pos.units).unwrap_or(Decimal::ZERO);

                let realized_gross = (price_dec - entry_price_dec) * size_dec - fees_dec;
                let proportion_sold = if current_qty_dec > Decimal::ZERO {
                    (size_dec / current_qty_dec).to_f64().unwrap_or(1.0)
                } else {
                    1.0
                };
                let entry_fees_share = pos.fees_paid * proportion_sold;
                let total_pnl = realized_gross.to_f64().unwrap_or(0.0) - entry_fees_share;

                info!(
                    "closed {sell_size}/{} of {symbol}: entry=${:.2} exit=${fill_price:.2} pnl=${total_pnl:.2}",
                    pos.units, pos.entry_price
                );

                state.pnl_today += total_pnl;
                state.pnl_week += total_pnl;

                if total_pnl > 0.0 {
                    state.consecutive_losses = 0;
                    state.last_win_time = Some(timestamp);
                } else if total_pnl < 0.0 {
                    state.consecutive_losses += 1;
                    state.last_loss_time = Some(timestamp);
                }

                let remaining = pos.units - sell_size;
                let position_closed = remaining <= DUST_UNITS;
                if position_closed {
                    state.positions.remove(&symbol);
                    state.managed_positions.remove(&symbol);
                    info!("fully closed {symbol} position");
                } else {
                    pos.units = remaining;
                    pos.entry_value_usd = remaining * pos.entry_price;
                    pos.usd = remaining * fill_price;
                    pos.fees_paid = (pos.fees_paid * (1.0 - proportion_sold)).max(0.0);
                    pos.last_updated = timestamp;
                    pos.last_fill_price = fill_price;
                    debug!("reduced {symbol} position to {remaining} units");
                }

                realized = Some(RealizedPnl { pnl_usd: total_pnl, position_closed });
            }
        }

        let key = fill_key(&symbol, side);
        state.last_fill_times.insert(key.clone(), timestamp);
        let history = state.fill_history.entry(key).or_default();
        history.push(timestamp);
        if history.len() > MAX_FILL_HISTORY {
            let excess = history.len() - MAX_FILL_HISTORY;
            history.drain(..excess);
        }

        state.push_event(
            timestamp,
            "fill",
            serde_json::json!({
                "symbol": symbol,
                "side": side.to_string(),
                "quantity": filled_size,
                "price": fill_price,
                "fees": fees,
                "pnl": realized.map(|r| r.pnl_usd),
            }),
        );

        self.save(&state).await?;
        Ok(realized)
    }

    /// Replace position and cash snapshots with authoritative exchange data,
    /// prune managed positions no longer present, and sync the open-order
    /// cache. Idempotent for identical inputs.
    pub async fn reconcile_exchange_snapshot(
        &self,
        positions: BTreeMap<String, PositionLedger>,
        cash_balances: BTreeMap<String, f64>,
        open_orders: BTreeMap<String, OrderCacheEntry>,
        timestamp: DateTime<Utc>,
    ) -> Result<TraderState, StateError> {
        let mut state = self.load_at(timestamp).await;

        let stale: Vec<String> = state
            .managed_positions
            .keys()
            .filter(|symbol| !positions.contains_key(*symbol))
            .cloned()
            .collect();
        for symbol in stale {
            state.managed_positions.remove(&symbol);
        }

        let position_count = positions.len();
        let order_count = open_orders.len();
        state.positions = positions;
        state.cash_balances = cash_balances;
        state.last_reconcile_at = Some(timestamp);

        let (closed, created) = Self::sync_open_orders_in(&mut state, open_orders, timestamp);

        state.push_event(
            timestamp,
            "reconcile",
            serde_json::json!({
                "positions": position_count,
                "open_orders": order_count,
                "orders_closed": closed,
                "orders_seen": created,
            }),
        );

        self.save(&state).await?;
        Ok(state)
    }

    fn sync_open_orders_in(
        state: &mut TraderState,
        active: BTreeMap<String, OrderCacheEntry>,
        now: DateTime<Utc>,
    ) -> (Vec<String>, Vec<String>) {
        let mut created = Vec::new();
        for (key, mut order) in active.iter().map(|(k, v)| (k.clone(), v.clone())) {
            match state.open_orders.get(&key) {
                Some(existing) => {
                    order.first_seen = existing.first_seen;
                    order.updated_at = now;
                    state.open_orders.insert(key, order);
                }
                None => {
                    order.updated_at = now;
                    state.open_orders.insert(key.clone(), order);
                    created.push(key);
                }
            }
        }

        let gone: Vec<String> = state
            .open_orders
            .keys()
            .filter(|key| !active.contains_key(*key))
            .cloned()
            .collect();
        let mut closed = Vec::new();
        for key in gone {
            if let Some(mut entry) = state.open_orders.remove(&key) {
                entry.status = "closed".to_string();
                entry.closed_at = Some(now);
                entry.updated_at = now;
                state.recent_orders.push(entry);
                closed.push(key);
            }
        }
        state.trim_recent_orders();
        (closed, created)
    }

    pub async fn sync_open_orders(
        &self,
        active: BTreeMap<String, OrderCacheEntry>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<String>, Vec<String>), StateError> {
        let mut state = self.load_at(now).await;
        let result = Self::sync_open_orders_in(&mut state, active, now);
        self.save(&state).await?;
        Ok(result)
    }

    pub async fn record_open_order(
        &self,
        key: &str,
        entry: OrderCacheEntry,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.load_at(now).await;
        state.push_event(
            now,
            "order_opened",
            serde_json::json!({
                "order_key": key,
                "product_id": entry.product_id,
                "side": entry.side.to_string(),
                "quote_size_usd": entry.quote_size_usd,
            }),
        );
        state.open_orders.insert(key.to_string(), entry);
        self.save(&state).await
    }

    pub async fn close_order(
        &self,
        key: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StateError> {
        let mut state = self.load_at(now).await;
        let Some(mut entry) = state.open_orders.remove(key) else {
            return Ok(false);
        };
        entry.status = status.to_string();
        entry.closed_at = Some(now);
        entry.updated_at = now;
        state.recent_orders.push(entry);
        state.trim_recent_orders();
        state.push_event(
            now,
            "order_closed",
            serde_json::json!({ "order_key": key, "status": status }),
        );
        self.save(&state).await?;
        Ok(true)
    }

    pub async fn set_pending(
        &self,
        product_id: &str,
        side: OrderSide,
        client_order_id: Option<&str>,
        order_id: Option<&str>,
        notional_usd: Option<f64>,
        ttl_seconds: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        if product_id.is_empty() {
            return Ok(());
        }
        let mut state = self.load_at(now).await;

        let normalized = canonical_symbol(product_id);
        let ttl = ttl_seconds.unwrap_or(PENDING_TTL_SECONDS).max(1);
        let key = format!(
            "{normalized}:{side}:{}",
            client_order_id
                .or(order_id)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
        );

        state.pending_markers.insert(
            key,
            PendingMarker {
                base: base_currency(&normalized).to_string(),
                product_id: normalized,
                side,
                client_order_id: client_order_id.map(str::to_string),
                order_id: order_id.map(str::to_string),
                notional_usd,
                since: now,
                expires_at: now + Duration::seconds(ttl),
            },
        );

        if state.pending_markers.len() > MAX_PENDING_MARKERS {
            let mut by_age: Vec<(String, DateTime<Utc>)> = state
                .pending_markers
                .iter()
                .map(|(k, m)| (k.clone(), m.since))
                .collect();
            by_age.sort_by_key(|(_, since)| *since);
            let excess = state.pending_markers.len() - MAX_PENDING_MARKERS;
            for (key, _) in by_age.into_iter().take(excess) {
                state.pending_markers.remove(&key);
            }
        }

        self.save(&state).await
    }

    pub async fn clear_pending(
        &self,
        product_id: &str,
        side: OrderSide,
        client_order_id: Option<&str>,
        order_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.load_at(now).await;
        let normalized = canonical_symbol(product_id);
        let base = base_currency(&normalized).to_string();

        let keys: Vec<String> = state
            .pending_markers
            .iter()
            .filter(|(_, marker)| {
                if marker.side != side {
                    return false;
                }
                if marker.product_id != normalized && marker.base != base {
                    return false;
                }
                if let (Some(want), Some(have)) = (client_order_id, marker.client_order_id.as_deref())
                {
                    if want != have {
                        return false;
                    }
                }
                if let (Some(want), Some(have)) = (order_id, marker.order_id.as_deref()) {
                    if want != have {
                        return false;
                    }
                }
                true
            })
            .map(|(key, _)| key.clone())
            .collect();

        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            state.pending_markers.remove(&key);
        }
        self.save(&state).await
    }

    pub async fn has_pending(&self, product_id: &str, side: OrderSide, now: DateTime<Utc>) -> bool {
        let state = self.load_at(now).await;
        let normalized = canonical_symbol(product_id);
        let base = base_currency(&normalized);
        state.pending_markers.values().any(|marker| {
            marker.side == side && (marker.product_id == normalized || marker.base == base)
        })
    }

    pub async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<String>, StateError> {
        let mut state = self.load_at(now).await;
        let removed = state.purge_expired_pending(now);
        if !removed.is_empty() {
            self.save(&state).await?;
        }
        Ok(removed)
    }

    pub async fn is_cooldown_active(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let state = self.load_at(now).await;
        state
            .cooldowns
            .get(&canonical_symbol(symbol))
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    pub async fn get_last_fill_time(
        &self,
        product_id: &str,
        side: OrderSide,
    ) -> Option<DateTime<Utc>> {
        let state = self.load().await;
        state.last_fill_times.get(&fill_key(product_id, side)).copied()
    }

    pub async fn get_fill_count_since(
        &self,
        product_id: &str,
        side: OrderSide,
        since: DateTime<Utc>,
    ) -> usize {
        let state = self.load().await;
        state
            .fill_history
            .get(&fill_key(product_id, side))
            .map(|history| history.iter().filter(|ts| **ts >= since).count())
            .unwrap_or(0)
    }

    /// Bump trade counters and pacing stamps for one executed order.
    pub async fn record_trade_execution(
        &self,
        symbol: &str,
        side: OrderSide,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.load_at(now).await;
        state.trades_today += 1;
        state.trades_this_hour += 1;
        state.last_trade_timestamp = Some(now);
        state
            .last_trade_time_by_symbol
            .insert(canonical_symbol(symbol), now);
        state.push_event(
            now,
            "trade",
            serde_json::json!({ "symbol": canonical_symbol(symbol), "side": side.to_string() }),
        );
        self.save(&state).await
    }

    pub async fn mark_position_managed(&self, symbol: &str) -> Result<(), StateError> {
        let mut state = self.load().await;
        state
            .managed_positions
            .entry(canonical_symbol(symbol))
            .or_default();
        self.save(&state).await
    }

    /// Stamp exit targets onto a managed position after execution. Existing
    /// values are preserved when the new value is None.
    pub async fn update_managed_position_targets(
        &self,
        symbol: &str,
        stop_loss_pct: Option<f64>,
        take_profit_pct: Option<f64>,
        max_hold_hours: Option<f64>,
    ) -> Result<(), StateError> {
        let mut state = self.load().await;
        let symbol = canonical_symbol(symbol);
        let Some(managed) = state.managed_positions.get_mut(&symbol) else {
            debug!("cannot update targets for non-managed position {symbol}");
            return Ok(());
        };
        if stop_loss_pct.is_some() {
            managed.stop_loss_pct = stop_loss_pct;
        }
        if take_profit_pct.is_some() {
            managed.take_profit_pct = take_profit_pct;
        }
        if max_hold_hours.is_some() {
            managed.max_hold_hours = max_hold_hours;
        }
        self.save(&state).await
    }

    pub async fn set_zero_trigger_cycles(&self, value: u32) -> Result<(), StateError> {
        let mut state = self.load().await;
        state.zero_trigger_cycles = value;
        self.save(&state).await
    }

    pub async fn reset(&self, full: bool) -> Result<TraderState, StateError> {
        let state = if full {
            warn!("full state reset");
            TraderState::default()
        } else {
            let mut state = self.load().await;
            info!("resetting counters only");
            state.trades_today = 0;
            state.trades_this_hour = 0;
            state.pnl_today = 0.0;
            state.consecutive_losses = 0;
            state
        };
        self.save(&state).await?;
        Ok(state)
    }
}
