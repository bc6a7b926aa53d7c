//! Execution engine: submits approved proposals through the exchange port,
//! records pending markers and fills, and classifies rejections.

use crate::application::risk::circuit::ApiHealth;
use crate::application::risk::limits::{TradeLimits, TradeOutcome};
use crate::config::Mode;
use crate::domain::portfolio::PortfolioState;
use crate::domain::ports::ExchangePort;
use crate::domain::proposal::TradeProposal;
use crate::domain::types::{OrderOutcome, OrderRequest, OrderSide, OrderType};
use crate::infrastructure::state::{OrderCacheEntry, StateStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutedTrade {
    pub proposal: TradeProposal,
    pub outcome: OrderOutcome,
}

impl ExecutedTrade {
    pub fn filled(&self) -> bool {
        self.outcome.success && self.outcome.filled_price.is_some()
    }
}

pub struct ExecutionEngine {
    mode: Mode,
    exchange: Arc<dyn ExchangePort>,
    state: Arc<StateStore>,
    limits: Arc<TradeLimits>,
    health: Arc<ApiHealth>,
    min_trade_notional_usd: f64,
}

impl ExecutionEngine {
    pub fn new(
        mode: Mode,
        exchange: Arc<dyn ExchangePort>,
        state: Arc<StateStore>,
        limits: Arc<TradeLimits>,
        health: Arc<ApiHealth>,
        min_trade_notional_usd: f64,
    ) -> Self {
        info!("execution engine initialized (mode={mode:?})");
        Self { mode, exchange, state, limits, health, min_trade_notional_usd }
    }

    pub async fn execute(
        &self,
        proposals: Vec<TradeProposal>,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> Vec<ExecutedTrade> {
        let mut executed = Vec::new();
        for proposal in proposals {
            let trade = self.execute_one(proposal, portfolio, now).await;
            executed.push(trade);
        }
        executed
    }

    /// Default order types: maker post-only for entries, taker-style market
    /// for exits. Proposal metadata can override either.
    fn order_type_for(&self, proposal: &TradeProposal) -> OrderType {
        if let Some(override_type) = proposal.order_type_override {
            return override_type;
        }
        if proposal.is_exit() {
            OrderType::Market
        } else {
            OrderType::LimitPostOnly
        }
    }

    async fn execute_one(
        &self,
        proposal: TradeProposal,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> ExecutedTrade {
        let order_type = self.order_type_for(&proposal);
        let (quote_size_usd, base_size) = match &proposal.exit {
            Some(exit) => (exit.notional_usd, Some(exit.quantity)),
            None => {
                let requested = proposal.size_pct / 100.0 * portfolio.nav();
                let effective = if self.min_trade_notional_usd > 0.0 {
                    requested.max(self.min_trade_notional_usd)
                } else {
                    requested
                };
                (effective, None)
            }
        };

        let request = OrderRequest {
            symbol: proposal.symbol.clone(),
            side: proposal.side,
            quote_size_usd,
            base_size,
            order_type,
            client_order_id: Uuid::new_v4().to_string(),
        };

        if self.mode == Mode::DryRun {
            info!(
                "DRY_RUN: skipping placement of {} {} ${quote_size_usd:.2}",
                request.side, request.symbol
            );
            return ExecutedTrade {
                proposal,
                outcome: OrderOutcome {
                    success: false,
                    status: "DRY_RUN".to_string(),
                    client_order_id: Some(request.client_order_id),
                    ..Default::default()
                },
            };
        }

        if let Err(e) = self
            .state
            .set_pending(
                &request.symbol,
                request.side,
                Some(&request.client_order_id),
                None,
                Some(quote_size_usd),
                None,
                now,
            )
            .await
        {
            warn!("failed to set pending marker for {}: {e}", request.symbol);
        }

        let outcome = match self.exchange.place_order(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_rate_limit() {
                    self.health.record_rate_limit(now);
                } else {
                    self.health.record_api_error();
                }
                error!("order placement failed for {}: {e}", request.symbol);
                self.clear_pending(&request, now).await;
                return ExecutedTrade {
                    proposal,
                    outcome: OrderOutcome {
                        success: false,
                        status: "ERROR".to_string(),
                        client_order_id: Some(request.client_order_id),
                        error_kind: Some(e.to_string()),
                        ..Default::default()
                    },
                };
            }
        };
        self.health.record_api_success(now);

        if outcome.success && outcome.filled_price.is_some() {
            self.record_synchronous_fill(&proposal, &request, &outcome, now).await;
            self.clear_pending(&request, now).await;
        } else if outcome.success {
            // Resting limit order: cache it, reconciliation will reap it
            let key = outcome
                .order_id
                .clone()
                .unwrap_or_else(|| request.client_order_id.clone());
            let entry = OrderCacheEntry {
                product_id: request.symbol.clone(),
                side: request.side,
                quote_size_usd,
                status: "open".to_string(),
                order_id: outcome.order_id.clone(),
                client_order_id: Some(request.client_order_id.clone()),
                first_seen: now,
                updated_at: now,
                closed_at: None,
            };
            if let Err(e) = self.state.record_open_order(&key, entry, now).await {
                warn!("failed to cache open order {key}: {e}");
            }
            info!("order resting: {} {} ${quote_size_usd:.2}", request.side, request.symbol);
        } else {
            warn!(
                "order rejected for {} {}: {}",
                request.side,
                request.symbol,
                outcome.error_kind.as_deref().unwrap_or("unknown")
            );
            self.clear_pending(&request, now).await;
        }

        ExecutedTrade { proposal, outcome }
    }

    async fn record_synchronous_fill(
        &self,
        proposal: &TradeProposal,
        request: &OrderRequest,
        outcome: &OrderOutcome,
        now: DateTime<Utc>,
    ) {
        let price = outcome.filled_price.unwrap_or(0.0);
        let size = outcome.filled_size.unwrap_or(0.0);
        let fees = outcome.fees.unwrap_or(0.0);

        let realized = match self
            .state
            .record_fill(&request.symbol, request.side, size, price, fees, now, None)
            .await
        {
            Ok(realized) => realized,
            Err(e) => {
                error!("failed to record fill for {}: {e}", request.symbol);
                None
            }
        };

        if let Err(e) = self
            .state
            .record_trade_execution(&request.symbol, request.side, now)
            .await
        {
            warn!("failed to bump trade counters for {}: {e}", request.symbol);
        }

        match request.side {
            OrderSide::Buy => {
                // Stamp exit targets from the proposal onto the managed position
                if let Err(e) = self
                    .state
                    .update_managed_position_targets(
                        &request.symbol,
                        proposal.stop_loss_pct,
                        proposal.take_profit_pct,
                        proposal.max_hold_hours,
                    )
                    .await
                {
                    warn!("failed to stamp exit targets for {}: {e}", request.symbol);
                }
            }
            OrderSide::Sell => {
                if let Some(realized) = realized {
                    let outcome_kind = if proposal
                        .exit
                        .as_ref()
                        .map(|e| e.exit_reason == "stop_loss")
                        .unwrap_or(false)
                    {
                        TradeOutcome::StopLoss
                    } else if realized.pnl_usd > 0.0 {
                        TradeOutcome::Win
                    } else {
                        TradeOutcome::Loss
                    };
                    self.limits.apply_cooldown(&request.symbol, outcome_kind, now).await;
                }
            }
        }

        info!(
            "fill recorded: {} {} {size:.8} @ {price:.2} (fees {fees:.2})",
            request.side, request.symbol
        );
    }

    async fn clear_pending(&self, request: &OrderRequest, now: DateTime<Utc>) {
        if let Err(e) = self
            .state
            .clear_pending(
                &request.symbol,
                request.side,
                Some(&request.client_order_id),
                None,
                now,
            )
            .await
        {
            debug!("failed to clear pending marker for {}: {e}", request.symbol);
        }
    }

    /// Cancel every working order in the cache. Invoked on kill-switch
    /// activation and graceful shutdown.
    pub async fn cancel_working_orders(&self, now: DateTime<Utc>) -> usize {
        let state = self.state.load_at(now).await;
        let order_ids: Vec<String> = state
            .open_orders
            .values()
            .filter_map(|entry| entry.order_id.clone())
            .collect();
        if order_ids.is_empty() {
            return 0;
        }
        match self.exchange.cancel_orders(&order_ids).await {
            Ok(()) => {
                for key in state.open_orders.keys().cloned().collect::<Vec<_>>() {
                    if let Err(e) = self.state.close_order(&key, "canceled", now).await {
                        warn!("failed to close canceled order {key}: {e}");
                    }
                }
                info!("canceled {} working orders", order_ids.len());
                order_ids.len()
            }
            Err(e) => {
                error!("failed to cancel working orders: {e}");
                self.health.record_api_error();
                0
            }
        }
    }
}
