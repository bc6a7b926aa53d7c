//! The ordered risk gate. Fail-closed: systemic failures block the whole
//! batch with a single reason; per-proposal failures filter proposal by
//! proposal, recording the violated check names per symbol.
//!
//! No proposal survives if, after hypothetical fill, any per-symbol or global
//! exposure cap would be violated. Pending BUYs count toward that
//! hypothetical.

use crate::application::risk::circuit::{ApiHealth, CircuitBreakers};
use crate::application::risk::limits::TradeLimits;
use crate::application::universe::UniverseBuilder;
use crate::config::PolicyConfig;
use crate::domain::portfolio::PortfolioState;
use crate::domain::ports::ExchangePort;
use crate::domain::proposal::TradeProposal;
use crate::domain::regime::Regime;
use crate::domain::types::{canonical_symbol, OrderSide};
use crate::infrastructure::alerting::{AlertSeverity, AlertService};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RiskCheckResult {
    pub approved: bool,
    pub reason: Option<String>,
    pub violated_checks: Vec<String>,
    pub approved_proposals: Vec<TradeProposal>,
    pub proposal_rejections: BTreeMap<String, Vec<String>>,
}

impl RiskCheckResult {
    fn approve(proposals: Vec<TradeProposal>, rejections: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            approved: true,
            reason: None,
            violated_checks: Vec::new(),
            approved_proposals: proposals,
            proposal_rejections: rejections,
        }
    }

    fn block(reason: String, check: &str, rejections: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            approved: false,
            reason: Some(reason),
            violated_checks: vec![check.to_string()],
            approved_proposals: Vec::new(),
            proposal_rejections: rejections,
        }
    }
}

fn merge_rejection(
    rejections: &mut BTreeMap<String, Vec<String>>,
    symbol: &str,
    reason: impl Into<String>,
) {
    let bucket = rejections.entry(symbol.to_string()).or_default();
    let reason = reason.into();
    if !bucket.contains(&reason) {
        bucket.push(reason);
    }
}

pub struct RiskEngine {
    policy: PolicyConfig,
    universe: Arc<UniverseBuilder>,
    exchange: Arc<dyn ExchangePort>,
    limits: Arc<TradeLimits>,
    alerts: Arc<AlertService>,
    pub health: Arc<ApiHealth>,
}

impl RiskEngine {
    pub fn new(
        policy: PolicyConfig,
        universe: Arc<UniverseBuilder>,
        exchange: Arc<dyn ExchangePort>,
        limits: Arc<TradeLimits>,
        alerts: Arc<AlertService>,
        health: Arc<ApiHealth>,
    ) -> Self {
        info!("risk engine initialized with policy constraints and circuit breakers");
        Self { policy, universe, exchange, limits, alerts, health }
    }

    pub async fn check_all(
        &self,
        proposals: Vec<TradeProposal>,
        portfolio: &PortfolioState,
        regime: Regime,
    ) -> RiskCheckResult {
        info!("running risk checks on {} proposals (regime={regime})", proposals.len());
        let now = portfolio.current_time;
        let mut rejections: BTreeMap<String, Vec<String>> = BTreeMap::new();

        if proposals.is_empty() {
            return RiskCheckResult::approve(Vec::new(), rejections);
        }

        // Circuit breakers run before anything else
        let breakers = CircuitBreakers {
            config: &self.policy.circuit_breakers,
            health: &self.health,
        };
        if let Some(trip) = breakers.check(self.exchange.as_ref(), regime, now).await {
            return RiskCheckResult::block(trip.reason, trip.check, rejections);
        }

        // Exchange product status (fail closed on error)
        let proposals = self.filter_degraded_products(proposals, &mut rejections).await;
        if proposals.is_empty() {
            return RiskCheckResult::block(
                "all proposals filtered by exchange product status restrictions".to_string(),
                "exchange_product_status",
                rejections,
            );
        }

        if let Some(result) = self.check_kill_switch(now, rejections.clone()).await {
            return result;
        }
        if let Some(result) = self.check_daily_stop(portfolio, rejections.clone()).await {
            return result;
        }
        if let Some(result) = self.check_weekly_stop(portfolio, rejections.clone()).await {
            return result;
        }
        if let Some(result) = self.check_max_drawdown(portfolio, rejections.clone()).await {
            return result;
        }
        if let Some(result) = self.check_global_at_risk(&proposals, portfolio, rejections.clone())
        {
            return result;
        }
        if let Some(result) = self.check_trade_frequency(portfolio, rejections.clone()) {
            return result;
        }
        if let Some(result) = self.check_loss_cooldown(portfolio, now, rejections.clone()) {
            return result;
        }

        let proposals =
            match self.enforce_max_open_positions(proposals, portfolio, &mut rejections) {
                Ok(proposals) => proposals,
                Err(result) => return result,
            };

        // Per-symbol cooldowns (delegated to trade limits)
        let mut remaining = Vec::new();
        for proposal in proposals {
            if !proposal.is_exit()
                && self.limits.is_symbol_on_cooldown(&proposal.symbol, now).await
            {
                info!("filtered {}: per-symbol cooldown active", proposal.symbol);
                merge_rejection(&mut rejections, &proposal.symbol, "per_symbol_cooldown");
            } else {
                remaining.push(proposal);
            }
        }
        if remaining.is_empty() {
            return RiskCheckResult::block(
                "all proposals filtered by per-symbol cooldowns".to_string(),
                "per_symbol_cooldown",
                rejections,
            );
        }

        // Per-proposal sizing
        let mut sized = Vec::new();
        let mut violated = Vec::new();
        for proposal in remaining {
            match self.check_position_size(proposal, portfolio, regime) {
                Ok(proposal) => sized.push(proposal),
                Err((symbol, reasons)) => {
                    for reason in &reasons {
                        merge_rejection(&mut rejections, &symbol, reason.clone());
                    }
                    violated.extend(reasons);
                    debug!("rejected {symbol} on sizing");
                }
            }
        }
        if sized.is_empty() {
            return RiskCheckResult {
                approved: false,
                reason: Some("all proposals violated risk constraints".to_string()),
                violated_checks: violated,
                approved_proposals: Vec::new(),
                proposal_rejections: rejections,
            };
        }

        // Cluster / theme caps
        let approved = self.check_cluster_limits(sized, portfolio, &mut rejections);
        if approved.is_empty() {
            return RiskCheckResult::block(
                "all proposals would violate theme/cluster limits".to_string(),
                "cluster_limit",
                rejections,
            );
        }

        info!("risk checks passed: {} proposals approved", approved.len());
        RiskCheckResult::approve(approved, rejections)
    }

    /// Products flagged POST_ONLY / LIMIT_ONLY / CANCEL_ONLY / OFFLINE (or
    /// whose metadata cannot be fetched) are dropped from the batch.
    async fn filter_degraded_products(
        &self,
        proposals: Vec<TradeProposal>,
        rejections: &mut BTreeMap<String, Vec<String>>,
    ) -> Vec<TradeProposal> {
        if !self.policy.circuit_breakers.check_product_status {
            return proposals;
        }
        let mut kept = Vec::new();
        for proposal in proposals {
            match self.exchange.get_product_metadata(&proposal.symbol).await {
                Ok(metadata) if metadata.status.is_tradeable() => kept.push(proposal),
                Ok(metadata) => {
                    warn!("blocking {}: exchange status={}", proposal.symbol, metadata.status);
                    merge_rejection(rejections, &proposal.symbol, "exchange_product_status");
                }
                Err(e) => {
                    error!("error checking product status for {}: {e}", proposal.symbol);
                    merge_rejection(rejections, &proposal.symbol, "exchange_product_status");
                }
            }
        }
        kept
    }

    async fn check_kill_switch(
        &self,
        now: DateTime<Utc>,
        rejections: BTreeMap<String, Vec<String>>,
    ) -> Option<RiskCheckResult> {
        let path = std::path::Path::new(&self.policy.governance.kill_switch_file);
        if !path.exists() {
            return None;
        }
        error!("KILL SWITCH ACTIVATED - all trading halted");
        self.alerts
            .notify(
                AlertSeverity::Critical,
                "Kill switch activated",
                &format!("trading halted: {} detected", path.display()),
                serde_json::json!({
                    "action": "all_trading_halted",
                    "timestamp": now.to_rfc3339(),
                }),
            )
            .await;
        Some(RiskCheckResult::block(
            "kill switch file exists - trading halted".to_string(),
            "kill_switch",
            rejections,
        ))
    }

    async fn check_daily_stop(
        &self,
        portfolio: &PortfolioState,
        rejections: BTreeMap<String, Vec<String>>,
    ) -> Option<RiskCheckResult> {
        let limit = self.policy.risk.daily_stop_pnl_pct.abs();
        if portfolio.daily_pnl_pct > -limit {
            return None;
        }
        error!(
            "DAILY STOP LOSS HIT: {:.2}% loss (limit: -{limit}%) - no new trades",
            portfolio.daily_pnl_pct
        );
        self.alerts
            .notify(
                AlertSeverity::Critical,
                "Daily stop loss triggered",
                &format!("daily PnL breached -{limit}% threshold, new trades blocked"),
                serde_json::json!({
                    "daily_pnl_pct": portfolio.daily_pnl_pct,
                    "threshold": -limit,
                    "nav": portfolio.nav(),
                }),
            )
            .await;
        Some(RiskCheckResult::block(
            format!("daily stop loss hit: {:.2}% loss", portfolio.daily_pnl_pct),
            "daily_stop_loss",
            rejections,
        ))
    }

    async fn check_weekly_stop(
        &self,
        portfolio: &PortfolioState,
        rejections: BTreeMap<String, Vec<String>>,
    ) -> Option<RiskCheckResult> {
        let limit = self.policy.risk.weekly_stop_pnl_pct.abs();
        if portfolio.weekly_pnl_pct > -limit {
            return None;
        }
        error!(
            "WEEKLY STOP LOSS HIT: {:.2}% loss (limit: -{limit}%)",
            portfolio.weekly_pnl_pct
        );
        self.alerts
            .notify(
                AlertSeverity::Critical,
                "Weekly stop loss triggered",
                &format!("weekly PnL breached -{limit}% threshold"),
                serde_json::json!({
                    "weekly_pnl_pct": portfolio.weekly_pnl_pct,
                    "threshold": -limit,
                    "nav": portfolio.nav(),
                }),
            )
            .await;
        Some(RiskCheckResult::block(
            format!("weekly stop loss hit: {:.2}% loss", portfolio.weekly_pnl_pct),
            "weekly_stop_loss",
            rejections,
        ))
    }

    async fn check_max_drawdown(
        &self,
        portfolio: &PortfolioState,
        rejections: BTreeMap<String, Vec<String>>,
    ) -> Option<RiskCheckResult> {
        let limit = self.policy.risk.max_drawdown_pct;
        if portfolio.max_drawdown_pct < limit {
            return None;
        }
        error!(
            "MAX DRAWDOWN EXCEEDED: {:.2}% (limit: {limit}%)",
            portfolio.max_drawdown_pct
        );
        self.alerts
            .notify(
                AlertSeverity::Critical,
                "Max drawdown breached",
                &format!("drawdown exceeded {limit}% threshold"),
                serde_json::json!({
                    "max_drawdown_pct": portfolio.max_drawdown_pct,
                    "threshold": limit,
                    "nav": portfolio.nav(),
                }),
            )
            .await;
        Some(RiskCheckResult::block(
            format!("max drawdown {:.2}% exceeds limit", portfolio.max_drawdown_pct),
            "max_drawdown",
            rejections,
        ))
    }

    /// Current exposure + pending buys + hypothetically filled proposed buys
    /// must stay inside the global cap.
    fn check_global_at_risk(
        &self,
        proposals: &[TradeProposal],
        portfolio: &PortfolioState,
        rejections: BTreeMap<String, Vec<String>>,
    ) -> Option<RiskCheckResult> {
        let risk = &self.policy.risk;
        let cap = risk.max_total_at_risk_pct;

        let managed_pct = portfolio.pct_of_nav(portfolio.managed_exposure_usd());
        let external_pct = portfolio.pct_of_nav(portfolio.external_exposure_usd());
        let counted_external_pct = if risk.count_external_positions {
            (external_pct - risk.external_exposure_buffer_pct).max(0.0)
        } else {
            if external_pct > 0.0 {
                debug!(
                    "ignoring {external_pct:.2}% external exposure (count_external_positions=false)"
                );
            }
            0.0
        };
        let pending_buy_pct =
            portfolio.pct_of_nav(portfolio.pending_notional_usd(OrderSide::Buy, None));

        let nav = portfolio.nav();
        let mut proposed_buy_pct = 0.0;
        for proposal in proposals {
            if !proposal.is_buy() || nav <= 0.0 {
                continue;
            }
            let requested_usd = proposal.size_pct.max(0.0) / 100.0 * nav;
            let effective_usd = if risk.min_trade_notional_usd > 0.0 {
                requested_usd.max(risk.min_trade_notional_usd)
            } else {
                requested_usd
            };
            proposed_buy_pct += portfolio.pct_of_nav(effective_usd);
        }

        let total = managed_pct + counted_external_pct + pending_buy_pct + proposed_buy_pct;
        if total > cap {
            error!(
                "total at-risk would exceed limit: {total:.1}% > {cap:.1}% (managed: {managed_pct:.1}%, external_counted: {counted_external_pct:.1}%, pending buys: {pending_buy_pct:.1}%, proposed buys: {proposed_buy_pct:.1}%)"
            );
            return Some(RiskCheckResult::block(
                format!("total at-risk {total:.1}% exceeds cap of {cap:.1}%"),
                "max_total_at_risk_pct",
                rejections,
            ));
        }
        debug!("global at-risk check passed: {total:.1}%/{cap:.1}%");
        None
    }

    fn check_trade_frequency(
        &self,
        portfolio: &PortfolioState,
        rejections: BTreeMap<String, Vec<String>>,
    ) -> Option<RiskCheckResult> {
        let risk = &self.policy.risk;
        if portfolio.trades_today >= risk.max_trades_per_day {
            return Some(RiskCheckResult::block(
                format!(
                    "daily trade limit reached ({}/{})",
                    portfolio.trades_today, risk.max_trades_per_day
                ),
                "trade_frequency_daily",
                rejections,
            ));
        }
        if portfolio.trades_this_hour >= risk.max_new_trades_per_hour {
            return Some(RiskCheckResult::block(
                format!(
                    "hourly trade limit reached ({}/{})",
                    portfolio.trades_this_hour, risk.max_new_trades_per_hour
                ),
                "trade_frequency_hourly",
                rejections,
            ));
        }
        None
    }

    fn check_loss_cooldown(
        &self,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
        rejections: BTreeMap<String, Vec<String>>,
    ) -> Option<RiskCheckResult> {
        let risk = &self.policy.risk;
        if portfolio.consecutive_losses < risk.cooldown_after_loss_trades {
            return None;
        }
        let last_loss = portfolio.last_loss_time?;
        let expires = last_loss + Duration::minutes(risk.cooldown_minutes);
        if now >= expires {
            info!("cooldown period expired at {expires}, resuming trading");
            return None;
        }
        let minutes_left = (expires - now).num_seconds() as f64 / 60.0;
        warn!(
            "cooldown active: {} consecutive losses, {minutes_left:.0} minutes remaining",
            portfolio.consecutive_losses
        );
        Some(RiskCheckResult::block(
            format!(
                "cooldown: {} consecutive losses ({minutes_left:.0}min left)",
                portfolio.consecutive_losses
            ),
            "consecutive_loss_cooldown",
            rejections,
        ))
    }

    /// Occupancy counts held positions plus pending new BUYs. When capacity is
    /// insufficient, new-symbol proposals are ranked by (confidence desc, tier
    /// asc, original order) and the top survivors keep their slots.
    fn enforce_max_open_positions(
        &self,
        proposals: Vec<TradeProposal>,
        portfolio: &PortfolioState,
        rejections: &mut BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<TradeProposal>, RiskCheckResult> {
        let risk = &self.policy.risk;
        let count_threshold = risk
            .dust_threshold_usd
            .max(risk.min_trade_notional_usd * 0.25)
            .max(1e-6);

        let mut held: BTreeSet<String> = BTreeSet::new();
        let mut existing: BTreeSet<String> = BTreeSet::new();
        for (symbol, position) in &portfolio.open_positions {
            let normalized = canonical_symbol(symbol);
            existing.insert(normalized.clone());
            if position.usd + 1e-9 >= count_threshold {
                held.insert(normalized);
            }
        }

        let mut pending_new: BTreeSet<String> = BTreeSet::new();
        if risk.count_open_orders_in_cap {
            for (symbol, notional) in &portfolio.pending_orders.buy {
                if *notional + 1e-9 < count_threshold {
                    continue;
                }
                pending_new.insert(canonical_symbol(symbol));
            }
        }

        let occupied: BTreeSet<String> = held.union(&pending_new).cloned().collect();
        let mut available = risk.max_open_positions.saturating_sub(occupied.len());
        if let Some(max_new) = risk.max_new_positions_per_cycle {
            available = available.min(max_new);
        }

        let mut approved = Vec::new();
        let mut new_candidates: Vec<(usize, TradeProposal)> = Vec::new();
        let mut dropped = 0usize;

        for (index, proposal) in proposals.into_iter().enumerate() {
            if proposal.side != OrderSide::Buy {
                approved.push(proposal);
                continue;
            }
            let symbol = canonical_symbol(&proposal.symbol);
            if existing.contains(&symbol) {
                if risk.allow_adds_when_over_cap {
                    approved.push(proposal);
                } else if available > 0 {
                    available -= 1;
                    approved.push(proposal);
                } else {
                    merge_rejection(rejections, &proposal.symbol, "adds_blocked_when_over_cap");
                    dropped += 1;
                }
            } else {
                new_candidates.push((index, proposal));
            }
        }

        if !new_candidates.is_empty() {
            new_candidates.sort_by(|(ia, a), (ib, b)| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        let tier_a = a.tier.map(|t| t.rank()).unwrap_or(99);
                        let tier_b = b.tier.map(|t| t.rank()).unwrap_or(99);
                        tier_a.cmp(&tier_b)
                    })
                    .then_with(|| ia.cmp(ib))
            });

            let mut active = occupied.clone();
            for (_, proposal) in new_candidates {
                let symbol = canonical_symbol(&proposal.symbol);
                if available > 0 && !active.contains(&symbol) {
                    available -= 1;
                    active.insert(symbol);
                    approved.push(proposal);
                } else {
                    merge_rejection(rejections, &proposal.symbol, "max_open_positions");
                    dropped += 1;
                }
            }
        }

        if approved.is_empty() {
            warn!(
                "max open positions enforcement dropped all proposals (occupied={}/{})",
                occupied.len(),
                risk.max_open_positions
            );
            return Err(RiskCheckResult::block(
                "max open positions filter dropped all proposals".to_string(),
                "max_open_positions",
                rejections.clone(),
            ));
        }
        if dropped > 0 {
            info!(
                "max open positions enforced: trimmed {dropped} proposals (occupied={}/{})",
                occupied.len(),
                risk.max_open_positions
            );
        }
        Ok(approved)
    }

    /// Per-proposal sizing. Exits carry explicit quantity and bypass this
    /// stage. BUY sizing counts existing position plus pending buys toward the
    /// regime-adjusted per-symbol cap; an optional resize adapter downsizes to
    /// fit before rejecting outright.
    fn check_position_size(
        &self,
        mut proposal: TradeProposal,
        portfolio: &PortfolioState,
        regime: Regime,
    ) -> Result<TradeProposal, (String, Vec<String>)> {
        if proposal.is_exit() {
            return Ok(proposal);
        }

        let risk = &self.policy.risk;
        let sizing = &self.policy.position_sizing;
        let max_pos_pct =
            risk.max_position_size_pct * self.policy.regime.position_size_multiplier(regime);
        let min_pos_pct = risk.min_position_size_pct;

        let existing_usd = portfolio.position_usd(&proposal.symbol);
        let pending_buy_usd =
            portfolio.pending_notional_usd(OrderSide::Buy, Some(&proposal.symbol));
        let existing_exposure_pct = portfolio.pct_of_nav(existing_usd + pending_buy_usd);

        let mut violations: Vec<String> = Vec::new();
        let mut resizable_overage = false;

        match proposal.side {
            OrderSide::Buy => {
                let combined = existing_exposure_pct + proposal.size_pct;
                if combined > max_pos_pct {
                    violations.push(format!(
                        "position_size_with_pending ({combined:.1}% > {max_pos_pct:.1}% including pending buys)"
                    ));
                    resizable_overage = true;
                }
            }
            OrderSide::Sell => {
                if proposal.size_pct > max_pos_pct {
                    violations.push(format!(
                        "position_size_too_large ({:.1}% > {max_pos_pct:.1}%)",
                        proposal.size_pct
                    ));
                }
            }
        }

        if proposal.size_pct < min_pos_pct {
            violations.push(format!(
                "position_size_too_small ({:.1}% < {min_pos_pct:.1}%)",
                proposal.size_pct
            ));
        }

        let is_buy = proposal.side == OrderSide::Buy;
        if existing_usd > 0.0
            && !sizing.allow_pyramiding
            && !(is_buy && risk.allow_adds_when_over_cap && pending_buy_usd <= 0.0)
        {
            violations.push(format!("already_have_position ({})", proposal.symbol));
        }
        if !sizing.allow_pyramiding && pending_buy_usd > 0.0 && is_buy {
            violations.push(format!("pending_buy_exists ({})", proposal.symbol));
        }

        // Resize adapter: only a pure size-cap overage is recoverable
        if risk.resize_to_fit && resizable_overage && violations.len() == 1 && is_buy {
            let headroom = max_pos_pct - existing_exposure_pct;
            let nav = portfolio.nav();
            let min_notional_pct =
                if nav > 0.0 { risk.min_trade_notional_usd / nav * 100.0 } else { 0.0 };
            if headroom >= min_pos_pct && headroom * nav / 100.0 >= risk.min_trade_notional_usd {
                info!(
                    "resized {} from {:.2}% to {headroom:.2}% to fit per-symbol cap",
                    proposal.symbol, proposal.size_pct
                );
                proposal.size_pct = headroom;
                proposal.add_tag("risk_degraded");
                return Ok(proposal);
            }
            if risk.allow_min_bump
                && min_notional_pct > 0.0
                && min_notional_pct <= max_pos_pct
                && existing_exposure_pct + min_notional_pct <= max_pos_pct
            {
                info!(
                    "bumped {} to min-notional floor {:.2}%",
                    proposal.symbol, min_notional_pct
                );
                proposal.size_pct = min_notional_pct;
                proposal.add_tag("risk_min_bump");
                return Ok(proposal);
            }
        }

        if violations.is_empty() {
            Ok(proposal)
        } else {
            Err((proposal.symbol, violations))
        }
    }

    /// Sum per-cluster exposure across open positions + pending buys +
    /// already-approved proposals; reject those exceeding the theme cap.
    fn check_cluster_limits(
        &self,
        proposals: Vec<TradeProposal>,
        portfolio: &PortfolioState,
        rejections: &mut BTreeMap<String, Vec<String>>,
    ) -> Vec<TradeProposal> {
        let caps = &self.policy.risk.max_per_theme_pct;
        if caps.is_empty() {
            return proposals;
        }

        let mut exposure: BTreeMap<String, f64> = BTreeMap::new();
        for symbol in portfolio.open_positions.keys() {
            if let Some(cluster) = self.universe.cluster_of(symbol) {
                *exposure.entry(cluster).or_insert(0.0) +=
                    portfolio.pct_of_nav(portfolio.position_usd(symbol));
            }
        }
        for (symbol, notional) in &portfolio.pending_orders.buy {
            let lookup = canonical_symbol(symbol);
            if let Some(cluster) = self.universe.cluster_of(&lookup) {
                *exposure.entry(cluster).or_insert(0.0) += portfolio.pct_of_nav(*notional);
            }
        }
        debug!("current cluster exposure: {exposure:?}");

        let mut approved = Vec::new();
        for proposal in proposals {
            if !proposal.is_buy() {
                approved.push(proposal);
                continue;
            }
            let Some(cluster) = self.universe.cluster_of(&proposal.symbol) else {
                approved.push(proposal);
                continue;
            };
            let Some(cap) = caps.get(&cluster) else {
                approved.push(proposal);
                continue;
            };
            let current = exposure.get(&cluster).copied().unwrap_or(0.0);
            let next = current + proposal.size_pct;
            if next > *cap {
                warn!(
                    "rejected {}: {cluster} theme limit violated ({next:.1}% > {cap:.1}%)",
                    proposal.symbol
                );
                merge_rejection(rejections, &proposal.symbol, "cluster_limit");
                continue;
            }
            exposure.insert(cluster, next);
            approved.push(proposal);
        }
        approved
    }
}
