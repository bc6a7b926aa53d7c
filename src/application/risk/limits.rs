//! Centralized trade pacing: spacing, frequency caps, and cooldowns.
//!
//! The risk engine owns exposure and position caps; this layer owns timing.
//! Configuration is validated at construction (via `PolicyConfig::validate`)
//! and out-of-range values abort startup.

use crate::config::RiskPolicy;
use crate::domain::proposal::TradeProposal;
use crate::infrastructure::state::{StateStore, TradeOutcomeRecord};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct TimingResult {
    pub approved: bool,
    pub reason: String,
    pub violated_checks: Vec<String>,
}

impl TimingResult {
    fn approve() -> Self {
        Self { approved: true, ..Default::default() }
    }

    fn block(reason: String, check: &str) -> Self {
        Self { approved: false, reason, violated_checks: vec![check.to_string()] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOutcome {
    Win,
    Loss,
    StopLoss,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Win => "win",
            TradeOutcome::Loss => "loss",
            TradeOutcome::StopLoss => "stop_loss",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CooldownStatus {
    pub on_cooldown: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub minutes_remaining: f64,
    pub last_outcome: Option<String>,
    pub last_trade_time: Option<DateTime<Utc>>,
}

pub struct TradeLimits {
    config: RiskPolicy,
    state: Arc<StateStore>,
}

impl TradeLimits {
    pub fn new(config: RiskPolicy, state: Arc<StateStore>) -> Self {
        info!(
            "trade limits: global_spacing={}s per_symbol_spacing={}s max_per_hour={} max_per_day={} cooldowns_enabled={}",
            config.min_seconds_between_trades,
            config.per_symbol_trade_spacing_seconds,
            config.max_new_trades_per_hour,
            config.max_trades_per_day,
            config.per_symbol_cooldown_enabled
        );
        Self { config, state }
    }

    /// Batch-level timing checks: loss cooldown, frequency caps, and global
    /// spacing. Per-symbol timing is a per-proposal concern handled by
    /// `filter_by_timing`.
    pub async fn check_all(
        &self,
        proposals: &[TradeProposal],
        trades_today: u32,
        trades_this_hour: u32,
        consecutive_losses: u32,
        last_loss_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> TimingResult {
        if proposals.is_empty() {
            return TimingResult::approve();
        }

        let result = self.check_loss_cooldown(consecutive_losses, last_loss_time, now);
        if !result.approved {
            return result;
        }
        let result = self.check_frequency(trades_today, trades_this_hour);
        if !result.approved {
            return result;
        }
        self.check_global_spacing(now).await
    }

    /// Per-proposal filter used after the risk gate: drops proposals whose
    /// symbol violates cooldowns or spacing, keeping the rest.
    pub async fn filter_by_timing(
        &self,
        proposals: Vec<TradeProposal>,
        now: DateTime<Utc>,
    ) -> (Vec<TradeProposal>, BTreeMap<String, Vec<String>>) {
        let mut approved = Vec::new();
        let mut rejections: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for proposal in proposals {
            // Exits are never paced; holding a losing position because of a
            // cooldown would invert the protection.
            if proposal.is_exit() {
                approved.push(proposal);
                continue;
            }
            if self.is_symbol_on_cooldown(&proposal.symbol, now).await {
                debug!("{}: blocked by cooldown", proposal.symbol);
                rejections
                    .entry(proposal.symbol.clone())
                    .or_default()
                    .push("per_symbol_cooldown".to_string());
                continue;
            }
            if self.violates_symbol_spacing(&proposal.symbol, now).await {
                debug!(
                    "{}: blocked by spacing ({}s)",
                    proposal.symbol, self.config.per_symbol_trade_spacing_seconds
                );
                rejections
                    .entry(proposal.symbol.clone())
                    .or_default()
                    .push("per_symbol_spacing".to_string());
                continue;
            }
            approved.push(proposal);
        }

        (approved, rejections)
    }

    fn check_loss_cooldown(
        &self,
        consecutive_losses: u32,
        last_loss_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> TimingResult {
        if consecutive_losses < self.config.cooldown_after_loss_trades {
            return TimingResult::approve();
        }
        let Some(last_loss) = last_loss_time else {
            return TimingResult::approve();
        };
        let expires = last_loss + Duration::minutes(self.config.cooldown_minutes);
        if now < expires {
            let minutes_left = (expires - now).num_seconds() as f64 / 60.0;
            return TimingResult::block(
                format!(
                    "cooldown: {consecutive_losses} consecutive losses ({minutes_left:.0}min left)"
                ),
                "consecutive_loss_cooldown",
            );
        }
        TimingResult::approve()
    }

    fn check_frequency(&self, trades_today: u32, trades_this_hour: u32) -> TimingResult {
        if trades_today >= self.config.max_trades_per_day {
            return TimingResult::block(
                format!(
                    "daily trade limit reached ({trades_today}/{})",
                    self.config.max_trades_per_day
                ),
                "trade_frequency_daily",
            );
        }
        if trades_this_hour >= self.config.max_new_trades_per_hour {
            return TimingResult::block(
                format!(
                    "hourly trade limit reached ({trades_this_hour}/{})",
                    self.config.max_new_trades_per_hour
                ),
                "trade_frequency_hourly",
            );
        }
        TimingResult::approve()
    }

    async fn check_global_spacing(&self, now: DateTime<Utc>) -> TimingResult {
        if self.config.min_seconds_between_trades <= 0 {
            return TimingResult::approve();
        }
        let state = self.state.load_at(now).await;
        let Some(last_trade) = state.last_trade_timestamp else {
            return TimingResult::approve();
        };
        let elapsed = (now - last_trade).num_seconds();
        if elapsed < self.config.min_seconds_between_trades {
            let remaining = self.config.min_seconds_between_trades - elapsed;
            return TimingResult::block(
                format!(
                    "global trade spacing active ({remaining}s remaining, min {}s)",
                    self.config.min_seconds_between_trades
                ),
                "global_trade_spacing",
            );
        }
        TimingResult::approve()
    }

    pub async fn is_symbol_on_cooldown(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        if !self.config.per_symbol_cooldown_enabled {
            return false;
        }
        self.state.is_cooldown_active(symbol, now).await
    }

    async fn violates_symbol_spacing(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        if self.config.per_symbol_trade_spacing_seconds <= 0 {
            return false;
        }
        let state = self.state.load_at(now).await;
        let symbol = crate::domain::types::canonical_symbol(symbol);
        match state.last_trade_time_by_symbol.get(&symbol) {
            Some(last_trade) => {
                (now - *last_trade).num_seconds() < self.config.per_symbol_trade_spacing_seconds
            }
            None => false,
        }
    }

    /// Outcome-tiered cooldown applied on fill classification.
    pub async fn apply_cooldown(&self, symbol: &str, outcome: TradeOutcome, now: DateTime<Utc>) {
        if !self.config.per_symbol_cooldown_enabled {
            return;
        }
        let minutes = match outcome {
            TradeOutcome::StopLoss => self.config.per_symbol_cooldown_after_stop,
            TradeOutcome::Loss => self.config.per_symbol_cooldown_loss_minutes,
            TradeOutcome::Win => self.config.per_symbol_cooldown_win_minutes,
        };
        let until = now + Duration::minutes(minutes);
        let symbol = crate::domain::types::canonical_symbol(symbol);

        let mut state = self.state.load_at(now).await;
        state.cooldowns.insert(symbol.clone(), until);
        state.last_trade_result.insert(
            symbol.clone(),
            TradeOutcomeRecord {
                outcome: outcome.as_str().to_string(),
                timestamp: now,
                cooldown_until: until,
            },
        );
        if let Err(e) = self.state.save(&state).await {
            warn!("failed to persist cooldown for {symbol}: {e}");
            return;
        }
        info!("applied {minutes}min cooldown to {symbol} (outcome={})", outcome.as_str());
    }

    /// Stamp global and per-symbol pacing timestamps for an executed trade.
    pub async fn record_trade(&self, symbol: &str, now: DateTime<Utc>) {
        let mut state = self.state.load_at(now).await;
        state.last_trade_timestamp = Some(now);
        state
            .last_trade_time_by_symbol
            .insert(crate::domain::types::canonical_symbol(symbol), now);
        if let Err(e) = self.state.save(&state).await {
            warn!("failed to record trade timestamps for {symbol}: {e}");
        }
    }

    pub async fn get_cooldown_status(&self, symbol: &str, now: DateTime<Utc>) -> CooldownStatus {
        let state = self.state.load_at(now).await;
        let symbol = crate::domain::types::canonical_symbol(symbol);
        let Some(until) = state.cooldowns.get(&symbol).copied() else {
            return CooldownStatus::default();
        };
        let last_result = state.last_trade_result.get(&symbol);
        CooldownStatus {
            on_cooldown: now < until,
            cooldown_until: Some(until),
            minutes_remaining: ((until - now).num_seconds().max(0)) as f64 / 60.0,
            last_outcome: last_result.map(|r| r.outcome.clone()),
            last_trade_time: last_result.map(|r| r.timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::OrderSide;
    use crate::infrastructure::state::JsonFileBackend;
    use chrono::TimeZone;

    fn limits_with(config: RiskPolicy) -> (tempfile::TempDir, TradeLimits, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("state.json")).unwrap();
        let store = Arc::new(StateStore::new(Box::new(backend)));
        let limits = TradeLimits::new(config, store.clone());
        (dir, limits, store)
    }

    fn limits() -> (tempfile::TempDir, TradeLimits, Arc<StateStore>) {
        limits_with(RiskPolicy::default())
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, h, m, 0).unwrap()
    }

    fn buy(symbol: &str) -> TradeProposal {
        TradeProposal::new(symbol, OrderSide::Buy, 2.0, "test", 0.7, ts(12, 0))
    }

    #[tokio::test]
    async fn test_empty_batch_approves() {
        let (_dir, limits, _) = limits();
        let result = limits.check_all(&[], 0, 0, 0, None, ts(12, 0)).await;
        assert!(result.approved);
    }

    #[tokio::test]
    async fn test_consecutive_loss_cooldown_reports_remaining_minutes() {
        let (_dir, limits, _) = limits();
        let now = ts(12, 0);
        // 3 losses, last one 30 minutes ago, 60-minute cooldown
        let last_loss = now - Duration::minutes(30);
        let result = limits.check_all(&[buy("BTC-USD")], 0, 0, 3, Some(last_loss), now).await;
        assert!(!result.approved);
        assert_eq!(result.violated_checks, vec!["consecutive_loss_cooldown"]);
        assert!(result.reason.contains("30min left"));

        // Expired cooldown passes
        let stale_loss = now - Duration::minutes(90);
        let result = limits.check_all(&[buy("BTC-USD")], 0, 0, 3, Some(stale_loss), now).await;
        assert!(result.approved);
    }

    #[tokio::test]
    async fn test_frequency_limits() {
        let (_dir, limits, _) = limits();
        let now = ts(12, 0);
        let result = limits.check_all(&[buy("BTC-USD")], 120, 0, 0, None, now).await;
        assert!(!result.approved);
        assert_eq!(result.violated_checks, vec!["trade_frequency_daily"]);

        let result = limits.check_all(&[buy("BTC-USD")], 10, 5, 0, None, now).await;
        assert!(!result.approved);
        assert_eq!(result.violated_checks, vec!["trade_frequency_hourly"]);
    }

    #[tokio::test]
    async fn test_global_spacing_blocks_rapid_fire() {
        let (_dir, limits, _store) = limits();
        let now = ts(12, 0);
        limits.record_trade("BTC-USD", now).await;

        let result = limits
            .check_all(&[buy("ETH-USD")], 1, 1, 0, None, now + Duration::seconds(60))
            .await;
        assert!(!result.approved);
        assert_eq!(result.violated_checks, vec!["global_trade_spacing"]);

        let result = limits
            .check_all(&[buy("ETH-USD")], 1, 1, 0, None, now + Duration::seconds(200))
            .await;
        assert!(result.approved);
    }

    #[tokio::test]
    async fn test_per_symbol_spacing() {
        let (_dir, limits, _store) = limits();
        let now = ts(12, 0);
        limits.record_trade("BTC-USD", now).await;

        // 10 minutes later: global spacing (180s) has passed, the 900s
        // per-symbol spacing for BTC has not
        let later = now + Duration::minutes(10);
        let (approved, rejections) =
            limits.filter_by_timing(vec![buy("BTC-USD"), buy("ETH-USD")], later).await;
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].symbol, "ETH-USD");
        assert_eq!(rejections["BTC-USD"], vec!["per_symbol_spacing"]);

        // 16 minutes later both pass
        let (approved, _) =
            limits.filter_by_timing(vec![buy("BTC-USD"), buy("ETH-USD")], now + Duration::minutes(16)).await;
        assert_eq!(approved.len(), 2);
    }

    #[tokio::test]
    async fn test_outcome_tiered_cooldowns() {
        let (_dir, limits, _store) = limits();
        let now = ts(12, 0);

        limits.apply_cooldown("WIN-USD", TradeOutcome::Win, now).await;
        limits.apply_cooldown("LOSS-USD", TradeOutcome::Loss, now).await;
        limits.apply_cooldown("STOP-USD", TradeOutcome::StopLoss, now).await;

        // Win: 10 minutes
        assert!(limits.is_symbol_on_cooldown("WIN-USD", now + Duration::minutes(9)).await);
        assert!(!limits.is_symbol_on_cooldown("WIN-USD", now + Duration::minutes(11)).await);
        // Loss: 60 minutes
        assert!(limits.is_symbol_on_cooldown("LOSS-USD", now + Duration::minutes(59)).await);
        assert!(!limits.is_symbol_on_cooldown("LOSS-USD", now + Duration::minutes(61)).await);
        // Stop-loss: 120 minutes
        assert!(limits.is_symbol_on_cooldown("STOP-USD", now + Duration::minutes(119)).await);
        assert!(!limits.is_symbol_on_cooldown("STOP-USD", now + Duration::minutes(121)).await);
    }

    #[tokio::test]
    async fn test_cooldown_status_reports_outcome() {
        let (_dir, limits, _store) = limits();
        let now = ts(12, 0);
        limits.apply_cooldown("BTC-USD", TradeOutcome::StopLoss, now).await;

        let status = limits.get_cooldown_status("BTC-USD", now + Duration::minutes(30)).await;
        assert!(status.on_cooldown);
        assert_eq!(status.last_outcome.as_deref(), Some("stop_loss"));
        assert!((status.minutes_remaining - 90.0).abs() < 1.0);

        let status = limits.get_cooldown_status("NONE-USD", now).await;
        assert!(!status.on_cooldown);
    }

    #[tokio::test]
    async fn test_exits_bypass_timing_filter() {
        let (_dir, limits, _store) = limits();
        let now = ts(12, 0);
        limits.apply_cooldown("BTC-USD", TradeOutcome::Loss, now).await;

        let mut exit = TradeProposal::new("BTC-USD", OrderSide::Sell, 0.0, "exit_stop_loss", 1.0, now);
        exit.exit = Some(crate::domain::proposal::ExitDetails {
            exit_reason: "stop_loss".into(),
            entry_price: 100.0,
            current_price: 90.0,
            pnl_pct: -10.0,
            hold_hours: 4.0,
            quantity: 1.0,
            notional_usd: 90.0,
        });
        let (approved, rejections) = limits.filter_by_timing(vec![exit], now).await;
        assert_eq!(approved.len(), 1);
        assert!(rejections.is_empty());
    }

    #[tokio::test]
    async fn test_cooldowns_disabled_by_config() {
        let mut config = RiskPolicy::default();
        config.per_symbol_cooldown_enabled = false;
        let (_dir, limits, _store) = limits_with(config);
        let now = ts(12, 0);
        limits.apply_cooldown("BTC-USD", TradeOutcome::Loss, now).await;
        assert!(!limits.is_symbol_on_cooldown("BTC-USD", now + Duration::minutes(1)).await);
    }
}
