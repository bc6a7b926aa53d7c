//! The per-cycle orchestrator: reconcile, regime, universe, triggers, exits
//! and entries, risk gate, pacing, execution, state update. One cycle runs to
//! completion before the next tick; an overrunning cycle skips ticks rather
//! than queueing them.

use crate::application::execution::ExecutionEngine;
use crate::application::position_manager::PositionManager;
use crate::application::reconcile::Reconciler;
use crate::application::risk::engine::RiskEngine;
use crate::application::risk::limits::TradeLimits;
use crate::application::strategies::{StrategyContext, StrategyRegistry};
use crate::application::triggers::TriggerEngine;
use crate::application::universe::UniverseBuilder;
use crate::config::Config;
use crate::domain::regime::{Regime, RegimeDetector, RegimeSignal};
use crate::domain::ports::ExchangePort;
use crate::domain::proposal::TradeProposal;
use crate::domain::triggers::TriggerKind;
use crate::infrastructure::alerting::AlertService;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::state::StateStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Executed,
    NoTrade,
    NoOpportunities,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub status: CycleStatus,
    pub regime: Option<Regime>,
    pub no_trade_reason: Option<String>,
    pub trigger_count: usize,
    pub proposal_count: usize,
    pub approved_count: usize,
    pub executed_count: usize,
    pub rejections: BTreeMap<String, Vec<String>>,
    pub duration_ms: u64,
}

impl CycleRecord {
    fn no_trade(cycle_number: u64, regime: Option<Regime>, reason: &str, started: Instant) -> Self {
        Self {
            cycle_number,
            status: CycleStatus::NoTrade,
            regime,
            no_trade_reason: Some(reason.to_string()),
            trigger_count: 0,
            proposal_count: 0,
            approved_count: 0,
            executed_count: 0,
            rejections: BTreeMap::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

pub struct CyclePipeline {
    config: Config,
    exchange: Arc<dyn ExchangePort>,
    state: Arc<StateStore>,
    reconciler: Reconciler,
    regime_detector: RegimeDetector,
    universe: Arc<UniverseBuilder>,
    triggers: TriggerEngine,
    registry: StrategyRegistry,
    position_manager: PositionManager,
    risk_engine: RiskEngine,
    limits: Arc<TradeLimits>,
    execution: ExecutionEngine,
    alerts: Arc<AlertService>,
    metrics: Metrics,
}

impl CyclePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        exchange: Arc<dyn ExchangePort>,
        state: Arc<StateStore>,
        reconciler: Reconciler,
        universe: Arc<UniverseBuilder>,
        triggers: TriggerEngine,
        registry: StrategyRegistry,
        position_manager: PositionManager,
        risk_engine: RiskEngine,
        limits: Arc<TradeLimits>,
        execution: ExecutionEngine,
        alerts: Arc<AlertService>,
        metrics: Metrics,
    ) -> Self {
        let regime_detector = RegimeDetector::new(config.app.regime_lookback_days);
        Self {
            config,
            exchange,
            state,
            reconciler,
            regime_detector,
            universe,
            triggers,
            registry,
            position_manager,
            risk_engine,
            limits,
            execution,
            alerts,
            metrics,
        }
    }

    /// Fixed-cadence loop. A shutdown signal follows the kill-switch path
    /// (cancel working orders) without the alert.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.app.cycle_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycle_number: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycle_number += 1;
                    let record = self.run_cycle(cycle_number, Utc::now()).await;
                    self.audit(&record);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown requested, canceling working orders");
                        self.execution.cancel_working_orders(Utc::now()).await;
                        return;
                    }
                }
            }
        }
    }

    pub async fn run_cycle(&self, cycle_number: u64, now: DateTime<Utc>) -> CycleRecord {
        let started = Instant::now();
        info!("=== cycle {cycle_number} ===");
        self.metrics.cycles_total.inc();

        // Kill-switch activation is honored before spending time on market
        // data: stop proposing, cancel working orders, keep refusing.
        if self.config.kill_switch_path().exists() {
            warn!("kill switch detected at cycle start");
            let canceled = self.execution.cancel_working_orders(now).await;
            self.alerts
                .notify(
                    crate::infrastructure::alerting::AlertSeverity::Critical,
                    "Kill switch activated",
                    "trading halted; working orders canceled",
                    serde_json::json!({
                        "action": "all_trading_halted",
                        "orders_canceled": canceled,
                        "timestamp": now.to_rfc3339(),
                    }),
                )
                .await;
            self.metrics.cycles_no_trade.inc();
            return CycleRecord::no_trade(cycle_number, None, "kill_switch", started);
        }

        let report = match self.reconciler.reconcile(now).await {
            Ok(report) => report,
            Err(e) => {
                error!("reconcile failed: {e}");
                self.metrics.cycles_no_trade.inc();
                return CycleRecord::no_trade(cycle_number, None, "reconcile_failed", started);
            }
        };
        self.metrics.nav_usd.set(report.account_value_usd);
        self.metrics.open_positions.set(report.positions.len() as f64);
        let portfolio = self.reconciler.portfolio_state(&report, now).await;

        let regime_signal = self.detect_regime(now).await;
        let regime = regime_signal.regime;
        info!(
            "regime: {regime} (conf={:.2}) | trend {:+.1}% vol {:.0}%",
            regime_signal.confidence, regime_signal.trend_pct, regime_signal.annualized_vol_pct
        );

        let universe = self.universe.build(regime, now).await;
        if universe.is_empty() {
            self.metrics.cycles_no_trade.inc();
            return CycleRecord::no_trade(cycle_number, Some(regime), "empty_universe", started);
        }

        let trigger_signals = self.triggers.scan(&universe, regime, now).await;
        let trigger_count = trigger_signals.len();
        if let Err(e) = self
            .state
            .set_zero_trigger_cycles(self.triggers.no_trigger_streak())
            .await
        {
            warn!("failed to persist zero-trigger streak: {e}");
        }

        // Forced exits come first; strategies only originate entries
        let state = self.state.load_at(now).await;
        let momentum: BTreeMap<String, f64> = trigger_signals
            .iter()
            .filter(|t| t.kind == TriggerKind::Momentum)
            .filter_map(|t| t.price_change_pct.map(|p| (t.symbol.clone(), p)))
            .collect();
        let exits = self.position_manager.evaluate(
            &state.positions,
            &state.managed_positions,
            &report.current_prices,
            &momentum,
            now,
        );

        let context = StrategyContext {
            universe: &universe,
            triggers: &trigger_signals,
            regime,
            timestamp: now,
            cycle_number,
            portfolio: &portfolio,
        };
        let entries = self.registry.aggregate(&context, true);

        let mut proposals: Vec<TradeProposal> = exits;
        proposals.extend(entries);
        self.metrics.proposals_total.inc_by(proposals.len() as u64);

        if proposals.is_empty() {
            let reason = if trigger_count == 0 {
                "no_candidates_from_triggers"
            } else {
                "no_proposals_from_strategies"
            };
            self.metrics.cycles_no_trade.inc();
            let mut record = CycleRecord::no_trade(cycle_number, Some(regime), reason, started);
            record.status = CycleStatus::NoOpportunities;
            record.trigger_count = trigger_count;
            return record;
        }
        let proposal_count = proposals.len();

        let risk_result = self.risk_engine.check_all(proposals, &portfolio, regime).await;
        for reasons in risk_result.proposal_rejections.values() {
            for reason in reasons {
                let check = reason.split_whitespace().next().unwrap_or(reason);
                self.metrics.record_rejection(check);
            }
        }
        if !risk_result.approved {
            debug!("risk rejection: {:?}", risk_result.reason);
            self.metrics.cycles_no_trade.inc();
            let mut record = CycleRecord::no_trade(
                cycle_number,
                Some(regime),
                &format!(
                    "risk_blocked_{}",
                    risk_result.violated_checks.first().map(String::as_str).unwrap_or("unknown")
                ),
                started,
            );
            record.trigger_count = trigger_count;
            record.proposal_count = proposal_count;
            record.rejections = risk_result.proposal_rejections;
            return record;
        }
        let approved_count = risk_result.approved_proposals.len();
        self.metrics.approved_total.inc_by(approved_count as u64);

        let timing = self
            .limits
            .check_all(
                &risk_result.approved_proposals,
                portfolio.trades_today,
                portfolio.trades_this_hour,
                portfolio.consecutive_losses,
                portfolio.last_loss_time,
                now,
            )
            .await;
        if !timing.approved {
            self.metrics.cycles_no_trade.inc();
            let mut record = CycleRecord::no_trade(
                cycle_number,
                Some(regime),
                &format!(
                    "pacing_blocked_{}",
                    timing.violated_checks.first().map(String::as_str).unwrap_or("unknown")
                ),
                started,
            );
            record.trigger_count = trigger_count;
            record.proposal_count = proposal_count;
            record.rejections = risk_result.proposal_rejections;
            return record;
        }

        let (survivors, timing_rejections) = self
            .limits
            .filter_by_timing(risk_result.approved_proposals, now)
            .await;
        let mut rejections = risk_result.proposal_rejections;
        for (symbol, reasons) in timing_rejections {
            rejections.entry(symbol).or_default().extend(reasons);
        }
        if survivors.is_empty() {
            self.metrics.cycles_no_trade.inc();
            let mut record = CycleRecord::no_trade(
                cycle_number,
                Some(regime),
                "all_proposals_filtered_by_timing",
                started,
            );
            record.trigger_count = trigger_count;
            record.proposal_count = proposal_count;
            record.rejections = rejections;
            return record;
        }

        let executed = self.execution.execute(survivors, &portfolio, now).await;
        let filled = executed.iter().filter(|t| t.filled()).count();
        self.metrics.executed_total.inc_by(filled as u64);

        CycleRecord {
            cycle_number,
            status: CycleStatus::Executed,
            regime: Some(regime),
            no_trade_reason: None,
            trigger_count,
            proposal_count,
            approved_count,
            executed_count: executed.len(),
            rejections,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn detect_regime(&self, now: DateTime<Utc>) -> RegimeSignal {
        let limit = self.config.app.regime_lookback_days * 24;
        let candles = match self
            .exchange
            .get_ohlcv(&self.config.app.reference_symbol, "1h", limit)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                // Safe default must never upgrade risk posture: no data means
                // the chop baseline, not a bull call
                warn!("failed to fetch reference candles: {e}");
                Vec::new()
            }
        };
        self.regime_detector.detect(&candles, now)
    }

    /// One structured audit record per cycle.
    fn audit(&self, record: &CycleRecord) {
        match serde_json::to_string(record) {
            Ok(json) => info!("CYCLE_AUDIT:{json}"),
            Err(e) => warn!("failed to serialize cycle record: {e}"),
        }
        self.metrics.report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::risk::circuit::ApiHealth;
    use crate::config::Mode;
    use crate::domain::types::AccountBalance;
    use crate::infrastructure::mock::MockExchange;
    use crate::infrastructure::state::JsonFileBackend;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    async fn pipeline_with(config: Config, exchange: Arc<MockExchange>) -> (tempfile::TempDir, CyclePipeline) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.policy.governance.kill_switch_file =
            dir.path().join("KILL_SWITCH").to_string_lossy().to_string();

        let state = Arc::new(StateStore::new(Box::new(
            JsonFileBackend::new(dir.path().join("state.json")).unwrap(),
        )));
        let health = Arc::new(ApiHealth::new());
        let alerts = Arc::new(AlertService::disabled());
        let limits = Arc::new(TradeLimits::new(config.policy.risk.clone(), state.clone()));
        let universe = Arc::new(UniverseBuilder::new(config.universe.clone(), exchange.clone()));
        let triggers = TriggerEngine::new(config.signals.triggers.clone(), exchange.clone());
        let registry = StrategyRegistry::from_config(&config.strategies, &config.policy);
        let position_manager = PositionManager::new(config.policy.exits.clone());
        let risk_engine = RiskEngine::new(
            config.policy.clone(),
            universe.clone(),
            exchange.clone(),
            limits.clone(),
            alerts.clone(),
            health.clone(),
        );
        let execution = ExecutionEngine::new(
            Mode::Paper,
            exchange.clone(),
            state.clone(),
            limits.clone(),
            health.clone(),
            config.policy.risk.min_trade_notional_usd,
        );
        let reconciler = Reconciler::new(exchange.clone(), state.clone(), health.clone());
        let metrics = Metrics::new().unwrap();

        let pipeline = CyclePipeline::new(
            config,
            exchange,
            state,
            reconciler,
            universe,
            triggers,
            registry,
            position_manager,
            risk_engine,
            limits,
            execution,
            alerts,
            metrics,
        );
        (dir, pipeline)
    }

    async fn market_with_momentum(exchange: &MockExchange) {
        exchange
            .set_accounts(vec![AccountBalance { currency: "USD".into(), available_balance: 10_000.0 }])
            .await;
        // Steady uptrend for the traded asset; flat reference so regime=chop
        let uptrend: Vec<f64> = (0..168).map(|i| 100.0 * (1.0 + 0.004 * i as f64)).collect();
        let flat: Vec<f64> = (0..168).map(|i| 50_000.0 + (i % 7) as f64).collect();
        let mk = |closes: &[f64]| {
            closes
                .iter()
                .enumerate()
                .map(|(i, &c)| crate::domain::types::Candle {
                    timestamp: ts() - chrono::Duration::hours((closes.len() - i) as i64),
                    open: c,
                    high: c * 1.015,
                    low: c * 0.985,
                    close: c,
                    volume: 1_000.0,
                })
                .collect::<Vec<_>>()
        };
        exchange.set_candles("SOL-USD", mk(&uptrend)).await;
        exchange.set_candles("BTC-USD", mk(&flat)).await;
        exchange.set_quote("SOL-USD", *uptrend.last().unwrap(), 10.0, 60_000_000.0).await;
        exchange.set_orderbook("SOL-USD", 500_000.0).await;
        exchange.set_quote("BTC-USD", 50_000.0, 5.0, 500_000_000.0).await;
        exchange.set_orderbook("BTC-USD", 2_000_000.0).await;
    }

    fn config_for_e2e() -> Config {
        let mut config = Config::default();
        config.universe.tiers.tier_1_core.symbols = vec!["BTC-USD".into(), "SOL-USD".into()];
        // Keep the pre-filters out of the way for the synthetic series
        config.signals.triggers.atr_filter.enabled = false;
        config.signals.triggers.outlier_guard.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_full_cycle_executes_momentum_entry() {
        let exchange = Arc::new(MockExchange::new());
        market_with_momentum(&exchange).await;
        let (_dir, pipeline) = pipeline_with(config_for_e2e(), exchange.clone()).await;

        let record = pipeline.run_cycle(1, ts()).await;
        assert_eq!(record.status, CycleStatus::Executed, "reason: {:?}", record.no_trade_reason);
        assert!(record.trigger_count >= 1);
        assert!(record.executed_count >= 1);
        assert!(exchange.place_order_count() >= 1);

        // The fill landed in the ledger
        let state = pipeline.state.load_at(ts()).await;
        assert!(state.positions.contains_key("SOL-USD"));
        assert_eq!(state.trades_today, 1);
    }

    #[tokio::test]
    async fn test_kill_switch_short_circuits_cycle() {
        let exchange = Arc::new(MockExchange::new());
        market_with_momentum(&exchange).await;
        let (dir, pipeline) = pipeline_with(config_for_e2e(), exchange.clone()).await;

        std::fs::write(dir.path().join("KILL_SWITCH"), "halt").unwrap();
        let record = pipeline.run_cycle(1, ts()).await;
        assert_eq!(record.status, CycleStatus::NoTrade);
        assert_eq!(record.no_trade_reason.as_deref(), Some("kill_switch"));
        // No orders were placed while the switch is on
        assert_eq!(exchange.place_order_count(), 0);
    }

    #[tokio::test]
    async fn test_flat_market_yields_no_opportunities() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .set_accounts(vec![AccountBalance { currency: "USD".into(), available_balance: 10_000.0 }])
            .await;
        let flat: Vec<f64> = vec![50_000.0; 168];
        let candles: Vec<crate::domain::types::Candle> = flat
            .iter()
            .enumerate()
            .map(|(i, &c)| crate::domain::types::Candle {
                timestamp: ts() - chrono::Duration::hours((flat.len() - i) as i64),
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 1_000.0,
            })
            .collect();
        exchange.set_candles("BTC-USD", candles).await;
        exchange.set_quote("BTC-USD", 50_000.0, 5.0, 500_000_000.0).await;
        exchange.set_orderbook("BTC-USD", 2_000_000.0).await;

        let mut config = config_for_e2e();
        config.universe.tiers.tier_1_core.symbols = vec!["BTC-USD".into()];
        config.signals.triggers.fallback.enabled = false;
        let (_dir, pipeline) = pipeline_with(config, exchange.clone()).await;

        let record = pipeline.run_cycle(1, ts()).await;
        assert_eq!(record.status, CycleStatus::NoOpportunities);
        assert_eq!(record.trigger_count, 0);
        assert_eq!(exchange.place_order_count(), 0);
    }

    #[tokio::test]
    async fn test_second_cycle_blocked_by_global_spacing() {
        let exchange = Arc::new(MockExchange::new());
        market_with_momentum(&exchange).await;
        let (_dir, pipeline) = pipeline_with(config_for_e2e(), exchange.clone()).await;

        let first = pipeline.run_cycle(1, ts()).await;
        assert_eq!(first.status, CycleStatus::Executed);

        // One minute later the 180s global spacing still applies
        let second = pipeline.run_cycle(2, ts() + chrono::Duration::seconds(60)).await;
        assert_eq!(second.status, CycleStatus::NoTrade);
        assert!(second
            .no_trade_reason
            .as_deref()
            .unwrap()
            .contains("pacing_blocked_global_trade_spacing"));
    }

    #[tokio::test]
    async fn test_crash_regime_blocks_entries() {
        let exchange = Arc::new(MockExchange::new());
        market_with_momentum(&exchange).await;
        // Reference asset crashes ~17%
        let crash: Vec<f64> = (0..168).map(|i| 50_000.0 - 50.0 * i as f64).collect();
        let candles: Vec<crate::domain::types::Candle> = crash
            .iter()
            .enumerate()
            .map(|(i, &c)| crate::domain::types::Candle {
                timestamp: ts() - chrono::Duration::hours((crash.len() - i) as i64),
                open: c,
                high: c * 1.001,
                low: c * 0.999,
                close: c,
                volume: 1_000.0,
            })
            .collect();
        exchange.set_candles("BTC-USD", candles).await;

        let mut config = config_for_e2e();
        // Keep T2 alive in crash so the universe is not the blocker
        let (_dir, pipeline) = {
            config.signals.triggers.fallback.enabled = false;
            pipeline_with(config, exchange.clone()).await
        };

        let record = pipeline.run_cycle(1, ts()).await;
        assert_ne!(record.status, CycleStatus::Executed);
        assert_eq!(exchange.place_order_count(), 0);
    }
}
