//! End-to-end trading cycle scenarios driven through the public API with the
//! scriptable mock exchange.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tidetrader::application::cycle::{CyclePipeline, CycleStatus};
use tidetrader::application::execution::ExecutionEngine;
use tidetrader::application::position_manager::PositionManager;
use tidetrader::application::reconcile::Reconciler;
use tidetrader::application::risk::{ApiHealth, RiskEngine, TradeLimits};
use tidetrader::application::strategies::StrategyRegistry;
use tidetrader::application::triggers::TriggerEngine;
use tidetrader::application::universe::UniverseBuilder;
use tidetrader::config::{Config, Mode};
use tidetrader::domain::types::{AccountBalance, Candle, OrderSide};
use tidetrader::infrastructure::alerting::AlertService;
use tidetrader::infrastructure::mock::MockExchange;
use tidetrader::infrastructure::observability::Metrics;
use tidetrader::infrastructure::state::{JsonFileBackend, StateStore};

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
}

fn candles(closes: &[f64], band: f64) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            timestamp: ts() - Duration::hours((closes.len() - i) as i64),
            open: close,
            high: close * (1.0 + band),
            low: close * (1.0 - band),
            close,
            volume: 1_000.0,
        })
        .collect()
}

struct Harness {
    _dir: tempfile::TempDir,
    pipeline: CyclePipeline,
    exchange: Arc<MockExchange>,
    state: Arc<StateStore>,
    kill_switch: std::path::PathBuf,
}

fn build_harness(mut config: Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let kill_switch = dir.path().join("KILL_SWITCH");
    config.policy.governance.kill_switch_file = kill_switch.to_string_lossy().to_string();
    // Synthetic candles carry their volatility in the band, not the closes
    config.signals.triggers.atr_filter.enabled = false;
    config.signals.triggers.outlier_guard.enabled = false;
    config.signals.triggers.fallback.enabled = false;

    let exchange = Arc::new(MockExchange::new());
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
        exchange.clone(),
        state.clone(),
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
    Harness { _dir: dir, pipeline, exchange, state, kill_switch }
}

async fn seed_trending_market(exchange: &MockExchange) {
    exchange
        .set_accounts(vec![AccountBalance {
            currency: "USD".into(),
            available_balance: 10_000.0,
        }])
        .await;
    let uptrend: Vec<f64> = (0..168).map(|i| 100.0 * (1.0 + 0.004 * i as f64)).collect();
    let flat: Vec<f64> = (0..168).map(|i| 50_000.0 + (i % 7) as f64).collect();
    exchange.set_candles("SOL-USD", candles(&uptrend, 0.015)).await;
    exchange.set_candles("BTC-USD", candles(&flat, 0.015)).await;
    exchange
        .set_quote("SOL-USD", *uptrend.last().unwrap(), 10.0, 60_000_000.0)
        .await;
    exchange.set_orderbook("SOL-USD", 500_000.0).await;
    exchange.set_quote("BTC-USD", 50_000.0, 5.0, 500_000_000.0).await;
    exchange.set_orderbook("BTC-USD", 2_000_000.0).await;
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.universe.tiers.tier_1_core.symbols = vec!["BTC-USD".into(), "SOL-USD".into()];
    config
}

#[tokio::test]
async fn momentum_market_produces_an_executed_entry() {
    let harness = build_harness(base_config());
    seed_trending_market(&harness.exchange).await;

    let record = harness.pipeline.run_cycle(1, ts()).await;
    assert_eq!(record.status, CycleStatus::Executed, "reason: {:?}", record.no_trade_reason);
    assert!(record.executed_count >= 1);

    let state = harness.state.load_at(ts()).await;
    assert!(state.positions.contains_key("SOL-USD"));
    assert!(state.last_trade_timestamp.is_some());
    // Pacing stamps agree with the fill time
    assert!(state.last_trade_timestamp.unwrap() >= ts());
}

#[tokio::test]
async fn kill_switch_prevents_any_order_placement() {
    let harness = build_harness(base_config());
    seed_trending_market(&harness.exchange).await;
    std::fs::write(&harness.kill_switch, "halt").unwrap();

    for cycle in 1..=3 {
        let record = harness.pipeline.run_cycle(cycle, ts()).await;
        assert_eq!(record.status, CycleStatus::NoTrade);
        assert_eq!(record.no_trade_reason.as_deref(), Some("kill_switch"));
    }
    assert_eq!(harness.exchange.place_order_count(), 0);

    // Removing the file restores trading
    std::fs::remove_file(&harness.kill_switch).unwrap();
    let record = harness.pipeline.run_cycle(4, ts()).await;
    assert_eq!(record.status, CycleStatus::Executed);
}

#[tokio::test]
async fn daily_stop_blocks_the_whole_batch() {
    let harness = build_harness(base_config());
    seed_trending_market(&harness.exchange).await;

    // Record a realized loss worth 6% of NAV; default daily stop is 3%
    harness
        .state
        .record_fill("ETH-USD", OrderSide::Buy, 1.0, 1_000.0, 0.0, ts(), None)
        .await
        .unwrap();
    harness
        .state
        .record_fill("ETH-USD", OrderSide::Sell, 1.0, 400.0, 0.0, ts(), None)
        .await
        .unwrap();

    let record = harness.pipeline.run_cycle(1, ts()).await;
    assert_eq!(record.status, CycleStatus::NoTrade);
    assert_eq!(record.no_trade_reason.as_deref(), Some("risk_blocked_daily_stop_loss"));
    assert_eq!(harness.exchange.place_order_count(), 0);
}

#[tokio::test]
async fn stop_loss_exit_fires_and_cools_the_symbol() {
    let harness = build_harness(base_config());
    seed_trending_market(&harness.exchange).await;

    // Managed BTC position entered 10h ago at twice the current price. BTC is
    // flat so no entry signal competes with the forced exit.
    let entry_time = ts() - Duration::hours(10);
    harness
        .state
        .record_fill("BTC-USD", OrderSide::Buy, 0.02, 100_000.0, 1.0, entry_time, None)
        .await
        .unwrap();
    harness
        .state
        .update_managed_position_targets("BTC-USD", Some(8.0), Some(15.0), Some(72.0))
        .await
        .unwrap();
    // The exchange must report the holding for reconciliation to keep it
    harness
        .exchange
        .set_accounts(vec![
            AccountBalance { currency: "USD".into(), available_balance: 9_000.0 },
            AccountBalance { currency: "BTC".into(), available_balance: 0.02 },
        ])
        .await;

    let record = harness.pipeline.run_cycle(1, ts()).await;
    assert_eq!(record.status, CycleStatus::Executed, "reason: {:?}", record.no_trade_reason);

    let state = harness.state.load_at(ts()).await;
    // Position unwound at a ~50% loss, stop cooldown applied
    assert!(!state.positions.contains_key("BTC-USD"));
    assert_eq!(state.last_trade_result["BTC-USD"].outcome, "stop_loss");
    assert!(state.pnl_today < 0.0);
    let until = state.cooldowns["BTC-USD"];
    assert_eq!((until - ts()).num_minutes(), 120);
}

#[tokio::test]
async fn no_approval_without_every_gate_passing() {
    // Global at-risk: a held position plus pending buys already near the cap
    // leaves no room; the batch is rejected outright
    let mut config = base_config();
    config.policy.risk.max_total_at_risk_pct = 4.0;
    let harness = build_harness(config);
    seed_trending_market(&harness.exchange).await;

    // Hold SOL worth ~3.7% of NAV
    harness
        .exchange
        .set_accounts(vec![
            AccountBalance { currency: "USD".into(), available_balance: 9_630.0 },
            AccountBalance { currency: "SOL".into(), available_balance: 2.2 },
        ])
        .await;
    let entry_time = ts() - Duration::hours(1);
    harness
        .state
        .record_fill("SOL-USD", OrderSide::Buy, 2.2, 167.0, 0.5, entry_time, None)
        .await
        .unwrap();

    let record = harness.pipeline.run_cycle(1, ts()).await;
    assert_ne!(record.status, CycleStatus::Executed);
    assert_eq!(harness.exchange.place_order_count(), 0);
}
