//! tidetrader: headless 24/7 spot trading engine.
//!
//! Runs repeated decision cycles against a centralized exchange: reconcile,
//! regime, universe, triggers, strategies, risk gate, pacing, execution.
//! Metrics are pushed as structured JSON log lines; there is no HTTP server
//! and no incoming connection.
//!
//! # Usage
//! ```sh
//! tidetrader --config-dir config --mode dry_run
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tidetrader::application::cycle::CyclePipeline;
use tidetrader::application::execution::ExecutionEngine;
use tidetrader::application::position_manager::PositionManager;
use tidetrader::application::reconcile::Reconciler;
use tidetrader::application::risk::{ApiHealth, RiskEngine, TradeLimits};
use tidetrader::application::strategies::StrategyRegistry;
use tidetrader::application::triggers::TriggerEngine;
use tidetrader::application::universe::UniverseBuilder;
use tidetrader::config::{Config, Mode, StateBackendKind};
use tidetrader::domain::ports::ExchangePort;
use tidetrader::domain::universe::Tier;
use tidetrader::infrastructure::alerting::AlertService;
use tidetrader::infrastructure::coinbase::CoinbaseExchange;
use tidetrader::infrastructure::lock::InstanceLock;
use tidetrader::infrastructure::observability::Metrics;
use tidetrader::infrastructure::paper::{PaperExchange, SlippageConfig, SlippageModel};
use tidetrader::infrastructure::state::{JsonFileBackend, SqliteBackend, StateStore};
use tracing::{info, Level};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "tidetrader", version, about = "24/7 spot trading engine")]
struct Cli {
    /// Directory holding app.toml, policy.toml, universe.toml, signals.toml,
    /// strategies.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Override the configured mode (dry_run | paper | live)
    #[arg(long)]
    mode: Option<Mode>,

    /// Override the state file path
    #[arg(long)]
    state_file: Option<String>,

    /// Run a single cycle and exit (shakedown)
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    let cli = Cli::parse();
    info!("tidetrader {} starting", env!("CARGO_PKG_VERSION"));

    let mut config =
        Config::load(&cli.config_dir).context("failed to load configuration")?;
    if let Some(mode) = cli.mode {
        config.app.mode = mode;
    }
    if let Some(state_file) = cli.state_file {
        config.app.state_file = state_file;
    }
    info!("mode: {:?}, cycle interval: {}s", config.app.mode, config.app.cycle_interval_secs);

    // A second instance must refuse to start
    let _lock = InstanceLock::acquire(&config.app.lock_file)
        .context("failed to acquire instance lock")?;

    let state = Arc::new(build_state_store(&config).await?);
    let exchange = build_exchange(&config)?;

    let health = Arc::new(ApiHealth::new());
    let alerts = Arc::new(AlertService::from_settings(&config.alerting));
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
        config.app.mode,
        exchange.clone(),
        state.clone(),
        limits.clone(),
        health.clone(),
        config.policy.risk.min_trade_notional_usd,
    );
    let reconciler = Reconciler::new(exchange.clone(), state.clone(), health.clone());
    let metrics = Metrics::new()?;

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

    if cli.once {
        let record = pipeline.run_cycle(1, chrono::Utc::now()).await;
        info!("single cycle complete: {:?}", record.status);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    pipeline.run_forever(shutdown_rx).await;
    info!("clean shutdown");
    Ok(())
}

async fn build_state_store(config: &Config) -> Result<StateStore> {
    let store = match config.app.state_backend {
        StateBackendKind::Json => {
            StateStore::new(Box::new(JsonFileBackend::new(&config.app.state_file)?))
        }
        StateBackendKind::Sqlite => {
            StateStore::new(Box::new(SqliteBackend::connect(&config.app.state_db).await?))
        }
    };
    Ok(store)
}

fn build_exchange(config: &Config) -> Result<Arc<dyn ExchangePort>> {
    let api_key = std::env::var("COINBASE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("COINBASE_API_SECRET").unwrap_or_default();
    let base_url = std::env::var("COINBASE_BASE_URL")
        .unwrap_or_else(|_| "https://api.coinbase.com".to_string());

    if config.app.mode == Mode::Live && (api_key.is_empty() || api_secret.is_empty()) {
        anyhow::bail!("LIVE mode requires COINBASE_API_KEY and COINBASE_API_SECRET");
    }

    let coinbase: Arc<dyn ExchangePort> = Arc::new(CoinbaseExchange::new(
        api_key,
        api_secret,
        base_url,
        config.app.exchange_timeout_secs,
    ));

    match config.app.mode {
        Mode::Paper => {
            let mut tier_lookup = BTreeMap::new();
            for symbol in &config.universe.tiers.tier_1_core.symbols {
                tier_lookup.insert(symbol.clone(), Tier::T1);
            }
            for symbol in &config.universe.tiers.tier_2_rotational.symbols {
                tier_lookup.insert(symbol.clone(), Tier::T2);
            }
            for symbol in &config.universe.tiers.tier_3_event_driven.symbols {
                tier_lookup.insert(symbol.clone(), Tier::T3);
            }
            Ok(Arc::new(PaperExchange::new(
                coinbase,
                SlippageModel::new(SlippageConfig::default()),
                config.app.paper_starting_cash_usd,
                tier_lookup,
            )))
        }
        Mode::DryRun | Mode::Live => Ok(coinbase),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
