//! Push-based metrics: a Prometheus registry whose snapshot is emitted as a
//! structured JSON log line each cycle. No HTTP server, no incoming
//! connections.

use anyhow::Result;
use prometheus::{Gauge, IntCounter, IntCounterVec, Opts, Registry};
use tracing::info;

pub struct Metrics {
    pub registry: Registry,
    pub cycles_total: IntCounter,
    pub cycles_no_trade: IntCounter,
    pub proposals_total: IntCounter,
    pub approved_total: IntCounter,
    pub executed_total: IntCounter,
    pub rejections_total: IntCounterVec,
    pub nav_usd: Gauge,
    pub open_positions: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounter::new("trader_cycles_total", "Completed decision cycles")?;
        let cycles_no_trade =
            IntCounter::new("trader_cycles_no_trade_total", "Cycles ending without execution")?;
        let proposals_total =
            IntCounter::new("trader_proposals_total", "Proposals generated by strategies")?;
        let approved_total =
            IntCounter::new("trader_proposals_approved_total", "Proposals surviving the risk gate")?;
        let executed_total = IntCounter::new("trader_orders_executed_total", "Orders executed")?;
        let rejections_total = IntCounterVec::new(
            Opts::new("trader_rejections_total", "Proposal rejections by check"),
            &["check"],
        )?;
        let nav_usd = Gauge::new("trader_nav_usd", "Account value in USD")?;
        let open_positions = Gauge::new("trader_open_positions", "Open position count")?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycles_no_trade.clone()))?;
        registry.register(Box::new(proposals_total.clone()))?;
        registry.register(Box::new(approved_total.clone()))?;
        registry.register(Box::new(executed_total.clone()))?;
        registry.register(Box::new(rejections_total.clone()))?;
        registry.register(Box::new(nav_usd.clone()))?;
        registry.register(Box::new(open_positions.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            cycles_no_trade,
            proposals_total,
            approved_total,
            executed_total,
            rejections_total,
            nav_usd,
            open_positions,
        })
    }

    pub fn record_rejection(&self, check: &str) {
        self.rejections_total.with_label_values(&[check]).inc();
    }

    /// Emit a snapshot as a single structured log line.
    pub fn report(&self) {
        let snapshot = serde_json::json!({
            "cycles": self.cycles_total.get(),
            "cycles_no_trade": self.cycles_no_trade.get(),
            "proposals": self.proposals_total.get(),
            "approved": self.approved_total.get(),
            "executed": self.executed_total.get(),
            "nav_usd": self.nav_usd.get(),
            "open_positions": self.open_positions.get(),
        });
        info!("METRICS_JSON:{snapshot}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_increment() {
        let metrics = Metrics::new().unwrap();
        metrics.cycles_total.inc();
        metrics.record_rejection("kill_switch");
        metrics.record_rejection("kill_switch");
        metrics.nav_usd.set(10_000.0);

        assert_eq!(metrics.cycles_total.get(), 1);
        assert_eq!(metrics.rejections_total.with_label_values(&["kill_switch"]).get(), 2);
        assert_eq!(metrics.nav_usd.get(), 10_000.0);
        metrics.report();
    }
}
