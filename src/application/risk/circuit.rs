//! Circuit breakers evaluated before any other risk check. Fail closed on
//! exchange/data trouble: rate-limit cooldown, consecutive API errors,
//! connectivity loss, crash regime.

use crate::config::CircuitBreakerPolicy;
use crate::domain::ports::ExchangePort;
use crate::domain::regime::Regime;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Default, Clone, Copy)]
struct HealthState {
    api_error_count: u32,
    last_api_success: Option<DateTime<Utc>>,
    last_rate_limit: Option<DateTime<Utc>>,
}

/// Shared API-health tracker fed by the execution engine and reconciler.
pub struct ApiHealth {
    state: Mutex<HealthState>,
}

impl ApiHealth {
    pub fn new() -> Self {
        Self { state: Mutex::new(HealthState::default()) }
    }

    pub fn record_api_success(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("api health lock poisoned");
        state.api_error_count = 0;
        state.last_api_success = Some(now);
        debug!("API success recorded, error counter reset");
    }

    pub fn record_api_error(&self) {
        let mut state = self.state.lock().expect("api health lock poisoned");
        state.api_error_count += 1;
        warn!("API error recorded (count: {})", state.api_error_count);
    }

    pub fn record_rate_limit(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("api health lock poisoned");
        state.last_rate_limit = Some(now);
        warn!("rate limit hit recorded");
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().expect("api health lock poisoned").api_error_count
    }

    fn snapshot(&self) -> HealthState {
        *self.state.lock().expect("api health lock poisoned")
    }

    fn reset_error_count(&self) {
        self.state.lock().expect("api health lock poisoned").api_error_count = 0;
    }
}

impl Default for ApiHealth {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CircuitBreakers<'a> {
    pub config: &'a CircuitBreakerPolicy,
    pub health: &'a ApiHealth,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub reason: String,
    pub check: &'static str,
}

impl<'a> CircuitBreakers<'a> {
    /// Returns the first tripped breaker, or None when trading may proceed.
    pub async fn check(
        &self,
        exchange: &dyn ExchangePort,
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Option<Trip> {
        let snapshot = self.health.snapshot();

        if self.config.pause_on_rate_limit {
            if let Some(last_rate_limit) = snapshot.last_rate_limit {
                let elapsed = (now - last_rate_limit).num_seconds();
                if elapsed < self.config.rate_limit_cooldown_seconds {
                    let remaining = self.config.rate_limit_cooldown_seconds - elapsed;
                    warn!("rate limit cooldown active: {remaining}s remaining");
                    return Some(Trip {
                        reason: format!("rate limit cooldown ({remaining}s remaining)"),
                        check: "rate_limit_cooldown",
                    });
                }
            }
        }

        if snapshot.api_error_count >= self.config.max_consecutive_api_errors {
            match snapshot.last_api_success {
                Some(last_success)
                    if (now - last_success).num_seconds() > self.config.api_error_window_seconds =>
                {
                    // No successes inside the window either: the counter has
                    // gone stale, start fresh
                    debug!("resetting API error counter after stale window");
                    self.health.reset_error_count();
                }
                Some(_) => {
                    error!(
                        "API health check failed: {} consecutive errors",
                        snapshot.api_error_count
                    );
                    return Some(Trip {
                        reason: format!(
                            "API health degraded ({} consecutive errors)",
                            snapshot.api_error_count
                        ),
                        check: "api_health",
                    });
                }
                None => {
                    error!(
                        "API health critical: {} errors, no successful calls",
                        snapshot.api_error_count
                    );
                    return Some(Trip {
                        reason: format!("API health critical ({} errors)", snapshot.api_error_count),
                        check: "api_health",
                    });
                }
            }
        }

        if self.config.check_exchange_status && !exchange.check_connectivity().await {
            error!("exchange connectivity check failed");
            return Some(Trip {
                reason: "exchange connectivity failed".to_string(),
                check: "exchange_connectivity",
            });
        }

        if regime == Regime::Crash {
            warn!("crash regime detected - halting new trades");
            return Some(Trip {
                reason: "crash regime active (extreme volatility)".to_string(),
                check: "volatility_crash",
            });
        }

        None
    }
}
