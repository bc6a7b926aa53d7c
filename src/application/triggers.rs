//! Trigger engine: deterministic, ranked signal detection per eligible
//! symbol. Two pre-filters (outlier guard, ATR volatility floor) run before
//! the trigger checks; the strongest signal per symbol survives.

use crate::config::TriggersConfig;
use crate::domain::ports::ExchangePort;
use crate::domain::regime::Regime;
use crate::domain::triggers::{TriggerKind, TriggerSignal};
use crate::domain::types::Candle;
use crate::domain::universe::{UniverseAsset, UniverseSnapshot};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use ta::indicators::{ExponentialMovingAverage, RelativeStrengthIndex};
use ta::Next;
use tracing::{debug, info, warn};

pub struct TriggerEngine {
    config: TriggersConfig,
    exchange: Arc<dyn ExchangePort>,
    no_trigger_streak: Mutex<u32>,
}

impl TriggerEngine {
    pub fn new(config: TriggersConfig, exchange: Arc<dyn ExchangePort>) -> Self {
        Self { config, exchange, no_trigger_streak: Mutex::new(0) }
    }

    pub async fn scan(
        &self,
        universe: &UniverseSnapshot,
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Vec<TriggerSignal> {
        let assets = universe.all_eligible();
        info!("scanning {} assets for triggers (regime={regime})", assets.len());

        let fetches = assets.iter().map(|asset| {
            let exchange = self.exchange.clone();
            let symbol = asset.symbol.clone();
            let limit = self.config.history_limit_hours;
            async move {
                let result = exchange.get_ohlcv(&symbol, "1h", limit).await;
                (symbol, result)
            }
        });
        let mut candles_by_symbol: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for (symbol, result) in join_all(fetches).await {
            match result {
                Ok(candles) if !candles.is_empty() => {
                    candles_by_symbol.insert(symbol, candles);
                }
                Ok(_) => {}
                Err(e) => warn!("failed to scan {symbol}: {e}"),
            }
        }

        let mut signals = Vec::new();
        let mut contexts: Vec<(&UniverseAsset, &[Candle])> = Vec::new();

        for &asset in &assets {
            let Some(candles) = candles_by_symbol.get(&asset.symbol) else {
                continue;
            };

            if let Some(reason) = self.outlier_guard(candles) {
                warn!("{}: {reason}", asset.symbol);
                continue;
            }
            if let Some(reason) = self.atr_floor(candles, regime) {
                debug!("{}: {reason}", asset.symbol);
                continue;
            }
            contexts.push((asset, candles.as_slice()));

            let mut candidates = Vec::new();
            if let Some(signal) = self.check_price_move(asset, candles, regime, None, "", now) {
                candidates.push(signal);
            }
            if let Some(signal) = self.check_volume_spike(asset, candles, regime, now) {
                candidates.push(signal);
            }
            if let Some(signal) = self.check_breakout(asset, candles, regime, now) {
                candidates.push(signal);
            }
            if let Some(signal) = self.check_momentum(asset, candles, regime, now) {
                candidates.push(signal);
            }

            if let Some(strongest) = candidates
                .into_iter()
                .max_by(|a, b| a.score().partial_cmp(&b.score()).unwrap_or(std::cmp::Ordering::Equal))
            {
                debug!(
                    "{}: {} (strength={:.2}, conf={:.2})",
                    asset.symbol, strongest.kind, strongest.strength, strongest.confidence
                );
                signals.push(strongest);
            }
        }

        if signals.is_empty() {
            signals = self.fallback_scan(&contexts, regime, now);
        } else {
            *self.no_trigger_streak.lock().expect("streak lock poisoned") = 0;
        }

        signals.sort_by(|a, b| {
            b.score().partial_cmp(&a.score()).unwrap_or(std::cmp::Ordering::Equal)
        });
        signals.truncate(self.config.max_triggers_per_cycle);

        info!("found {} triggers", signals.len());
        for (i, signal) in signals.iter().take(5).enumerate() {
            info!(
                "  trigger #{}: {} {} strength={:.2} conf={:.2} price_chg={:.2}%",
                i + 1,
                signal.symbol,
                signal.kind,
                signal.strength,
                signal.confidence,
                signal.price_change_pct.unwrap_or(0.0)
            );
        }
        signals
    }

    pub fn no_trigger_streak(&self) -> u32 {
        *self.no_trigger_streak.lock().expect("streak lock poisoned")
    }

    /// Relaxed re-scan after a configured streak of empty cycles. Prevents
    /// pathological no-trigger droughts in low-volatility periods.
    fn fallback_scan(
        &self,
        contexts: &[(&UniverseAsset, &[Candle])],
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Vec<TriggerSignal> {
        let mut streak = self.no_trigger_streak.lock().expect("streak lock poisoned");
        if contexts.is_empty() || !self.config.fallback.enabled {
            *streak = 0;
            return Vec::new();
        }
        if *streak < self.config.fallback.min_no_trigger_streak {
            *streak += 1;
            return Vec::new();
        }

        let relax = self.config.fallback.relax_pct.clamp(0.0, 0.9);
        let thresholds = self.config.thresholds(regime);
        let relaxed = (
            (thresholds.pct_change_15m * (1.0 - relax)).max(0.0),
            (thresholds.pct_change_60m * (1.0 - relax)).max(0.0),
        );

        let mut found: Vec<TriggerSignal> = contexts
            .iter()
            .filter_map(|(asset, candles)| {
                self.check_price_move(
                    asset,
                    candles,
                    regime,
                    Some(relaxed),
                    "[fallback relaxed scan]",
                    now,
                )
            })
            .filter(|signal| {
                self.config.fallback.allow_downside
                    || signal.price_change_pct.unwrap_or(0.0) >= 0.0
            })
            .collect();

        if found.is_empty() {
            *streak += 1;
            return Vec::new();
        }

        found.sort_by(|a, b| {
            b.score().partial_cmp(&a.score()).unwrap_or(std::cmp::Ordering::Equal)
        });
        found.truncate(self.config.fallback.max_new_positions_per_cycle);
        info!(
            "fallback scan: relaxed thresholds produced {} trigger(s) after {} empty cycle(s)",
            found.len(),
            *streak
        );
        *streak = 0;
        found
    }

    /// Rejects bad ticks: a large deviation from the moving average without
    /// volume confirmation.
    fn outlier_guard(&self, candles: &[Candle]) -> Option<String> {
        let guard = &self.config.outlier_guard;
        if !guard.enabled || candles.len() < guard.lookback_periods + 1 {
            return None;
        }

        let current = candles[candles.len() - 1];
        let historical = &candles[candles.len() - 1 - guard.lookback_periods..candles.len() - 1];
        let avg_price: f64 =
            historical.iter().map(|c| c.close).sum::<f64>() / historical.len() as f64;
        if avg_price <= 0.0 {
            return Some(format!("invalid average price: {avg_price}"));
        }

        let deviation_pct = (current.close - avg_price).abs() / avg_price * 100.0;
        if deviation_pct > guard.max_price_deviation_pct {
            let avg_volume: f64 =
                historical.iter().map(|c| c.volume).sum::<f64>() / historical.len() as f64;
            if avg_volume <= 0.0 {
                return Some(format!("invalid average volume: {avg_volume}"));
            }
            let volume_ratio = current.volume / avg_volume;
            if volume_ratio < guard.min_volume_ratio {
                return Some(format!(
                    "price outlier: {deviation_pct:.1}% deviation (>{:.1}%) with low volume ({volume_ratio:.2}x < {:.2}x)",
                    guard.max_price_deviation_pct, guard.min_volume_ratio
                ));
            }
        }
        None
    }

    /// Regime-aware volatility floor: current ATR% must clear a multiple of
    /// the 7-day median ATR%. Drops dead chop where signals are noise.
    fn atr_floor(&self, candles: &[Candle], regime: Regime) -> Option<String> {
        let filter = &self.config.atr_filter;
        if !filter.enabled || candles.len() < filter.lookback_periods * 2 {
            return None;
        }

        let min_mult = self.config.thresholds(regime).atr_filter_min_mult;
        let current_atr_pct = atr_pct(candles, filter.lookback_periods);

        let n = candles.len();
        let window_span = filter.lookback_periods + 1;
        let start_floor = n.saturating_sub(self.config.history_limit_hours);
        let mut samples: Vec<f64> = Vec::new();
        let mut start = start_floor;
        while start + window_span <= n.saturating_sub(1) {
            samples.push(atr_pct(&candles[start..start + window_span], filter.lookback_periods));
            start += 1;
        }
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median_atr_pct = samples[samples.len() / 2];
        if median_atr_pct <= 0.0 {
            return None;
        }

        let ratio = current_atr_pct / median_atr_pct;
        if ratio < min_mult {
            return Some(format!(
                "low volatility: ATR {current_atr_pct:.2}% ({ratio:.2}x median {median_atr_pct:.2}%, need {min_mult:.1}x for {regime})"
            ));
        }
        None
    }

    fn check_price_move(
        &self,
        asset: &UniverseAsset,
        candles: &[Candle],
        regime: Regime,
        threshold_override: Option<(f64, f64)>,
        reason_suffix: &str,
        now: DateTime<Utc>,
    ) -> Option<TriggerSignal> {
        if candles.len() < 60 {
            return None;
        }

        let thresholds = self.config.thresholds(regime);
        let (pct_15m, pct_60m) = threshold_override
            .unwrap_or((thresholds.pct_change_15m, thresholds.pct_change_60m));

        let current_price = candles[candles.len() - 1].close;

        // Hourly bars: the sharpest single-hour move over the last 4h stands
        // in for the short-window threshold.
        let mut sharpest_move = 0.0f64;
        for i in 1..=4.min(candles.len() - 1) {
            let prev = candles[candles.len() - 1 - i].close;
            let curr = candles[candles.len() - i].close;
            if prev > 0.0 {
                let move_pct = (curr - prev) / prev * 100.0;
                if move_pct.abs() > sharpest_move.abs() {
                    sharpest_move = move_pct;
                }
            }
        }

        let prev_close = candles[candles.len() - 2].close;
        let move_60m = if prev_close > 0.0 {
            (current_price - prev_close) / prev_close * 100.0
        } else {
            0.0
        };

        let triggered_sharp = sharpest_move.abs() >= pct_15m;
        let triggered_60m = move_60m.abs() >= pct_60m;
        if !(triggered_sharp || triggered_60m) {
            return None;
        }

        let (strength, confidence, move_pct, mut reason) = if triggered_sharp && triggered_60m {
            (0.8, 0.85, sharpest_move, format!("price move {sharpest_move:+.1}% (1h) - exceeds both {regime} thresholds"))
        } else if triggered_sharp {
            (0.6, 0.7, sharpest_move, format!("sharp price move {sharpest_move:+.1}% (1h) - exceeds {pct_15m}% ({regime})"))
        } else {
            (0.7, 0.75, move_60m, format!("sustained price move {move_60m:+.1}% (60m) - exceeds {pct_60m}% ({regime})"))
        };
        if !reason_suffix.is_empty() {
            reason = format!("{reason} {reason_suffix}");
        }

        Some(TriggerSignal {
            symbol: asset.symbol.clone(),
            kind: TriggerKind::PriceMove,
            strength,
            confidence,
            reason,
            timestamp: now,
            current_price,
            volume_ratio: None,
            price_change_pct: Some(move_pct),
            volatility: Some(annualized_volatility(candles)),
            qualifiers: BTreeMap::new(),
            metrics: BTreeMap::new(),
        })
    }

    fn check_volume_spike(
        &self,
        asset: &UniverseAsset,
        candles: &[Candle],
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Option<TriggerSignal> {
        if candles.len() < 24 {
            return None;
        }
        let threshold = self.config.thresholds(regime).volume_ratio_1h;

        let current_volume = candles[candles.len() - 1].volume;
        let avg_hourly: f64 =
            candles[candles.len() - 24..].iter().map(|c| c.volume).sum::<f64>() / 24.0;
        if avg_hourly == 0.0 {
            return None;
        }

        let volume_ratio = current_volume / avg_hourly;
        if volume_ratio < threshold {
            return None;
        }

        let strength = ((volume_ratio - 1.0) / 3.0).min(1.0);
        let confidence = (volume_ratio / 4.0).min(1.0);

        // Direction consumers need the accompanying price change
        let prev_close = candles[candles.len() - 2].close;
        let price_change_pct = if prev_close > 0.0 {
            Some((candles[candles.len() - 1].close - prev_close) / prev_close * 100.0)
        } else {
            None
        };

        Some(TriggerSignal {
            symbol: asset.symbol.clone(),
            kind: TriggerKind::VolumeSpike,
            strength,
            confidence,
            reason: format!(
                "volume {volume_ratio:.2}x avg hourly (1h: ${current_volume:.0} vs 24h avg: ${avg_hourly:.0})"
            ),
            timestamp: now,
            current_price: candles[candles.len() - 1].close,
            volume_ratio: Some(volume_ratio),
            price_change_pct,
            volatility: Some(annualized_volatility(candles)),
            qualifiers: BTreeMap::new(),
            metrics: BTreeMap::new(),
        })
    }

    fn check_breakout(
        &self,
        asset: &UniverseAsset,
        candles: &[Candle],
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Option<TriggerSignal> {
        let lookback = self.config.breakout_lookback_hours;
        if candles.len() < lookback {
            return None;
        }

        let window = &candles[candles.len() - lookback..];
        let current_price = window[window.len() - 1].close;
        let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = window.iter().filter(|c| c.low > 0.0).map(|c| c.low).fold(f64::MAX, f64::min);
        if high <= low || low == f64::MAX {
            return None;
        }

        let volatility = annualized_volatility(candles);

        // New high within a 0.5% band
        if current_price >= high * 0.995 {
            return Some(TriggerSignal {
                symbol: asset.symbol.clone(),
                kind: TriggerKind::Breakout,
                strength: 0.7,
                confidence: 0.8,
                reason: format!("breaking {lookback}h high (${current_price:.2} near ${high:.2})"),
                timestamp: now,
                current_price,
                volume_ratio: None,
                price_change_pct: Some((current_price - low) / low * 100.0),
                volatility: Some(volatility),
                qualifiers: BTreeMap::new(),
                metrics: BTreeMap::new(),
            });
        }

        // Recovery from the low (V-shape)
        if current_price <= low * 1.10 {
            let recovery = (current_price - low) / low;
            if recovery > 0.05 {
                let (mut qualifiers, mut metrics) = self.reversal_confirmations(candles);
                metrics.insert("reversal_recovery_pct".to_string(), recovery * 100.0);

                let (trend_ok, trend_reason, trend_metrics) =
                    self.trend_filter(candles, regime);
                metrics.extend(trend_metrics);
                if !trend_ok {
                    debug!("{}: {trend_reason}", asset.symbol);
                    return None;
                }
                if self.config.trend_filter.enabled {
                    qualifiers.insert("trend_filter_passed".to_string(), true);
                }

                return Some(TriggerSignal {
                    symbol: asset.symbol.clone(),
                    kind: TriggerKind::Reversal,
                    strength: (recovery / 0.20).min(1.0),
                    confidence: 0.6,
                    reason: format!(
                        "recovering from {lookback}h low (+{:.1}% from ${low:.2})",
                        recovery * 100.0
                    ),
                    timestamp: now,
                    current_price,
                    volume_ratio: None,
                    price_change_pct: Some(recovery * 100.0),
                    volatility: Some(volatility),
                    qualifiers,
                    metrics,
                });
            }
        }

        None
    }

    /// Confirmation qualifiers stamped onto reversal signals. They are not
    /// gates: strategies consume them as conviction-boost inputs.
    fn reversal_confirmations(
        &self,
        candles: &[Candle],
    ) -> (BTreeMap<String, bool>, BTreeMap<String, f64>) {
        let config = &self.config.reversal_confirm;
        let mut qualifiers = BTreeMap::new();
        let mut metrics = BTreeMap::new();
        let last_close = candles[candles.len() - 1].close;

        if config.close_above_vwap {
            let window_start = candles.len().saturating_sub(config.vwap_window_hours);
            match vwap(&candles[window_start..]) {
                Some(value) => {
                    qualifiers.insert("reversal_close_above_vwap".to_string(), last_close > value);
                    metrics.insert("reversal_vwap".to_string(), value);
                }
                None => {
                    qualifiers.insert("reversal_close_above_vwap".to_string(), false);
                }
            }
        }

        if config.higher_low_vs_prev {
            let pivots = pivot_lows(candles, 48, 2);
            if pivots.len() >= 2 {
                let last = pivots[pivots.len() - 1];
                let prev = pivots[pivots.len() - 2];
                qualifiers.insert("reversal_higher_low".to_string(), last > prev);
                metrics.insert("reversal_last_pivot_low".to_string(), last);
                metrics.insert("reversal_prev_pivot_low".to_string(), prev);
            } else {
                qualifiers.insert("reversal_higher_low".to_string(), false);
            }
        }

        if config.rsi_cross_up_50 {
            let series = rsi_series(candles, 14);
            if series.len() >= 2 {
                let prev = series[series.len() - 2];
                let curr = series[series.len() - 1];
                qualifiers.insert("reversal_rsi_cross_50".to_string(), prev <= 50.0 && curr > 50.0);
                metrics.insert("reversal_rsi".to_string(), curr);
                metrics.insert("reversal_rsi_prev".to_string(), prev);
            } else {
                qualifiers.insert("reversal_rsi_cross_50".to_string(), false);
            }
        }

        if config.min_bounce_from_low_pct > 0.0 {
            let window_start = candles.len().saturating_sub(12);
            let recent = &candles[window_start..];
            let recent_low =
                recent.iter().filter(|c| c.low > 0.0).map(|c| c.low).fold(f64::MAX, f64::min);
            if recent_low < f64::MAX && last_close > 0.0 {
                let bounce_pct = (last_close - recent_low) / recent_low * 100.0;
                qualifiers.insert(
                    "reversal_bounce_confirmed".to_string(),
                    bounce_pct >= config.min_bounce_from_low_pct,
                );
                metrics.insert("reversal_bounce_pct".to_string(), bounce_pct);
            } else {
                qualifiers.insert("reversal_bounce_confirmed".to_string(), false);
            }
        }

        (qualifiers, metrics)
    }

    /// Optional EMA-slope gate for reversals: slope fail drops the signal,
    /// slope pass stamps the qualifier.
    fn trend_filter(
        &self,
        candles: &[Candle],
        regime: Regime,
    ) -> (bool, String, BTreeMap<String, f64>) {
        let config = &self.config.trend_filter;
        let mut metrics = BTreeMap::new();
        if !config.enabled {
            return (true, String::new(), metrics);
        }

        let period = config.ema_period_hours.max(1);
        let slope_lookback = config.slope_lookback_hours.max(1);
        let min_slope = config.min_slope(regime);

        if candles.len() < period + slope_lookback {
            metrics.insert("trend_filter_passed".to_string(), 0.0);
            return (
                false,
                format!("trend filter: insufficient data for EMA period {period}"),
                metrics,
            );
        }

        let mut ema = match ExponentialMovingAverage::new(period) {
            Ok(ema) => ema,
            Err(_) => return (true, String::new(), metrics),
        };
        let ema_values: Vec<f64> = candles.iter().map(|c| ema.next(c.close)).collect();
        if ema_values.len() < slope_lookback + 1 {
            metrics.insert("trend_filter_passed".to_string(), 0.0);
            return (
                false,
                format!("trend filter: insufficient EMA samples for slope lookback {slope_lookback}"),
                metrics,
            );
        }

        let current = ema_values[ema_values.len() - 1];
        let prior = ema_values[ema_values.len() - 1 - slope_lookback];
        if prior <= 0.0 {
            metrics.insert("trend_filter_passed".to_string(), 0.0);
            return (false, "trend filter: invalid prior EMA value".to_string(), metrics);
        }

        let slope_pct = (current - prior) / prior * 100.0 / slope_lookback as f64;
        metrics.insert("trend_filter_ema_period".to_string(), period as f64);
        metrics.insert("trend_filter_slope_pct_per_hr".to_string(), slope_pct);
        metrics.insert("trend_filter_ema_current".to_string(), current);
        metrics.insert("trend_filter_ema_prev".to_string(), prior);

        if slope_pct < min_slope {
            metrics.insert("trend_filter_passed".to_string(), 0.0);
            return (
                false,
                format!("trend filter: EMA slope {slope_pct:.3}%/h < {min_slope:.3}%/h requirement"),
                metrics,
            );
        }
        metrics.insert("trend_filter_passed".to_string(), 1.0);
        (true, String::new(), metrics)
    }

    fn check_momentum(
        &self,
        asset: &UniverseAsset,
        candles: &[Candle],
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Option<TriggerSignal> {
        if candles.len() < 24 {
            return None;
        }

        let price_24h_ago = candles[candles.len() - 24].close;
        let current_price = candles[candles.len() - 1].close;
        if price_24h_ago <= 0.0 {
            return None;
        }
        let return_24h = (current_price - price_24h_ago) / price_24h_ago;

        if return_24h.abs() * 100.0 < self.config.momentum_min_return_pct {
            return None;
        }
        if self.config.only_upside && return_24h < 0.0 {
            return None;
        }
        // Down-regimes suppress up-momentum entries
        if matches!(regime, Regime::Bear | Regime::Crash) && return_24h > 0.0 {
            return None;
        }

        let strength = (return_24h.abs() / 0.10).min(1.0);

        // Confidence: fraction of the last 12 hours moving the same direction
        let recent = &candles[candles.len() - 13..];
        let mut same_direction = 0usize;
        let mut counted = 0usize;
        for pair in recent.windows(2) {
            if pair[0].close <= 0.0 {
                continue;
            }
            counted += 1;
            let hourly = (pair[1].close - pair[0].close) / pair[0].close;
            if (hourly > 0.0) == (return_24h > 0.0) {
                same_direction += 1;
            }
        }
        let confidence = if counted > 0 { same_direction as f64 / counted as f64 } else { 0.0 };

        let direction = if return_24h > 0.0 { "up" } else { "down" };
        Some(TriggerSignal {
            symbol: asset.symbol.clone(),
            kind: TriggerKind::Momentum,
            strength,
            confidence,
            reason: format!("momentum {direction} ({:+.1}% in 24h)", return_24h * 100.0),
            timestamp: now,
            current_price,
            volume_ratio: None,
            price_change_pct: Some(return_24h * 100.0),
            volatility: Some(annualized_volatility(candles)),
            qualifiers: BTreeMap::new(),
            metrics: BTreeMap::new(),
        })
    }
}

/// Simple-average ATR over `period`, expressed as a percent of the last close.
fn atr_pct(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < period + 1 {
        return 0.0;
    }
    let start = candles.len() - period;
    let mut sum = 0.0;
    for i in start..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;
        let tr = (high - low).max((high - prev_close).abs()).max((low - prev_close).abs());
        sum += tr;
    }
    let atr = sum / period as f64;
    let current = candles[candles.len() - 1].close;
    if current <= 0.0 {
        return 0.0;
    }
    atr / current * 100.0
}

/// Annualized volatility from hourly returns, capped at 200 to keep sizing
/// sane on extreme outliers.
fn annualized_volatility(candles: &[Candle]) -> f64 {
    if candles.len() < 24 {
        return 50.0;
    }
    let lookback = 168.min(candles.len() - 1);
    let returns: Vec<f64> = candles[candles.len() - 1 - lookback..]
        .windows(2)
        .filter(|pair| pair[0].close > 0.0)
        .map(|pair| (pair[1].close - pair[0].close) / pair[0].close)
        .collect();
    if returns.is_empty() {
        return 50.0;
    }
    let hourly_vol = returns.population_std_dev();
    (hourly_vol * (24.0 * 365.0f64).sqrt() * 100.0).min(200.0)
}

fn vwap(candles: &[Candle]) -> Option<f64> {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for candle in candles {
        let typical = (candle.high + candle.low + candle.close) / 3.0;
        numerator += typical * candle.volume;
        denominator += candle.volume;
    }
    (denominator > 0.0).then(|| numerator / denominator)
}

/// Lows flanked by `window` higher lows on each side, newest last, capped at
/// the three most recent.
fn pivot_lows(candles: &[Candle], lookback: usize, window: usize) -> Vec<f64> {
    if candles.is_empty() {
        return Vec::new();
    }
    let start = candles.len().saturating_sub(lookback);
    let mut pivots = Vec::new();
    for idx in (start + window)..candles.len().saturating_sub(window) {
        let low = candles[idx].low;
        let left_ok = (1..=window).all(|offset| low <= candles[idx - offset].low);
        let right_ok = (1..=window).all(|offset| low < candles[idx + offset].low);
        if left_ok && right_ok {
            pivots.push(low);
        }
    }
    let keep = pivots.len().saturating_sub(3);
    pivots.split_off(keep)
}

fn rsi_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if candles.len() < period + 1 {
        return Vec::new();
    }
    let mut rsi = match RelativeStrengthIndex::new(period) {
        Ok(rsi) => rsi,
        Err(_) => return Vec::new(),
    };
    candles.iter().map(|c| rsi.next(c.close)).collect()
}
