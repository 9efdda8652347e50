//! Per-task cached market data and derived artifacts.
//!
//! One `PreparedData` is built per task: the full OHLCV series, a timestamp
//! index, pre-detected swing pivots, volatility/ATR series, the BTC
//! reference series, and the fitted ML model. Gates and decision steps never
//! touch the raw series; they go through `as_of(T)` which exposes only rows
//! with timestamp <= T. There deliberately is no `all()` accessor.

use crate::application::analysis::support_resistance::{
    self, PivotPoint,
};
use crate::application::analysis::volatility;
use crate::application::ml::{RangePredictor};
use crate::config::defaults::CentralDefaults;
use crate::domain::candle::{Candle, Symbol};
use crate::domain::errors::AnalysisError;
use crate::domain::levels::{NearbyLevels, PriceLevel};
use crate::domain::timeframe::Timeframe;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Tolerances of the flexible candle matcher, in minutes. An evaluation
/// timepoint inside a data gap matches the nearest candle within ±5, then
/// ±15, then ±30 minutes; beyond that the data is treated as missing.
pub const MATCH_TOLERANCES_MIN: [i64; 3] = [5, 15, 30];

pub struct PreparedData {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    candles: Vec<Candle>,
    btc_candles: Vec<Candle>,
    pivots: Vec<PivotPoint>,
    vol_series: Vec<f64>,
    atr_series: Vec<f64>,
    predictor: Option<RangePredictor>,
    level_merge_pct: f64,
    vol_window: usize,
}

impl PreparedData {
    /// Builds every derived artifact. The predictor is fitted only on
    /// candles that end `label_horizon` before `first_eval`; when that
    /// stretch is too short the task carries no model and ML gates exit
    /// early instead of guessing.
    pub fn prepare(
        symbol: Symbol,
        timeframe: Timeframe,
        candles: Vec<Candle>,
        btc_candles: Vec<Candle>,
        defaults: &CentralDefaults,
        first_eval: DateTime<Utc>,
    ) -> Result<Self, AnalysisError> {
        if candles.is_empty() {
            return Err(AnalysisError::insufficient_data("task_window", 0, 1));
        }
        debug_assert!(
            candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp),
            "provider must return an ascending series"
        );

        let pivots =
            support_resistance::detect_pivots(&candles, defaults.support_resistance.pivot_span);
        let vol_window = defaults.volatility.window;
        let vol_series = volatility::rolling_volatility(&candles, vol_window);
        let atr_series = volatility::atr_pct_series(&candles, vol_window);

        let training_end = candles
            .partition_point(|c| c.timestamp < first_eval)
            .saturating_sub(defaults.ml.label_horizon);
        let predictor = match RangePredictor::fit(&candles[..training_end], &defaults.ml) {
            Ok(predictor) => Some(predictor),
            Err(AnalysisError::InsufficientMarketData { rows, required, .. }) => {
                warn!(
                    "No ML model for {}@{}: {} training rows, need {}",
                    symbol, timeframe, rows, required
                );
                None
            }
            Err(other) => return Err(other),
        };

        debug!(
            "Prepared {}@{}: {} candles, {} pivots, model={}",
            symbol,
            timeframe,
            candles.len(),
            pivots.len(),
            predictor.is_some()
        );

        Ok(Self {
            symbol,
            timeframe,
            candles,
            btc_candles,
            pivots,
            vol_series,
            atr_series,
            predictor,
            level_merge_pct: defaults.support_resistance.level_merge_pct,
            vol_window,
        })
    }

    pub fn first_timestamp(&self) -> DateTime<Utc> {
        self.candles[0].timestamp
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Full series for post-hoc exit simulation in the recorder. Gates and
    /// decision steps must not call this; they go through `as_of`.
    pub fn diagnostics_series(&self) -> &[Candle] {
        &self.candles
    }

    /// Flexible matcher: the index of the candle whose open time is nearest
    /// to `at` within the tightest satisfiable tolerance tier.
    pub fn match_candle(&self, at: DateTime<Utc>) -> Option<usize> {
        let idx = self.candles.partition_point(|c| c.timestamp <= at);
        let mut best: Option<(i64, usize)> = None;
        for candidate in [idx.checked_sub(1), Some(idx)].into_iter().flatten() {
            if let Some(candle) = self.candles.get(candidate) {
                let distance = (candle.timestamp - at).num_minutes().abs();
                if best.is_none_or(|(d, _)| distance < d) {
                    best = Some((distance, candidate));
                }
            }
        }
        let (distance, index) = best?;
        MATCH_TOLERANCES_MIN
            .iter()
            .any(|&tol| distance <= tol)
            .then_some(index)
    }

    /// The view of everything visible at time `at`. Returns `None` when no
    /// candle matches within the widest tolerance (a data gap). When the
    /// matcher lands on a neighboring candle the view pins itself to that
    /// candle's open time, so "nothing after T" stays exact.
    pub fn as_of(&self, at: DateTime<Utc>) -> Option<DataView<'_>> {
        let index = self.match_candle(at)?;
        Some(DataView {
            data: self,
            end: index + 1,
            at: self.candles[index].timestamp,
        })
    }
}

/// Borrowed slice of the prepared data at one evaluation timepoint. All
/// accessors are bounded by the view's end index; nothing after `at` is
/// reachable through this type.
pub struct DataView<'a> {
    data: &'a PreparedData,
    /// Exclusive end index into the candle series.
    end: usize,
    at: DateTime<Utc>,
}

impl<'a> DataView<'a> {
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn candles(&self) -> &'a [Candle] {
        &self.data.candles[..self.end]
    }

    pub fn len(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// The evaluation candle itself (the last one visible).
    pub fn current(&self) -> &'a Candle {
        &self.data.candles[self.end - 1]
    }

    pub fn current_index(&self) -> usize {
        self.end - 1
    }

    /// Reference price for this evaluation: the open of the candle at T.
    /// The close of the same candle is future information for entry
    /// decisions and is only read by post-hoc exit simulation.
    pub fn reference_price(&self) -> f64 {
        self.current().open
    }

    /// Rolling volatility at T, if the window has filled.
    pub fn volatility(&self) -> Option<f64> {
        let v = *self.data.vol_series.get(self.end - 1)?;
        v.is_finite().then_some(v)
    }

    pub fn atr_pct(&self) -> Option<f64> {
        let v = *self.data.atr_series.get(self.end - 1)?;
        v.is_finite().then_some(v)
    }

    /// Relative volatility change over the trailing window.
    pub fn volatility_trend(&self) -> Option<f64> {
        volatility::volatility_trend(&self.data.vol_series, self.end, self.data.vol_window / 2)
    }

    /// Levels confirmed at or before T.
    pub fn levels(&self) -> Vec<PriceLevel> {
        support_resistance::build_levels(&self.data.pivots, self.at, self.data.level_merge_pct)
    }

    pub fn nearby_levels(
        &self,
        min_support_strength: f64,
        min_resistance_strength: f64,
    ) -> NearbyLevels {
        support_resistance::nearby_levels(
            &self.levels(),
            self.reference_price(),
            min_support_strength,
            min_resistance_strength,
        )
    }

    /// BTC reference candles visible at T.
    pub fn btc_candles(&self) -> &'a [Candle] {
        let end = self
            .data
            .btc_candles
            .partition_point(|c| c.timestamp <= self.at);
        &self.data.btc_candles[..end]
    }

    /// BTC candles restricted to the same trailing window as the asset view.
    pub fn btc_window(&self, lookback: Duration) -> &'a [Candle] {
        let candles = self.btc_candles();
        let cutoff = self.at - lookback;
        let start = candles.partition_point(|c| c.timestamp < cutoff);
        &candles[start..]
    }

    pub fn predictor(&self) -> Option<&'a RangePredictor> {
        self.data.predictor.as_ref()
    }

    /// Detects a missing neighbor candle right before T (local gap).
    pub fn has_local_gap(&self, lookback_candles: usize) -> bool {
        if self.end < 2 {
            return false;
        }
        let step = self.data.timeframe.seconds();
        let start = self.end.saturating_sub(lookback_candles + 1);
        self.data.candles[start..self.end]
            .windows(2)
            .any(|w| (w[1].timestamp - w[0].timestamp).num_seconds() > 2 * step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hourly_series(n: usize) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.37).sin() * 4.0;
                Candle {
                    timestamp: base + Duration::hours(i as i64),
                    open: close * 0.999,
                    high: close * 1.004,
                    low: close * 0.995,
                    close,
                    volume: 120.0,
                }
            })
            .collect()
    }

    fn prepared(candles: Vec<Candle>) -> PreparedData {
        let defaults = CentralDefaults::embedded().unwrap();
        let first_eval = candles[candles.len() / 2].timestamp;
        PreparedData::prepare(
            Symbol::parse("TEST").unwrap(),
            Timeframe::OneHour,
            candles,
            vec![],
            &defaults,
            first_eval,
        )
        .unwrap()
    }

    #[test]
    fn test_as_of_never_exposes_future_candles() {
        let data = prepared(hourly_series(600));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let at = base + Duration::hours(300);
        let view = data.as_of(at).unwrap();
        assert!(view.candles().iter().all(|c| c.timestamp <= at));
        assert_eq!(view.current().timestamp, at);
    }

    #[test]
    fn test_reference_price_is_open() {
        let data = prepared(hourly_series(600));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let view = data.as_of(base + Duration::hours(100)).unwrap();
        assert_eq!(view.reference_price(), view.current().open);
        assert_ne!(view.reference_price(), view.current().close);
    }

    #[test]
    fn test_flexible_matcher_tolerates_small_offsets() {
        let data = prepared(hourly_series(600));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // 12 minutes past the hour: matches within the ±15m tier.
        let view = data.as_of(base + Duration::hours(50) + Duration::minutes(12));
        assert!(view.is_some());
    }

    #[test]
    fn test_matcher_rejects_beyond_widest_tolerance() {
        let mut candles = hourly_series(600);
        // Carve a 12-hour hole around hour 300.
        candles.retain(|c| {
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let h = (c.timestamp - base).num_hours();
            !(295..307).contains(&h)
        });
        let data = prepared(candles);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(data.as_of(base + Duration::hours(300)).is_none());
        // Mid-gap but within 30m of the gap edge still matches.
        assert!(
            data.as_of(base + Duration::hours(294) + Duration::minutes(25))
                .is_some()
        );
    }

    #[test]
    fn test_local_gap_detection() {
        let mut candles = hourly_series(200);
        candles.retain(|c| {
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let h = (c.timestamp - base).num_hours();
            !(100..104).contains(&h)
        });
        let data = prepared(candles);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let view = data.as_of(base + Duration::hours(105)).unwrap();
        assert!(view.has_local_gap(5));
        let clean = data.as_of(base + Duration::hours(50)).unwrap();
        assert!(!clean.has_local_gap(5));
    }

    #[test]
    fn test_levels_shrink_with_earlier_as_of() {
        let data = prepared(hourly_series(600));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let early = data.as_of(base + Duration::hours(60)).unwrap().levels();
        let late = data.as_of(base + Duration::hours(580)).unwrap().levels();
        let early_touches: u32 = early.iter().map(|l| l.touches).sum();
        let late_touches: u32 = late.iter().map(|l| l.touches).sum();
        assert!(late_touches > early_touches);
    }
}
