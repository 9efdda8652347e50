//! Feature extraction for the range predictor.
//!
//! Every feature at index `i` is computed from candles `<= i` only. When the
//! history is too short to fill the window the extractor returns `None`; the
//! caller must treat that as "no features", never substitute neutral values.

use crate::domain::candle::Candle;

pub const FEATURE_COUNT: usize = 8;

/// Feature vector at candle `idx`, or `None` when fewer than `window`
/// candles precede it.
pub fn compute(candles: &[Candle], idx: usize, window: usize) -> Option<[f64; FEATURE_COUNT]> {
    if idx >= candles.len() || idx + 1 < window || window < 4 {
        return None;
    }
    let slice = &candles[idx + 1 - window..=idx];
    let last = &slice[slice.len() - 1];
    let prev = &slice[slice.len() - 2];
    if last.close <= 0.0 || prev.close <= 0.0 {
        return None;
    }

    let closes: Vec<f64> = slice.iter().map(|c| c.close).collect();
    let mean_close = closes.iter().sum::<f64>() / closes.len() as f64;
    let high = slice.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = slice.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    if mean_close <= 0.0 || high <= low {
        return None;
    }

    let return_1 = (last.close - prev.close) / prev.close;
    let return_window = (last.close - closes[0]) / closes[0];

    let mut sq_sum = 0.0;
    for pair in closes.windows(2) {
        let r = (pair[1] - pair[0]) / pair[0];
        sq_sum += r * r;
    }
    let vol = (sq_sum / (closes.len() - 1) as f64).sqrt();

    let mean_volume =
        slice.iter().map(|c| c.volume).sum::<f64>() / slice.len() as f64;
    let volume_ratio = if mean_volume > 0.0 {
        last.volume / mean_volume
    } else {
        return None;
    };

    let range_position = (last.close - low) / (high - low);
    let distance_to_high = (high - last.close) / last.close;
    let distance_to_low = (last.close - low) / last.close;
    let momentum = (last.close - mean_close) / mean_close;

    let features = [
        return_1,
        return_window,
        vol,
        volume_ratio,
        range_position,
        distance_to_high,
        distance_to_low,
        momentum,
    ];
    if features.iter().any(|f| !f.is_finite()) {
        return None;
    }
    Some(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(closes: &[f64]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp: base + Duration::hours(i as i64),
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn test_insufficient_history_is_none() {
        let candles = series(&[100.0, 101.0, 102.0]);
        assert!(compute(&candles, 2, 10).is_none());
    }

    #[test]
    fn test_features_finite_and_sized() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let candles = series(&closes);
        let features = compute(&candles, 29, 20).unwrap();
        assert_eq!(features.len(), FEATURE_COUNT);
        assert!(features.iter().all(|f| f.is_finite()));
    }

    #[test]
    fn test_range_position_bounds() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let candles = series(&closes);
        let features = compute(&candles, 29, 20).unwrap();
        // Monotonic rise: last close sits near the top of its range.
        assert!(features[4] > 0.9);
    }

    #[test]
    fn test_no_future_candles_consulted() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.3).cos()).collect();
        let candles = series(&closes);
        let at_25 = compute(&candles, 25, 20).unwrap();
        // Truncating everything after idx must not change the features.
        let truncated = &candles[..26];
        let again = compute(truncated, 25, 20).unwrap();
        assert_eq!(at_25, again);
    }
}
