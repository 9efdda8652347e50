//! Trend, volatility, and anomaly assessment at one evaluation timepoint.
//!
//! Missing inputs are reported, never defaulted: an unresolvable component
//! becomes an early exit upstream.

use crate::domain::candle::Candle;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub trend: Trend,
    pub volatility: f64,
    pub anomaly: bool,
}

const FAST_SMA: usize = 10;
const SLOW_SMA: usize = 30;
const TREND_BAND: f64 = 0.004;

/// Classifies the market as of the last candle in `candles`. Returns the
/// missing component's name on failure.
pub fn assess(
    candles: &[Candle],
    volatility: Option<f64>,
    anomaly_return_pct: f64,
) -> Result<MarketContext, &'static str> {
    if candles.len() < SLOW_SMA {
        return Err("trend_window");
    }
    let volatility = match volatility {
        Some(v) if v.is_finite() => v,
        _ => return Err("volatility"),
    };

    let sma = |n: usize| -> f64 {
        let slice = &candles[candles.len() - n..];
        slice.iter().map(|c| c.close).sum::<f64>() / n as f64
    };
    let fast = sma(FAST_SMA);
    let slow = sma(SLOW_SMA);
    if slow <= 0.0 {
        return Err("trend_window");
    }

    let divergence = (fast - slow) / slow;
    let trend = if divergence > TREND_BAND {
        Trend::Bullish
    } else if divergence < -TREND_BAND {
        Trend::Bearish
    } else {
        Trend::Sideways
    };

    let last = &candles[candles.len() - 1];
    let prev = &candles[candles.len() - 2];
    let anomaly = prev.close > 0.0
        && ((last.close - prev.close) / prev.close).abs() > anomaly_return_pct;

    Ok(MarketContext {
        trend,
        volatility,
        anomaly,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(closes: Vec<f64>) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp: base + Duration::hours(i as i64),
                open: c,
                high: c * 1.002,
                low: c * 0.998,
                close: c,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn test_uptrend_classified_bullish() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let ctx = assess(&series(closes), Some(0.01), 0.2).unwrap();
        assert_eq!(ctx.trend, Trend::Bullish);
        assert!(!ctx.anomaly);
    }

    #[test]
    fn test_downtrend_classified_bearish() {
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        let ctx = assess(&series(closes), Some(0.01), 0.2).unwrap();
        assert_eq!(ctx.trend, Trend::Bearish);
    }

    #[test]
    fn test_flat_classified_sideways() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + if i % 2 == 0 { 0.1 } else { -0.1 })
            .collect();
        let ctx = assess(&series(closes), Some(0.005), 0.2).unwrap();
        assert_eq!(ctx.trend, Trend::Sideways);
    }

    #[test]
    fn test_spike_flags_anomaly() {
        let mut closes: Vec<f64> = (0..40).map(|_| 100.0).collect();
        *closes.last_mut().unwrap() = 130.0;
        let ctx = assess(&series(closes), Some(0.01), 0.2).unwrap();
        assert!(ctx.anomaly);
    }

    #[test]
    fn test_missing_inputs_error() {
        let closes: Vec<f64> = (0..10).map(|_| 100.0).collect();
        assert_eq!(assess(&series(closes), Some(0.01), 0.2), Err("trend_window"));

        let closes: Vec<f64> = (0..40).map(|_| 100.0).collect();
        assert_eq!(assess(&series(closes), None, 0.2), Err("volatility"));
        assert_eq!(
            assess(&series((0..40).map(|_| 100.0).collect()), Some(f64::NAN), 0.2),
            Err("volatility")
        );
    }
}
