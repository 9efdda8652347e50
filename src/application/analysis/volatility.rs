//! Rolling volatility and true-range series, precomputed once per task.
//!
//! Each series is aligned index-for-index with the candle series and the
//! value at index `i` uses only candles `<= i`, so an as-of slice can read
//! the last element without leaking future data.

use crate::domain::candle::Candle;
use statrs::statistics::Statistics;
use ta::Next;
use ta::indicators::AverageTrueRange;

/// Rolling standard deviation of simple returns over `window` observations.
/// Entries before the window fills are NaN.
pub fn rolling_volatility(candles: &[Candle], window: usize) -> Vec<f64> {
    let mut returns = Vec::with_capacity(candles.len());
    returns.push(f64::NAN);
    for pair in candles.windows(2) {
        let prev = pair[0].close;
        returns.push(if prev > 0.0 {
            (pair[1].close - prev) / prev
        } else {
            f64::NAN
        });
    }

    let mut series = vec![f64::NAN; candles.len()];
    for i in 0..candles.len() {
        if i + 1 < window + 1 {
            continue;
        }
        let slice = &returns[i + 1 - window..=i];
        if slice.iter().any(|r| r.is_nan()) {
            continue;
        }
        series[i] = slice.std_dev();
    }
    series
}

/// Average true range as a fraction of the close, via the `ta` indicator.
pub fn atr_pct_series(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut atr = match AverageTrueRange::new(period) {
        Ok(atr) => atr,
        Err(_) => return vec![f64::NAN; candles.len()],
    };

    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let item = ta::DataItem::builder()
                .open(c.open)
                .high(c.high)
                .low(c.low)
                .close(c.close)
                .volume(c.volume)
                .build();
            match item {
                Ok(item) => {
                    let value = atr.next(&item);
                    if i + 1 < period || c.close <= 0.0 {
                        f64::NAN
                    } else {
                        value / c.close
                    }
                }
                Err(_) => f64::NAN,
            }
        })
        .collect()
}

/// Relative change of volatility across the trailing window; positive means
/// volatility is rising.
pub fn volatility_trend(series: &[f64], end: usize, lookback: usize) -> Option<f64> {
    if end == 0 || end > series.len() {
        return None;
    }
    let now = series[end - 1];
    let then_idx = end.checked_sub(lookback + 1)?;
    let then = series[then_idx];
    if !now.is_finite() || !then.is_finite() || then == 0.0 {
        return None;
    }
    Some((now - then) / then)
}
