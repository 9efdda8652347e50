//! BTC reference-series correlation.
//!
//! The asset's returns are aligned with BTC's by candle timestamp and the
//! Pearson coefficient is computed over the overlap. Too little overlap is a
//! hard "insufficient" verdict; the caller early-exits rather than
//! interpolating the missing stretch.

use crate::domain::candle::Candle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationAssessment {
    /// Pearson coefficient in [-1, 1].
    pub correlation: f64,
    pub overlap_points: usize,
    /// Estimated impact of a BTC move on this instrument, in [0, 1].
    pub impact: f64,
}

/// `None` when the aligned overlap is below `min_overlap_points`.
pub fn assess(
    asset: &[Candle],
    btc: &[Candle],
    min_overlap_points: usize,
) -> Option<CorrelationAssessment> {
    let btc_by_ts: BTreeMap<i64, f64> = btc
        .iter()
        .map(|c| (c.timestamp.timestamp(), c.close))
        .collect();

    let mut asset_closes = Vec::new();
    let mut btc_closes = Vec::new();
    for candle in asset {
        if let Some(&btc_close) = btc_by_ts.get(&candle.timestamp.timestamp()) {
            asset_closes.push(candle.close);
            btc_closes.push(btc_close);
        }
    }

    if asset_closes.len() < min_overlap_points + 1 {
        return None;
    }

    let asset_returns = returns(&asset_closes);
    let btc_returns = returns(&btc_closes);
    let correlation = pearson(&asset_returns, &btc_returns);

    Some(CorrelationAssessment {
        correlation,
        overlap_points: asset_closes.len(),
        impact: correlation.abs(),
    })
}

fn returns(closes: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(closes.len().saturating_sub(1));
    for pair in closes.windows(2) {
        if pair[0] != 0.0 {
            out.push((pair[1] - pair[0]) / pair[0]);
        }
    }
    out
}

fn pearson(v1: &[f64], v2: &[f64]) -> f64 {
    let len = v1.len().min(v2.len());
    if len < 2 {
        return 0.0;
    }
    let v1 = &v1[..len];
    let v2 = &v2[..len];

    let mean1 = v1.iter().sum::<f64>() / len as f64;
    let mean2 = v2.iter().sum::<f64>() / len as f64;

    let mut numer = 0.0;
    let mut denom1 = 0.0;
    let mut denom2 = 0.0;
    for i in 0..len {
        let d1 = v1[i] - mean1;
        let d2 = v2[i] - mean2;
        numer += d1 * d2;
        denom1 += d1 * d1;
        denom2 += d2 * d2;
    }
    if denom1 == 0.0 || denom2 == 0.0 {
        return 0.0;
    }
    numer / (denom1.sqrt() * denom2.sqrt())
}
