//! Swing-pivot support/resistance detection.
//!
//! Pivots are local extrema over a symmetric span of candles. A pivot only
//! becomes *visible* once its right-hand confirmation window has closed, so
//! every pivot carries a `confirmed_at` timestamp and level construction
//! filters on it. That is what keeps backtest evaluations from seeing levels
//! formed by future candles.

use crate::domain::candle::Candle;
use crate::domain::levels::{LevelKind, NearbyLevels, PriceLevel};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PivotPoint {
    pub kind: LevelKind,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    /// When the pivot's right-hand window closed and it became observable.
    pub confirmed_at: DateTime<Utc>,
    pub volume: f64,
}

/// Scans the full series once. `span` candles on each side must be strictly
/// lower (resistance) or higher (support) for an extremum to qualify.
pub fn detect_pivots(candles: &[Candle], span: usize) -> Vec<PivotPoint> {
    let mut pivots = Vec::new();
    if candles.len() < span * 2 + 1 {
        return pivots;
    }

    for i in span..candles.len() - span {
        let confirmed_at = candles[i + span].timestamp;
        let window = &candles[i - span..=i + span];

        let high = candles[i].high;
        if window.iter().enumerate().all(|(j, c)| j == span || c.high < high) {
            pivots.push(PivotPoint {
                kind: LevelKind::Resistance,
                price: high,
                timestamp: candles[i].timestamp,
                confirmed_at,
                volume: candles[i].volume,
            });
        }

        let low = candles[i].low;
        if window.iter().enumerate().all(|(j, c)| j == span || c.low > low) {
            pivots.push(PivotPoint {
                kind: LevelKind::Support,
                price: low,
                timestamp: candles[i].timestamp,
                confirmed_at,
                volume: candles[i].volume,
            });
        }
    }
    pivots
}

/// Clusters pivots visible at `as_of` into horizontal levels. Pivots of the
/// same kind within `merge_pct` of each other merge; strength grows with the
/// touch count.
pub fn build_levels(
    pivots: &[PivotPoint],
    as_of: DateTime<Utc>,
    merge_pct: f64,
) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = Vec::new();

    for pivot in pivots.iter().filter(|p| p.confirmed_at <= as_of) {
        let merged = levels.iter_mut().find(|level| {
            level.kind == pivot.kind
                && (level.price - pivot.price).abs() / level.price <= merge_pct
        });

        match merged {
            Some(level) => {
                // Weighted toward the established price.
                level.price = (level.price * level.touches as f64 + pivot.price)
                    / (level.touches as f64 + 1.0);
                level.touches += 1;
                level.strength = strength_for(level.touches);
                if pivot.confirmed_at > level.confirmed_at {
                    level.confirmed_at = pivot.confirmed_at;
                }
            }
            None => levels.push(PriceLevel {
                kind: pivot.kind,
                price: pivot.price,
                strength: strength_for(1),
                touches: 1,
                confirmed_at: pivot.confirmed_at,
            }),
        }
    }
    levels
}

fn strength_for(touches: u32) -> f64 {
    (0.4 + 0.15 * (touches.saturating_sub(1)) as f64).min(1.0)
}

/// Splits levels into supports below and resistances above `price`, nearest
/// first, keeping only levels at or above the given strength floors.
pub fn nearby_levels(
    levels: &[PriceLevel],
    price: f64,
    min_support_strength: f64,
    min_resistance_strength: f64,
) -> NearbyLevels {
    let mut supports: Vec<PriceLevel> = levels
        .iter()
        .filter(|l| {
            l.kind == LevelKind::Support && l.price < price && l.strength >= min_support_strength
        })
        .cloned()
        .collect();
    let mut resistances: Vec<PriceLevel> = levels
        .iter()
        .filter(|l| {
            l.kind == LevelKind::Resistance
                && l.price > price
                && l.strength >= min_resistance_strength
        })
        .cloned()
        .collect();

    supports.sort_by(|a, b| b.price.total_cmp(&a.price));
    resistances.sort_by(|a, b| a.price.total_cmp(&b.price));

    NearbyLevels {
        supports,
        resistances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn series(prices: &[f64]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle {
                timestamp: base + Duration::hours(i as i64),
                open: p,
                high: p * 1.005,
                low: p * 0.995,
                close: p,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn test_detects_peak_and_trough() {
        let candles = series(&[100.0, 101.0, 105.0, 101.0, 100.0, 96.0, 100.0, 101.0, 102.0]);
        let pivots = detect_pivots(&candles, 2);

        assert!(pivots.iter().any(|p| p.kind == LevelKind::Resistance
            && (p.price - 105.0 * 1.005).abs() < 1e-9));
        assert!(
            pivots
                .iter()
                .any(|p| p.kind == LevelKind::Support && (p.price - 96.0 * 0.995).abs() < 1e-9)
        );
    }

    #[test]
    fn test_pivot_confirmation_lags_formation() {
        let candles = series(&[100.0, 101.0, 105.0, 101.0, 100.0]);
        let pivots = detect_pivots(&candles, 2);
        let peak = pivots
            .iter()
            .find(|p| p.kind == LevelKind::Resistance)
            .unwrap();
        assert_eq!(peak.timestamp, candles[2].timestamp);
        assert_eq!(peak.confirmed_at, candles[4].timestamp);
    }

    #[test]
    fn test_levels_respect_as_of() {
        let candles = series(&[100.0, 101.0, 105.0, 101.0, 100.0]);
        let pivots = detect_pivots(&candles, 2);
        // Before the confirmation candle the level must be invisible.
        let early = build_levels(&pivots, candles[3].timestamp, 0.003);
        assert!(early.is_empty());
        let late = build_levels(&pivots, candles[4].timestamp, 0.003);
        assert_eq!(late.len(), 1);
    }

    #[test]
    fn test_touches_increase_strength() {
        let candles = series(&[
            100.0, 101.0, 105.0, 101.0, 100.0, 101.0, 105.1, 101.0, 100.0,
        ]);
        let pivots = detect_pivots(&candles, 2);
        let levels = build_levels(&pivots, candles.last().unwrap().timestamp, 0.01);
        let resistance = levels
            .iter()
            .find(|l| l.kind == LevelKind::Resistance)
            .unwrap();
        assert_eq!(resistance.touches, 2);
        assert!(resistance.strength > strength_for(1));
    }

    #[test]
    fn test_nearby_filters_by_strength_and_side() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mk = |kind, price, strength| PriceLevel {
            kind,
            price,
            strength,
            touches: 1,
            confirmed_at: at,
        };
        let levels = vec![
            mk(LevelKind::Support, 95.0, 0.8),
            mk(LevelKind::Support, 98.0, 0.3),
            mk(LevelKind::Resistance, 104.0, 0.7),
            mk(LevelKind::Resistance, 99.0, 0.9), // below price, dropped
        ];
        let nearby = nearby_levels(&levels, 100.0, 0.6, 0.6);
        assert_eq!(nearby.supports.len(), 1);
        assert_eq!(nearby.supports[0].price, 95.0);
        assert_eq!(nearby.resistances.len(), 1);
        assert_eq!(nearby.resistances[0].price, 104.0);
    }
}
