use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelKind {
    Support,
    Resistance,
}

/// A horizontal price level detected from swing pivots.
///
/// `strength` is in [0, 1] and grows with touch count and volume at the
/// pivots that formed the level. `confirmed_at` is the UTC time at which the
/// last contributing pivot became visible; a level may only be consulted for
/// evaluations at or after that instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub kind: LevelKind,
    pub price: f64,
    pub strength: f64,
    pub touches: u32,
    pub confirmed_at: DateTime<Utc>,
}

impl PriceLevel {
    /// Signed distance from `price` to the level, as a fraction of `price`.
    pub fn distance_pct(&self, price: f64) -> f64 {
        if price > 0.0 {
            (self.price - price) / price
        } else {
            f64::INFINITY
        }
    }

    /// Absolute distance fraction, for proximity bounds.
    pub fn abs_distance_pct(&self, price: f64) -> f64 {
        self.distance_pct(price).abs()
    }
}

/// The supports below and resistances above a reference price, nearest first.
#[derive(Debug, Clone, Default)]
pub struct NearbyLevels {
    pub supports: Vec<PriceLevel>,
    pub resistances: Vec<PriceLevel>,
}

impl NearbyLevels {
    pub fn nearest_support(&self) -> Option<&PriceLevel> {
        self.supports.first()
    }

    pub fn nearest_resistance(&self) -> Option<&PriceLevel> {
        self.resistances.first()
    }

    pub fn is_empty(&self) -> bool {
        self.supports.is_empty() && self.resistances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn level(kind: LevelKind, price: f64) -> PriceLevel {
        PriceLevel {
            kind,
            price,
            strength: 0.7,
            touches: 3,
            confirmed_at: Utc.timestamp_opt(1_704_067_200, 0).unwrap(),
        }
    }

    #[test]
    fn test_distance_pct() {
        let support = level(LevelKind::Support, 95.0);
        assert!((support.distance_pct(100.0) + 0.05).abs() < 1e-12);
        assert!((support.abs_distance_pct(100.0) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_nearby_levels_nearest() {
        let nearby = NearbyLevels {
            supports: vec![level(LevelKind::Support, 98.0), level(LevelKind::Support, 90.0)],
            resistances: vec![level(LevelKind::Resistance, 104.0)],
        };
        assert_eq!(nearby.nearest_support().unwrap().price, 98.0);
        assert_eq!(nearby.nearest_resistance().unwrap().price, 104.0);
        assert!(!nearby.is_empty());
        assert!(NearbyLevels::default().is_empty());
    }
}
