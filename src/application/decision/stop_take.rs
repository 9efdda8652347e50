//! Stop-loss / take-profit placement.
//!
//! Two calculators, selected per strategy family. Both anchor to the nearest
//! support/resistance pair; the volatility-scaled variant widens the stop
//! with the current ATR so fast markets are not stopped out by noise.

use crate::domain::levels::PriceLevel;
use crate::domain::strategy::StopTakeCalculator;

/// Fraction of equity a single trade may lose at the chosen leverage.
pub const EQUITY_LOSS_CAP: f64 = 0.10;

/// Stop distance below the support level as a fraction of its price:
/// `max(0.01, min(0.15, 0.02 * (1.2 - strength)))`, wider for weak supports.
fn anchored_stop_distance(support_strength: f64) -> f64 {
    (0.02 * (1.2 - support_strength)).clamp(0.01, 0.15)
}

/// Places the stop for a long. The result always respects the equity-loss
/// cap: a stop that would lose more than 10%/leverage of equity is tightened.
pub fn place_stop(
    calculator: StopTakeCalculator,
    reference_price: f64,
    support: &PriceLevel,
    leverage: f64,
    atr_pct: Option<f64>,
) -> f64 {
    let mut distance = anchored_stop_distance(support.strength);
    if calculator == StopTakeCalculator::VolatilityScaled
        && let Some(atr) = atr_pct
    {
        distance = distance.max(1.5 * atr).min(0.15);
    }

    let stop = support.price * (1.0 - distance);
    let loss_fraction = (reference_price - stop) / reference_price;
    if leverage > 0.0 && loss_fraction * leverage > EQUITY_LOSS_CAP {
        reference_price * (1.0 - EQUITY_LOSS_CAP / leverage)
    } else {
        stop
    }
}

/// Places the take for a long near the nearest resistance: extended 10% of
/// the distance beyond it when a breakout is likely, otherwise 10% short.
pub fn place_take(
    reference_price: f64,
    resistance: &PriceLevel,
    breakout_probability: f64,
) -> f64 {
    let distance = resistance.price - reference_price;
    if breakout_probability > 0.6 {
        resistance.price + 0.1 * distance
    } else {
        reference_price + 0.9 * distance
    }
}
