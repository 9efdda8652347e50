//! Safe-leverage computation.
//!
//! The upper bound is the ratio of upside potential (distance to the nearest
//! resistance, extended when a breakout is likely) to downside risk
//! (distance to the nearest support, reduced by the support-strength factor
//! `1.2 - strength`), damped by a volatility-driven conservatism multiplier
//! in [0.5, 0.8]. Inputs that cannot yield a safe value are an error, never
//! a guessed number.

use super::stop_take;
use crate::application::ml::RangePrediction;
use crate::config::ResolvedThresholds;
use crate::domain::errors::AnalysisError;
use crate::domain::levels::NearbyLevels;
use crate::domain::strategy::StopTakeCalculator;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeveragePlan {
    pub leverage: f64,
    pub confidence: f64,
    /// Composite risk score in [0, 1].
    pub risk_level: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
    /// Worst-case equity loss at `leverage` if the stop is struck.
    pub max_equity_loss_pct: f64,
    pub profit_probability: f64,
}

pub struct LeverageInputs<'a> {
    pub reference_price: f64,
    pub nearby: &'a NearbyLevels,
    pub prediction: &'a RangePrediction,
    pub volatility: f64,
    pub atr_pct: Option<f64>,
}

/// Maps current volatility into the conservatism multiplier: calm markets
/// keep 0.8, markets at the top of the band drop to 0.5.
fn conservatism(volatility: f64, vol_min: f64, vol_max: f64) -> f64 {
    let span = (vol_max - vol_min).max(f64::EPSILON);
    let norm = ((volatility - vol_min) / span).clamp(0.0, 1.0);
    0.8 - 0.3 * norm
}

pub fn compute_plan(
    inputs: &LeverageInputs<'_>,
    calculator: StopTakeCalculator,
    thresholds: &ResolvedThresholds,
) -> Result<LeveragePlan, AnalysisError> {
    let reference = inputs.reference_price;
    if reference <= 0.0 {
        return Err(AnalysisError::LeverageAnalysis {
            reason: "non-positive reference price".to_string(),
        });
    }

    let support = inputs.nearby.nearest_support().ok_or_else(|| {
        AnalysisError::LeverageAnalysis {
            reason: "no support below price".to_string(),
        }
    })?;
    let resistance = inputs.nearby.nearest_resistance().ok_or_else(|| {
        AnalysisError::LeverageAnalysis {
            reason: "no resistance above price".to_string(),
        }
    })?;

    let mut upside = (resistance.price - reference) / reference;
    if inputs.prediction.breakout_probability > 0.6 {
        upside *= 1.1;
    }
    let downside =
        (reference - support.price) / reference * (1.2 - support.strength);
    if upside <= 0.0 || downside <= 0.0 {
        return Err(AnalysisError::LeverageAnalysis {
            reason: format!(
                "degenerate level geometry: upside {:.5}, downside {:.5}",
                upside, downside
            ),
        });
    }

    let damping = conservatism(inputs.volatility, thresholds.vol_min, thresholds.vol_max);
    let leverage = (upside / downside * damping).min(thresholds.max_leverage);

    let stop_loss = stop_take::place_stop(
        calculator,
        reference,
        support,
        leverage,
        inputs.atr_pct,
    );
    let take_profit = stop_take::place_take(
        reference,
        resistance,
        inputs.prediction.breakout_probability,
    );

    let risk = reference - stop_loss;
    let reward = take_profit - reference;
    if risk <= 0.0 || reward <= 0.0 {
        return Err(AnalysisError::LeverageAnalysis {
            reason: format!(
                "degenerate stop/take placement: stop {:.4}, take {:.4}, reference {:.4}",
                stop_loss, take_profit, reference
            ),
        });
    }
    let risk_reward = reward / risk;
    let max_equity_loss_pct = risk / reference * leverage;

    let signal = inputs.prediction.signal_strength();
    let vol_span = (thresholds.vol_max - thresholds.vol_min).max(f64::EPSILON);
    let vol_norm = ((inputs.volatility - thresholds.vol_min) / vol_span).clamp(0.0, 1.0);

    let confidence =
        (0.5 * signal + 0.3 * support.strength + 0.2 * (1.0 - vol_norm)).clamp(0.0, 1.0);
    let risk_level = (0.5 * vol_norm
        + 0.5 * (leverage / thresholds.max_leverage.max(f64::EPSILON)))
    .clamp(0.0, 1.0);
    let profit_probability = estimate_profit_probability(
        reward / reference,
        inputs.volatility,
        signal,
    )?;

    Ok(LeveragePlan {
        leverage,
        confidence,
        risk_level,
        stop_loss,
        take_profit,
        risk_reward,
        max_equity_loss_pct,
        profit_probability,
    })
}

/// Blends the model's signal with the diffusion probability of covering the
/// required move within the label horizon.
fn estimate_profit_probability(
    required_return: f64,
    volatility: f64,
    signal_strength: f64,
) -> Result<f64, AnalysisError> {
    const HORIZON_CANDLES: f64 = 10.0;
    let sigma = volatility.max(1e-6) * HORIZON_CANDLES.sqrt();
    let z = required_return / sigma;

    let normal = Normal::new(0.0, 1.0).map_err(|e| AnalysisError::LeverageAnalysis {
        reason: format!("normal distribution unavailable: {}", e),
    })?;
    let reach = 1.0 - normal.cdf(z);

    Ok((0.6 * signal_strength + 0.4 * reach).clamp(0.01, 0.99))
}
