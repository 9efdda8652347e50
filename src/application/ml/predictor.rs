//! Breakout/bounce probability model.
//!
//! Two random-forest regressors fitted per task on the stretch of history
//! preceding the first evaluation timepoint. Labels look `label_horizon`
//! candles ahead, so fitting stops that many candles short of the boundary
//! and no evaluation ever scores against a model that saw its future.
//!
//! There is no neutral fallback: an absent model or absent features is a
//! prediction failure the caller records as an early exit.

use super::features::{self, FEATURE_COUNT};
use crate::config::defaults::MlDefaults;
use crate::domain::candle::Candle;
use crate::domain::errors::AnalysisError;
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangePrediction {
    /// Probability of an upward break through the local range high.
    pub breakout_probability: f64,
    /// Probability of a dip-and-recover off the local range low.
    pub bounce_probability: f64,
}

impl RangePrediction {
    pub fn signal_strength(&self) -> f64 {
        self.breakout_probability.max(self.bounce_probability)
    }
}

type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

#[derive(Debug)]
pub struct RangePredictor {
    breakout_model: Forest,
    bounce_model: Forest,
    feature_window: usize,
}

impl RangePredictor {
    /// Fits on `training` (already sliced to strictly precede the evaluation
    /// window). Errors with `InsufficientMarketData` when too few labeled
    /// rows can be built.
    pub fn fit(training: &[Candle], cfg: &MlDefaults) -> Result<Self, AnalysisError> {
        let horizon = cfg.label_horizon;
        let window = cfg.feature_window;

        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut breakout_labels: Vec<f64> = Vec::new();
        let mut bounce_labels: Vec<f64> = Vec::new();

        let usable_end = training.len().saturating_sub(horizon);
        for idx in window..usable_end {
            let Some(feature_row) = features::compute(training, idx, window) else {
                continue;
            };
            let (breakout, bounce) = label_at(training, idx, horizon);
            rows.push(feature_row.to_vec());
            breakout_labels.push(breakout);
            bounce_labels.push(bounce);
        }

        if rows.len() < cfg.min_training_rows {
            return Err(AnalysisError::insufficient_data(
                "ml_training",
                rows.len(),
                cfg.min_training_rows,
            ));
        }

        let x = DenseMatrix::from_2d_vec(&rows).map_err(|e| {
            AnalysisError::critical(format!("feature matrix construction failed: {}", e))
        })?;
        let params =
            || RandomForestRegressorParameters::default().with_n_trees(cfg.n_trees.into());

        let breakout_model = RandomForestRegressor::fit(&x, &breakout_labels, params())
            .map_err(|e| AnalysisError::critical(format!("breakout model fit failed: {}", e)))?;
        let bounce_model = RandomForestRegressor::fit(&x, &bounce_labels, params())
            .map_err(|e| AnalysisError::critical(format!("bounce model fit failed: {}", e)))?;

        info!(
            "Fitted range predictor on {} rows ({} candles of history)",
            rows.len(),
            training.len()
        );

        Ok(Self {
            breakout_model,
            bounce_model,
            feature_window: window,
        })
    }

    /// Scores the candle at `idx`. `Err` describes the missing input; the
    /// caller maps it to an `ml_prediction_failed` early exit.
    pub fn predict(&self, candles: &[Candle], idx: usize) -> Result<RangePrediction, String> {
        let feature_row = features::compute(candles, idx, self.feature_window)
            .ok_or_else(|| "feature window not filled at evaluation timepoint".to_string())?;
        self.predict_features(&feature_row)
    }

    pub fn predict_features(
        &self,
        feature_row: &[f64; FEATURE_COUNT],
    ) -> Result<RangePrediction, String> {
        let x = DenseMatrix::from_2d_vec(&vec![feature_row.to_vec()])
            .map_err(|e| format!("matrix creation failed: {}", e))?;

        let breakout = self
            .breakout_model
            .predict(&x)
            .map_err(|e| format!("breakout prediction failed: {}", e))?
            .first()
            .copied()
            .ok_or_else(|| "empty breakout prediction".to_string())?;
        let bounce = self
            .bounce_model
            .predict(&x)
            .map_err(|e| format!("bounce prediction failed: {}", e))?
            .first()
            .copied()
            .ok_or_else(|| "empty bounce prediction".to_string())?;

        Ok(RangePrediction {
            breakout_probability: breakout.clamp(0.0, 1.0),
            bounce_probability: bounce.clamp(0.0, 1.0),
        })
    }
}

/// Binary labels looking `horizon` candles past `idx`: breakout when the
/// forward high clears the trailing range high, bounce when price dips below
/// the trailing low but closes the horizon at or above the entry close.
fn label_at(candles: &[Candle], idx: usize, horizon: usize) -> (f64, f64) {
    let lookback = 20.min(idx);
    let range_high = candles[idx - lookback..=idx]
        .iter()
        .map(|c| c.high)
        .fold(f64::MIN, f64::max);
    let range_low = candles[idx - lookback..=idx]
        .iter()
        .map(|c| c.low)
        .fold(f64::MAX, f64::min);

    let forward = &candles[idx + 1..(idx + 1 + horizon).min(candles.len())];
    let forward_high = forward.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let forward_low = forward.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let forward_close = forward.last().map(|c| c.close).unwrap_or(candles[idx].close);

    let breakout = if forward_high > range_high { 1.0 } else { 0.0 };
    let bounce = if forward_low < range_low && forward_close >= candles[idx].close {
        1.0
    } else {
        0.0
    };
    (breakout, bounce)
}
