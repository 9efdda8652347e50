//! Threshold resolution.
//!
//! Every threshold read in the analysis path goes through one resolution
//! order: user override → strategy config → timeframe config → central
//! defaults. The resolved bundle is computed once per task and handed to the
//! filter chain and decision path as plain numbers.

use crate::config::defaults::{CentralDefaults, TimeframeDefaults};
use crate::config::filter_params::FilterParams;
use crate::domain::errors::AnalysisError;
use crate::domain::strategy::StrategyConfig;
use serde::{Deserialize, Serialize};

/// Flattened, fully-resolved thresholds for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedThresholds {
    // Entry conditions
    pub min_leverage: f64,
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    pub max_leverage: f64,
    pub max_risk_level: f64,
    pub max_loss_pct: f64,
    pub min_profit_probability: f64,

    // Support/resistance
    pub min_support_strength: f64,
    pub min_resistance_strength: f64,
    pub min_level_distance_pct: f64,
    pub max_level_distance_pct: f64,

    // Market conditions (timeframe-scoped)
    pub min_volume: f64,
    pub max_spread_pct: f64,
    pub min_turnover: f64,
    pub anomaly_return_pct: f64,

    // Volatility band (timeframe-scoped)
    pub vol_min: f64,
    pub vol_max: f64,

    // Evaluation grid
    pub lookback_days: i64,
    pub eval_step_minutes: i64,
    pub target_coverage: f64,
    pub max_evaluations: usize,
    pub max_price_deviation: f64,
}

impl ResolvedThresholds {
    /// Applies the full resolution chain for one (strategy, timeframe) task.
    pub fn resolve(
        overrides: &FilterParams,
        strategy: &StrategyConfig,
        defaults: &CentralDefaults,
    ) -> Result<Self, AnalysisError> {
        let tf: &TimeframeDefaults = defaults.timeframe(strategy.timeframe)?;
        let entry = &defaults.entry_conditions;
        let sr = &defaults.support_resistance;
        let params = &strategy.params;

        Ok(Self {
            min_leverage: overrides
                .entry_conditions
                .min_leverage
                .unwrap_or(entry.min_leverage),
            min_confidence: overrides
                .entry_conditions
                .min_confidence
                .unwrap_or_else(|| params.min_confidence.resolve(entry.min_confidence)),
            min_risk_reward: overrides
                .entry_conditions
                .min_risk_reward
                .unwrap_or_else(|| params.min_risk_reward.resolve(entry.min_risk_reward)),
            max_leverage: params.max_leverage.resolve(entry.max_leverage),
            max_risk_level: params.max_risk_level.resolve(entry.max_risk_level),
            max_loss_pct: params.max_loss_pct.resolve(entry.max_loss_pct),
            min_profit_probability: params
                .min_profit_probability
                .resolve(entry.min_profit_probability),

            min_support_strength: overrides
                .support_resistance
                .min_support_strength
                .unwrap_or_else(|| params.min_support_strength.resolve(sr.min_support_strength)),
            min_resistance_strength: overrides
                .support_resistance
                .min_resistance_strength
                .unwrap_or_else(|| {
                    params
                        .min_resistance_strength
                        .resolve(sr.min_resistance_strength)
                }),
            min_level_distance_pct: params
                .min_level_distance_pct
                .resolve(sr.min_level_distance_pct),
            max_level_distance_pct: params
                .max_level_distance_pct
                .resolve(sr.max_level_distance_pct),

            min_volume: tf.min_volume,
            max_spread_pct: tf.max_spread_pct.min(defaults.market.max_spread_pct),
            min_turnover: defaults.market.min_turnover,
            anomaly_return_pct: defaults.market.anomaly_return_pct,

            vol_min: tf.vol_min,
            vol_max: tf.vol_max,

            lookback_days: tf.lookback_days,
            eval_step_minutes: tf.eval_step_minutes,
            target_coverage: tf.target_coverage,
            max_evaluations: defaults.evaluation.max_evaluations,
            max_price_deviation: defaults.evaluation.max_price_deviation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::{BaseKind, Setting, StrategyConfig, StrategyParams};
    use crate::domain::timeframe::Timeframe;

    fn strategy(params: StrategyParams) -> StrategyConfig {
        StrategyConfig {
            id: 1,
            name: "Balanced".to_string(),
            base_kind: BaseKind::Balanced,
            timeframe: Timeframe::OneHour,
            params,
            is_active: true,
            is_default: true,
        }
    }

    #[test]
    fn test_central_defaults_apply_when_everything_deferred() {
        let defaults = CentralDefaults::embedded().unwrap();
        let resolved = ResolvedThresholds::resolve(
            &FilterParams::default(),
            &strategy(StrategyParams::default()),
            &defaults,
        )
        .unwrap();

        assert_eq!(resolved.min_risk_reward, 1.2);
        assert_eq!(resolved.min_leverage, 2.0);
        assert_eq!(resolved.lookback_days, 90);
        assert_eq!(resolved.eval_step_minutes, 240);
        assert_eq!(resolved.max_evaluations, 5000);
    }

    #[test]
    fn test_strategy_config_beats_central_default() {
        let defaults = CentralDefaults::embedded().unwrap();
        let params = StrategyParams {
            min_risk_reward: Setting::Value(1.8),
            ..StrategyParams::default()
        };
        let resolved =
            ResolvedThresholds::resolve(&FilterParams::default(), &strategy(params), &defaults)
                .unwrap();
        assert_eq!(resolved.min_risk_reward, 1.8);
    }

    #[test]
    fn test_user_override_beats_strategy_config() {
        let defaults = CentralDefaults::embedded().unwrap();
        let params = StrategyParams {
            min_risk_reward: Setting::Value(1.8),
            ..StrategyParams::default()
        };
        let overrides: FilterParams = serde_json::from_str(
            r#"{ "entry_conditions": { "min_risk_reward": 2.0 } }"#,
        )
        .unwrap();
        let resolved =
            ResolvedThresholds::resolve(&overrides, &strategy(params), &defaults).unwrap();
        assert_eq!(resolved.min_risk_reward, 2.0);
    }
}
