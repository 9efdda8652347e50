//! The six-step leverage decision path.
//!
//! Runs once per timepoint that survived all nine gates. Each step may
//! short-circuit with a classified early exit; a step that reaches a verdict
//! but declines it produces a no-signal, which is a completed outcome. Every
//! step is timed and recorded so a signal carries its full trace.

pub mod leverage;
pub mod stop_take;

use crate::application::analysis::market_context;
use crate::application::filtering::gates::{self, GateContext, GateScratch};
use crate::application::cancel::CancelFlag;
use crate::domain::errors::AnalysisError;
use crate::domain::outcome::{
    DecisionStage, EarlyExitReason, Recommendation, StageResult,
};
use self::leverage::LeverageInputs;
use serde_json::json;
use std::time::Instant;

/// Per-evaluation result of the decision path.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub completed: bool,
    pub early_exit: bool,
    pub exit_stage: Option<DecisionStage>,
    pub exit_reason: Option<EarlyExitReason>,
    pub exit_metrics: serde_json::Value,
    pub stage_results: Vec<StageResult>,
    /// Present only when the decision succeeded.
    pub recommendation: Option<Recommendation>,
}

impl AnalysisResult {
    fn signal(stage_results: Vec<StageResult>, recommendation: Recommendation) -> Self {
        Self {
            completed: true,
            early_exit: false,
            exit_stage: None,
            exit_reason: None,
            exit_metrics: serde_json::Value::Null,
            stage_results,
            recommendation: Some(recommendation),
        }
    }

    fn no_signal(stage_results: Vec<StageResult>) -> Self {
        Self {
            completed: true,
            early_exit: false,
            exit_stage: None,
            exit_reason: None,
            exit_metrics: serde_json::Value::Null,
            stage_results,
            recommendation: None,
        }
    }

    fn exited(
        stage: DecisionStage,
        reason: EarlyExitReason,
        metrics: serde_json::Value,
        stage_results: Vec<StageResult>,
    ) -> Self {
        Self {
            completed: false,
            early_exit: true,
            exit_stage: Some(stage),
            exit_reason: Some(reason),
            exit_metrics: metrics,
            stage_results,
            recommendation: None,
        }
    }

    pub fn is_signal(&self) -> bool {
        self.recommendation.is_some()
    }

    /// Evaluation timepoint with no candle inside the widest matcher
    /// tolerance: recorded as an insufficient-data exit at the slice step.
    pub fn data_gap() -> Self {
        AnalysisResult::exited(
            DecisionStage::DataSlice,
            EarlyExitReason::InsufficientData,
            json!({ "matched_candle": false }),
            Vec::new(),
        )
    }
}

/// `None` means cancellation was observed between steps; the caller winds the
/// task down. `Err` is a task-fatal violation (critical invariant).
pub fn run_path(
    ctx: &GateContext<'_>,
    scratch: &mut GateScratch,
    cancel: &CancelFlag,
) -> Result<Option<AnalysisResult>, AnalysisError> {
    let mut stage_results: Vec<StageResult> = Vec::with_capacity(6);

    macro_rules! checkpoint {
        () => {
            if cancel.is_cancelled() {
                return Ok(None);
            }
        };
    }

    // Step 1: data slice as of T.
    let started = Instant::now();
    let candles = ctx.view.candles();
    let min_len = ctx.vol_defaults.window.max(30) + 2;
    if candles.len() < min_len {
        stage_results.push(stage_err(
            DecisionStage::DataSlice,
            started,
            format!("slice has {} rows, need {}", candles.len(), min_len),
        ));
        return Ok(Some(AnalysisResult::exited(
            DecisionStage::DataSlice,
            EarlyExitReason::InsufficientData,
            json!({ "rows": candles.len(), "required": min_len }),
            stage_results,
        )));
    }
    stage_results.push(stage_ok(DecisionStage::DataSlice, started, candles.len(), None));
    checkpoint!();

    // Step 2: support/resistance near T.
    let started = Instant::now();
    let vouched_by_gate = scratch.nearby.is_some();
    if scratch.nearby.is_none() {
        scratch.nearby = Some(ctx.view.nearby_levels(
            ctx.thresholds.min_support_strength,
            ctx.thresholds.min_resistance_strength,
        ));
    }
    let nearby = scratch.nearby.clone().unwrap_or_default();
    let level_count = nearby.supports.len() + nearby.resistances.len();
    if nearby.is_empty() {
        if vouched_by_gate {
            // Gate 3 vouched for levels; finding none now is a broken
            // invariant, not a data condition.
            return Err(AnalysisError::critical(format!(
                "support/resistance vanished between gate 3 and decision step 2 at {}",
                ctx.view.at()
            )));
        }
        stage_results.push(stage_err(
            DecisionStage::SupportResistance,
            started,
            "no levels of either kind at this timepoint".to_string(),
        ));
        return Ok(Some(AnalysisResult::exited(
            DecisionStage::SupportResistance,
            EarlyExitReason::NoSupportResistance,
            serde_json::Value::Null,
            stage_results,
        )));
    }
    stage_results.push(stage_ok(
        DecisionStage::SupportResistance,
        started,
        candles.len(),
        Some(level_count),
    ));
    checkpoint!();

    // Step 3: ML prediction.
    let started = Instant::now();
    let prediction = match scratch.prediction {
        Some(prediction) => prediction,
        None => match ctx.view.predictor() {
            Some(predictor) => {
                match predictor.predict(candles, ctx.view.current_index()) {
                    Ok(prediction) => {
                        scratch.prediction = Some(prediction);
                        prediction
                    }
                    Err(reason) => {
                        stage_results.push(stage_err(
                            DecisionStage::MlPrediction,
                            started,
                            reason.clone(),
                        ));
                        return Ok(Some(AnalysisResult::exited(
                            DecisionStage::MlPrediction,
                            EarlyExitReason::MlPredictionFailed,
                            json!({ "error": reason }),
                            stage_results,
                        )));
                    }
                }
            }
            None => {
                stage_results.push(stage_err(
                    DecisionStage::MlPrediction,
                    started,
                    "no model for instrument/timeframe".to_string(),
                ));
                return Ok(Some(AnalysisResult::exited(
                    DecisionStage::MlPrediction,
                    EarlyExitReason::MlPredictionFailed,
                    serde_json::Value::Null,
                    stage_results,
                )));
            }
        },
    };
    stage_results.push(stage_ok(DecisionStage::MlPrediction, started, candles.len(), None));
    checkpoint!();

    // Step 4: BTC correlation risk. Gaps in the reference series are an
    // early exit, never interpolated over.
    let started = Instant::now();
    if scratch.btc_correlation.is_none() {
        match gates::btc_correlation_at(ctx) {
            Some(correlation) => scratch.btc_correlation = Some(correlation),
            None => {
                stage_results.push(stage_err(
                    DecisionStage::BtcCorrelation,
                    started,
                    "BTC series unavailable in window".to_string(),
                ));
                return Ok(Some(AnalysisResult::exited(
                    DecisionStage::BtcCorrelation,
                    EarlyExitReason::BtcDataInsufficient,
                    serde_json::Value::Null,
                    stage_results,
                )));
            }
        }
    }
    stage_results.push(stage_ok(
        DecisionStage::BtcCorrelation,
        started,
        ctx.view.btc_candles().len(),
        None,
    ));
    checkpoint!();

    // Step 5: market context.
    let started = Instant::now();
    let context = match scratch.market_context {
        Some(context) => context,
        None => {
            match market_context::assess(
                candles,
                ctx.view.volatility(),
                ctx.thresholds.anomaly_return_pct,
            ) {
                Ok(context) => {
                    scratch.market_context = Some(context);
                    context
                }
                Err(missing) => {
                    stage_results.push(stage_err(
                        DecisionStage::MarketContext,
                        started,
                        format!("unresolvable component: {}", missing),
                    ));
                    return Ok(Some(AnalysisResult::exited(
                        DecisionStage::MarketContext,
                        EarlyExitReason::MarketContextFailed,
                        json!({ "missing": missing }),
                        stage_results,
                    )));
                }
            }
        }
    };
    stage_results.push(stage_ok(DecisionStage::MarketContext, started, candles.len(), None));
    checkpoint!();

    // Step 6: leverage decision.
    let started = Instant::now();
    let plan = match scratch.plan {
        Some(plan) => plan,
        None => {
            let inputs = LeverageInputs {
                reference_price: ctx.view.reference_price(),
                nearby: &nearby,
                prediction: &prediction,
                volatility: context.volatility,
                atr_pct: ctx.view.atr_pct(),
            };
            match leverage::compute_plan(
                &inputs,
                ctx.strategy.base_kind.stop_take_calculator(),
                ctx.thresholds,
            ) {
                Ok(plan) => plan,
                Err(AnalysisError::LeverageAnalysis { reason }) => {
                    stage_results.push(stage_err(
                        DecisionStage::LeverageDecision,
                        started,
                        reason.clone(),
                    ));
                    return Ok(Some(AnalysisResult::exited(
                        DecisionStage::LeverageDecision,
                        EarlyExitReason::LeverageConditionsNotMet,
                        json!({ "error": reason }),
                        stage_results,
                    )));
                }
                Err(other) => return Err(other),
            }
        }
    };

    let reference = ctx.view.reference_price();
    let entry_price = reference;
    let deviation = (entry_price - reference).abs() / reference;
    if deviation > ctx.thresholds.max_price_deviation {
        stage_results.push(stage_err(
            DecisionStage::LeverageDecision,
            started,
            format!("entry deviates {:.2}% from reference", deviation * 100.0),
        ));
        return Ok(Some(AnalysisResult::exited(
            DecisionStage::LeverageDecision,
            EarlyExitReason::PriceConsistency,
            json!({ "deviation_pct": deviation * 100.0 }),
            stage_results,
        )));
    }

    if plan.leverage < ctx.thresholds.min_leverage
        || plan.confidence < ctx.thresholds.min_confidence
    {
        // The decision ran to the end and declined: a no-signal, not an
        // early exit and not a failure.
        stage_results.push(stage_ok(
            DecisionStage::LeverageDecision,
            started,
            candles.len(),
            None,
        ));
        return Ok(Some(AnalysisResult::no_signal(stage_results)));
    }

    let recommendation = Recommendation {
        entry_price,
        leverage: plan.leverage,
        confidence: plan.confidence,
        stop_loss: plan.stop_loss,
        take_profit: plan.take_profit,
        risk_reward: plan.risk_reward,
    };
    if !recommendation.is_ordered() {
        return Err(AnalysisError::critical(format!(
            "stop/entry/take ordering violated for a long: stop {:.6}, entry {:.6}, take {:.6}",
            recommendation.stop_loss, recommendation.entry_price, recommendation.take_profit
        )));
    }

    stage_results.push(stage_ok(
        DecisionStage::LeverageDecision,
        started,
        candles.len(),
        None,
    ));
    Ok(Some(AnalysisResult::signal(stage_results, recommendation)))
}

fn stage_ok(
    stage: DecisionStage,
    started: Instant,
    data_processed: usize,
    items_found: Option<usize>,
) -> StageResult {
    StageResult {
        stage,
        success: true,
        execution_time_ms: started.elapsed().as_millis() as u64,
        data_processed: Some(data_processed),
        items_found,
        error_message: None,
    }
}

fn stage_err(stage: DecisionStage, started: Instant, message: String) -> StageResult {
    StageResult {
        stage,
        success: false,
        execution_time_ms: started.elapsed().as_millis() as u64,
        data_processed: None,
        items_found: None,
        error_message: Some(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::filtering::gates::run_chain;
    use crate::application::filtering::prepared_data::PreparedData;
    use crate::config::{CentralDefaults, FilterParams, ResolvedThresholds};
    use crate::domain::candle::{Candle, Symbol};
    use crate::domain::strategy::{BaseKind, StrategyConfig, StrategyParams};
    use crate::domain::timeframe::Timeframe;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashSet;

    fn wavy_series(n: usize) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.21).sin() * 5.0 + (i as f64 * 0.05).cos() * 2.0;
                Candle {
                    timestamp: base + Duration::hours(i as i64),
                    open: close * 0.9995,
                    high: close * 1.006,
                    low: close * 0.994,
                    close,
                    volume: 150.0,
                }
            })
            .collect()
    }

    fn strategy() -> StrategyConfig {
        StrategyConfig {
            id: 1,
            name: "Balanced".to_string(),
            base_kind: BaseKind::Balanced,
            timeframe: Timeframe::OneHour,
            params: StrategyParams::default(),
            is_active: true,
            is_default: true,
        }
    }

    #[test]
    fn test_path_after_full_chain_yields_classified_outcome() {
        let defaults = CentralDefaults::embedded().unwrap();
        let candles = wavy_series(800);
        let data = PreparedData::prepare(
            Symbol::parse("TEST").unwrap(),
            Timeframe::OneHour,
            candles.clone(),
            candles,
            &defaults,
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let strategy = strategy();
        let thresholds =
            ResolvedThresholds::resolve(&FilterParams::default(), &strategy, &defaults).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut saw_signal_or_terminal = false;
        for hour in (500..780).step_by(4) {
            let Some(view) = data.as_of(base + Duration::hours(hour)) else {
                continue;
            };
            let ctx = GateContext {
                view: &view,
                thresholds: &thresholds,
                strategy: &strategy,
                rules: defaults.strategy_rules(BaseKind::Balanced).unwrap(),
                btc: &defaults.btc,
                vol_defaults: &defaults.volatility,
            };
            let mut scratch = GateScratch::default();
            if !matches!(
                run_chain(&ctx, &HashSet::new(), &mut scratch),
                crate::application::filtering::gates::ChainVerdict::Passed
            ) {
                continue;
            }
            let result = run_path(&ctx, &mut scratch, &CancelFlag::new())
                .unwrap()
                .unwrap();
            assert!(!result.stage_results.is_empty());
            if result.is_signal() {
                let rec = result.recommendation.as_ref().unwrap();
                assert!(rec.is_ordered());
                assert!(
                    (rec.entry_price - view.reference_price()).abs() / view.reference_price()
                        <= thresholds.max_price_deviation
                );
                assert_eq!(result.stage_results.len(), 6);
            }
            saw_signal_or_terminal = true;
        }
        assert!(saw_signal_or_terminal, "no timepoint reached the path");
    }

    #[test]
    fn test_cancellation_between_steps() {
        let defaults = CentralDefaults::embedded().unwrap();
        let candles = wavy_series(600);
        let data = PreparedData::prepare(
            Symbol::parse("TEST").unwrap(),
            Timeframe::OneHour,
            candles.clone(),
            candles,
            &defaults,
            Utc.with_ymd_and_hms(2024, 1, 12, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let strategy = strategy();
        let thresholds =
            ResolvedThresholds::resolve(&FilterParams::default(), &strategy, &defaults).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let view = data.as_of(base + Duration::hours(550)).unwrap();
        let ctx = GateContext {
            view: &view,
            thresholds: &thresholds,
            strategy: &strategy,
            rules: defaults.strategy_rules(BaseKind::Balanced).unwrap(),
            btc: &defaults.btc,
            vol_defaults: &defaults.volatility,
        };

        let cancel = CancelFlag::new();
        cancel.set();
        let mut scratch = GateScratch::default();
        scratch.nearby = Some(view.nearby_levels(0.0, 0.0));
        let outcome = run_path(&ctx, &mut scratch, &cancel).unwrap();
        assert!(outcome.is_none());
    }
}
