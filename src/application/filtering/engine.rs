//! Per-task filtering engine: evaluation grid construction and the
//! gate-chain / decision-path composition at each timepoint.

use super::gates::{self, ChainVerdict, GateContext, GateScratch};
use super::prepared_data::PreparedData;
use crate::application::cancel::CancelFlag;
use crate::application::decision::{self, AnalysisResult};
use crate::config::ResolvedThresholds;
use crate::config::defaults::CentralDefaults;
use crate::domain::errors::AnalysisError;
use crate::domain::outcome::FilterStage;
use crate::domain::strategy::StrategyConfig;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::debug;

/// The evaluation timepoints chosen for one task.
#[derive(Debug, Clone)]
pub struct EvaluationGrid {
    pub timepoints: Vec<DateTime<Utc>>,
    /// Candidate count before coverage/cap thinning.
    pub total_candidates: usize,
}

/// Candidate timepoints are the step-aligned candle open times inside
/// `[now - lookback, now]`. The window never extends before the first
/// available candle (timestamps are never fabricated before available
/// data), but timepoints inside mid-window gaps are kept: the flexible
/// matcher decides per evaluation whether a candle is close enough. The
/// chosen count is `min(cap, ceil(target_coverage * candidates))`, thinned
/// evenly.
pub fn build_grid(
    data: &PreparedData,
    thresholds: &ResolvedThresholds,
    now: DateTime<Utc>,
    earliest: Option<DateTime<Utc>>,
) -> EvaluationGrid {
    let mut window_start = (now - Duration::days(thresholds.lookback_days))
        .max(data.first_timestamp());
    if let Some(earliest) = earliest {
        window_start = window_start.max(earliest);
    }
    let step_ms = thresholds.eval_step_minutes * 60 * 1000;
    if step_ms <= 0 {
        return EvaluationGrid {
            timepoints: Vec::new(),
            total_candidates: 0,
        };
    }

    // Round the window start up to the step grid.
    let mut at_ms = window_start.timestamp_millis();
    if at_ms % step_ms != 0 {
        at_ms += step_ms - at_ms % step_ms;
    }
    let mut candidates: Vec<DateTime<Utc>> = Vec::new();
    while at_ms <= now.timestamp_millis() {
        if let Some(t) = DateTime::from_timestamp_millis(at_ms) {
            candidates.push(t);
        }
        at_ms += step_ms;
    }

    let total_candidates = candidates.len();
    let target = ((total_candidates as f64 * thresholds.target_coverage).ceil() as usize)
        .min(thresholds.max_evaluations);

    let timepoints = if target == 0 || total_candidates == 0 {
        Vec::new()
    } else if target >= total_candidates {
        candidates
    } else {
        // Even thinning preserves ascending order.
        (0..target)
            .map(|i| candidates[i * total_candidates / target])
            .collect()
    };

    debug!(
        "Grid: {} candidates, {} evaluations (coverage {:.0}%, cap {})",
        total_candidates,
        timepoints.len(),
        thresholds.target_coverage * 100.0,
        thresholds.max_evaluations
    );

    EvaluationGrid {
        timepoints,
        total_candidates,
    }
}

/// What one timepoint produced.
pub enum Evaluation {
    GateRejected {
        stage: FilterStage,
        reason: String,
        metrics: serde_json::Value,
    },
    Outcome(AnalysisResult),
    Cancelled,
}

pub struct FilterEngine<'a> {
    data: &'a PreparedData,
    thresholds: &'a ResolvedThresholds,
    strategy: &'a StrategyConfig,
    defaults: &'a CentralDefaults,
    disabled: HashSet<FilterStage>,
}

impl<'a> FilterEngine<'a> {
    pub fn new(
        data: &'a PreparedData,
        thresholds: &'a ResolvedThresholds,
        strategy: &'a StrategyConfig,
        defaults: &'a CentralDefaults,
        disabled: HashSet<FilterStage>,
    ) -> Self {
        Self {
            data,
            thresholds,
            strategy,
            defaults,
            disabled,
        }
    }

    /// Runs the nine gates and, when all pass, the six decision steps at one
    /// timepoint. Purely CPU-bound; cancellation is observed through the
    /// flag between decision steps.
    pub fn evaluate_at(
        &self,
        at: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> Result<Evaluation, AnalysisError> {
        let Some(view) = self.data.as_of(at) else {
            // Nothing within the widest matcher tolerance: a data gap.
            return Ok(Evaluation::Outcome(AnalysisResult::data_gap()));
        };

        let rules = self.defaults.strategy_rules(self.strategy.base_kind)?;
        let ctx = GateContext {
            view: &view,
            thresholds: self.thresholds,
            strategy: self.strategy,
            rules,
            btc: &self.defaults.btc,
            vol_defaults: &self.defaults.volatility,
        };

        let mut scratch = GateScratch::default();
        match gates::run_chain(&ctx, &self.disabled, &mut scratch) {
            ChainVerdict::Rejected {
                stage,
                reason,
                metrics,
            } => Ok(Evaluation::GateRejected {
                stage,
                reason,
                metrics,
            }),
            ChainVerdict::Passed => match decision::run_path(&ctx, &mut scratch, cancel)? {
                Some(result) => Ok(Evaluation::Outcome(result)),
                None => Ok(Evaluation::Cancelled),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CentralDefaults, FilterParams};
    use crate::domain::candle::{Candle, Symbol};
    use crate::domain::strategy::{BaseKind, StrategyParams};
    use crate::domain::timeframe::Timeframe;
    use chrono::TimeZone;

    fn hourly_series(n: usize, start: DateTime<Utc>) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.21).sin() * 5.0;
                Candle {
                    timestamp: start + Duration::hours(i as i64),
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

    fn prepared(candles: Vec<Candle>, first_eval: DateTime<Utc>) -> PreparedData {
        let defaults = CentralDefaults::embedded().unwrap();
        PreparedData::prepare(
            Symbol::parse("TEST").unwrap(),
            Timeframe::OneHour,
            candles.clone(),
            candles,
            &defaults,
            first_eval,
        )
        .unwrap()
    }

    fn thresholds() -> ResolvedThresholds {
        let defaults = CentralDefaults::embedded().unwrap();
        ResolvedThresholds::resolve(&FilterParams::default(), &strategy(), &defaults).unwrap()
    }

    #[test]
    fn test_grid_respects_step_alignment() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = start + Duration::days(120);
        let data = prepared(hourly_series(120 * 24, start), start + Duration::days(30));
        let thresholds = thresholds();
        let grid = build_grid(&data, &thresholds, now, None);

        // 1h strategy evaluates on the 4h step grid.
        assert!(
            grid.timepoints
                .iter()
                .all(|t| t.timestamp() % (4 * 3600) == 0)
        );
        assert!(grid.timepoints.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_grid_coverage_fraction() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = start + Duration::days(120);
        let data = prepared(hourly_series(120 * 24, start), start + Duration::days(30));
        let thresholds = thresholds();
        let grid = build_grid(&data, &thresholds, now, None);

        let expected =
            ((grid.total_candidates as f64 * thresholds.target_coverage).ceil()) as usize;
        assert_eq!(grid.timepoints.len(), expected.min(thresholds.max_evaluations));
    }

    #[test]
    fn test_grid_honors_evaluation_cap() {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let now = start + Duration::days(120);
        let data = prepared(hourly_series(120 * 24, start), start + Duration::days(30));
        let mut thresholds = thresholds();
        thresholds.max_evaluations = 100;
        let grid = build_grid(&data, &thresholds, now, None);
        assert!(grid.timepoints.len() <= 100);
        assert!(grid.total_candidates > 100);
    }

    #[test]
    fn test_grid_never_fabricates_before_first_candle() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        // Only 20 days of history for a 90-day lookback.
        let data = prepared(hourly_series(20 * 24, start), start + Duration::days(5));
        let thresholds = thresholds();
        let now = start + Duration::days(20);
        let grid = build_grid(&data, &thresholds, now, None);
        assert!(grid.timepoints.iter().all(|t| *t >= start));
        assert!(!grid.timepoints.is_empty());
    }

    #[test]
    fn test_gap_timepoints_recorded_as_insufficient_data() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut candles = hourly_series(60 * 24, start);
        // A 12-hour outage deep inside the window.
        let gap_start = start + Duration::days(40);
        candles.retain(|c| c.timestamp < gap_start || c.timestamp >= gap_start + Duration::hours(12));
        let data = prepared(candles, start + Duration::days(20));
        let defaults = CentralDefaults::embedded().unwrap();
        let thresholds = thresholds();
        let strategy = strategy();
        let engine = FilterEngine::new(&data, &thresholds, &strategy, &defaults, HashSet::new());

        let now = start + Duration::days(60);
        let grid = build_grid(&data, &thresholds, now, None);
        // The grid keeps timepoints inside the gap.
        let in_gap: Vec<_> = grid
            .timepoints
            .iter()
            .filter(|t| **t >= gap_start + Duration::hours(1) && **t < gap_start + Duration::hours(11))
            .collect();
        assert!(!in_gap.is_empty());

        let cancel = CancelFlag::new();
        for t in in_gap {
            match engine.evaluate_at(*t, &cancel).unwrap() {
                Evaluation::Outcome(result) => {
                    assert!(result.early_exit);
                    assert_eq!(
                        result.exit_reason,
                        Some(crate::domain::outcome::EarlyExitReason::InsufficientData)
                    );
                }
                _ => panic!("gap timepoint must early-exit as insufficient data"),
            }
        }
    }

    #[test]
    fn test_engine_classifies_every_timepoint() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = hourly_series(60 * 24, start);
        let data = prepared(candles, start + Duration::days(20));
        let defaults = CentralDefaults::embedded().unwrap();
        let thresholds = thresholds();
        let strategy = strategy();
        let engine = FilterEngine::new(&data, &thresholds, &strategy, &defaults, HashSet::new());

        let now = start + Duration::days(60);
        let grid = build_grid(&data, &thresholds, now, None);
        let cancel = CancelFlag::new();
        let mut classified = 0usize;
        for t in grid.timepoints.iter().skip(grid.timepoints.len() / 2).take(50) {
            match engine.evaluate_at(*t, &cancel).unwrap() {
                Evaluation::GateRejected { reason, .. } => {
                    assert!(!reason.is_empty());
                    classified += 1;
                }
                Evaluation::Outcome(_) => classified += 1,
                Evaluation::Cancelled => panic!("no cancellation requested"),
            }
        }
        assert_eq!(classified, 50);
    }
}
