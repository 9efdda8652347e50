use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The nine gates of the filter chain, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    DataQuality,
    MarketConditions,
    SupportResistanceExistence,
    DistanceStrength,
    MlConfidence,
    Volatility,
    LeverageFeasibility,
    RiskReward,
    StrategySpecific,
}

impl FilterStage {
    pub fn all() -> [FilterStage; 9] {
        [
            FilterStage::DataQuality,
            FilterStage::MarketConditions,
            FilterStage::SupportResistanceExistence,
            FilterStage::DistanceStrength,
            FilterStage::MlConfidence,
            FilterStage::Volatility,
            FilterStage::LeverageFeasibility,
            FilterStage::RiskReward,
            FilterStage::StrategySpecific,
        ]
    }

    /// 1-based position in the chain.
    pub fn ordinal(&self) -> usize {
        Self::all().iter().position(|s| s == self).map(|i| i + 1).unwrap_or(0)
    }

    pub fn label(&self) -> &'static str {
        match self {
            FilterStage::DataQuality => "data_quality",
            FilterStage::MarketConditions => "market_conditions",
            FilterStage::SupportResistanceExistence => "support_resistance_existence",
            FilterStage::DistanceStrength => "distance_strength",
            FilterStage::MlConfidence => "ml_confidence",
            FilterStage::Volatility => "volatility",
            FilterStage::LeverageFeasibility => "leverage_feasibility",
            FilterStage::RiskReward => "risk_reward",
            FilterStage::StrategySpecific => "strategy_specific",
        }
    }
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Verdict of one gate at one evaluation timepoint.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Pass,
    Reject {
        reason: String,
        metrics: serde_json::Value,
    },
}

impl GateDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        GateDecision::Reject {
            reason: reason.into(),
            metrics: serde_json::Value::Null,
        }
    }

    pub fn reject_with(reason: impl Into<String>, metrics: serde_json::Value) -> Self {
        GateDecision::Reject {
            reason: reason.into(),
            metrics,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, GateDecision::Pass)
    }
}

/// The six steps of the leverage decision path, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    DataSlice,
    SupportResistance,
    MlPrediction,
    BtcCorrelation,
    MarketContext,
    LeverageDecision,
}

impl DecisionStage {
    pub fn label(&self) -> &'static str {
        match self {
            DecisionStage::DataSlice => "data_slice",
            DecisionStage::SupportResistance => "support_resistance",
            DecisionStage::MlPrediction => "ml_prediction",
            DecisionStage::BtcCorrelation => "btc_correlation",
            DecisionStage::MarketContext => "market_context",
            DecisionStage::LeverageDecision => "leverage_decision",
        }
    }
}

impl fmt::Display for DecisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Classified reasons a decision step may short-circuit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EarlyExitReason {
    InsufficientData,
    NoSupportResistance,
    MlPredictionFailed,
    BtcDataInsufficient,
    MarketContextFailed,
    LeverageConditionsNotMet,
    PriceConsistency,
}

impl EarlyExitReason {
    pub fn label(&self) -> &'static str {
        match self {
            EarlyExitReason::InsufficientData => "insufficient_data",
            EarlyExitReason::NoSupportResistance => "no_support_resistance",
            EarlyExitReason::MlPredictionFailed => "ml_prediction_failed",
            EarlyExitReason::BtcDataInsufficient => "btc_data_insufficient",
            EarlyExitReason::MarketContextFailed => "market_context_failed",
            EarlyExitReason::LeverageConditionsNotMet => "leverage_conditions_not_met",
            EarlyExitReason::PriceConsistency => "price_consistency",
        }
    }

    /// Actionable hint shown in task summaries.
    pub fn suggestion(&self) -> &'static str {
        match self {
            EarlyExitReason::InsufficientData => {
                "try a longer analysis window or a lower timeframe"
            }
            EarlyExitReason::NoSupportResistance => {
                "try a longer analysis window or a higher timeframe"
            }
            EarlyExitReason::MlPredictionFailed => {
                "no trained model is available for this instrument/timeframe"
            }
            EarlyExitReason::BtcDataInsufficient => {
                "the BTC reference series has gaps in this window"
            }
            EarlyExitReason::MarketContextFailed => {
                "trend or volatility could not be resolved at this timepoint"
            }
            EarlyExitReason::LeverageConditionsNotMet => {
                "computed leverage or confidence fell below the entry thresholds"
            }
            EarlyExitReason::PriceConsistency => {
                "entry price drifted more than 5% from the reference price"
            }
        }
    }
}

impl fmt::Display for EarlyExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Timing and size record of one decision step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: DecisionStage,
    pub success: bool,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_found: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// The trade recommendation produced when all six decision steps succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub entry_price: f64,
    pub leverage: f64,
    pub confidence: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
}

impl Recommendation {
    /// Hard invariant for every emitted signal: stop < entry < take.
    pub fn is_ordered(&self) -> bool {
        self.stop_loss < self.entry_price && self.entry_price < self.take_profit
    }
}

/// A fully-formed trade signal at one evaluation timepoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub strategy_tag: String,
    #[serde(flatten)]
    pub recommendation: Recommendation,
    pub stage_results: Vec<StageResult>,
}

/// The three outcome kinds of one evaluation. Exactly one is recorded per
/// evaluation timepoint that reaches the decision path; gate rejections are
/// tallied separately in the filter histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Signal(Signal),
    /// The full chain ran and the decision step declined. A valid, final,
    /// observable outcome; never reported as a failure.
    NoSignal {
        timestamp: DateTime<Utc>,
        stage_results: Vec<StageResult>,
    },
    EarlyExit {
        timestamp: DateTime<Utc>,
        stage: DecisionStage,
        reason: EarlyExitReason,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        metrics: serde_json::Value,
    },
}

/// One closed trade after post-hoc exit simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub signal: Signal,
    pub exit_price: f64,
    pub exit_timestamp: Option<DateTime<Utc>>,
    /// Unleveraged move from entry to exit.
    pub pnl_pct: f64,
    /// `pnl_pct` scaled by the recommended leverage.
    pub leveraged_return_pct: f64,
    pub is_win: bool,
}

/// Persisted per-task summary metrics. Metric fields are `None` when the
/// task emitted no trades (a valid outcome, not a failure).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisAggregates {
    pub total_trades: u64,
    pub win_rate: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub avg_leverage: Option<f64>,
}

/// Running per-task accounting. The invariant
/// `gate rejections + signals + no-signals + early exits = evaluations run`
/// is checked by `is_balanced`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_candidates: usize,
    pub evaluations_run: usize,
    pub gate_rejections: BTreeMap<FilterStage, u64>,
    pub signals: u64,
    pub no_signals: u64,
    /// Keyed `"<stage>:<reason>"` for JSON friendliness.
    pub early_exits: BTreeMap<String, u64>,
}

impl TaskStats {
    pub fn record_gate_rejection(&mut self, stage: FilterStage) {
        *self.gate_rejections.entry(stage).or_insert(0) += 1;
    }

    pub fn record_early_exit(&mut self, stage: DecisionStage, reason: EarlyExitReason) {
        let key = format!("{}:{}", stage, reason);
        *self.early_exits.entry(key).or_insert(0) += 1;
    }

    pub fn total_gate_rejections(&self) -> u64 {
        self.gate_rejections.values().sum()
    }

    pub fn total_early_exits(&self) -> u64 {
        self.early_exits.values().sum()
    }

    /// Fraction of candidate timepoints that became trades.
    pub fn filtering_efficiency(&self) -> f64 {
        if self.total_candidates == 0 {
            0.0
        } else {
            self.signals as f64 / self.total_candidates as f64
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.total_gate_rejections() + self.signals + self.no_signals + self.total_early_exits()
            == self.evaluations_run as u64
    }
}
