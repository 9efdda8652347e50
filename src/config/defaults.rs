//! Central defaults loader.
//!
//! Every configurable threshold in the analyzer resolves through this module.
//! The canonical values live in `config/defaults.toml` (embedded at build
//! time); a deployment may point `LEVSCAN_DEFAULTS` at an override file.
//! Config values elsewhere set to the `use_default` sentinel are substituted
//! from here at load time. No other file hardcodes a default.

use crate::domain::errors::AnalysisError;
use crate::domain::strategy::BaseKind;
use crate::domain::timeframe::Timeframe;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const EMBEDDED_DEFAULTS: &str = include_str!("../../config/defaults.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorDefaults {
    pub total_budget_secs: u64,
    pub check_timeout_secs: u64,
    pub data_probe_timeout_secs: u64,
    pub required_history_days: i64,
    pub min_completeness_pct: f64,
    pub max_cpu_pct: f64,
    pub max_memory_pct: f64,
    pub min_free_disk_gib: f64,
    pub allowed_exchanges: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConditionDefaults {
    pub min_leverage: f64,
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    pub max_leverage: f64,
    pub max_risk_level: f64,
    pub max_loss_pct: f64,
    pub min_profit_probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportResistanceDefaults {
    pub min_support_strength: f64,
    pub min_resistance_strength: f64,
    pub min_level_distance_pct: f64,
    pub max_level_distance_pct: f64,
    /// Candles on each side of a swing pivot.
    pub pivot_span: usize,
    /// Pivots closer than this fraction merge into one level.
    pub level_merge_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationDefaults {
    pub target_coverage: f64,
    pub max_evaluations: usize,
    /// Max |entry - reference| / reference before the evaluation is dropped.
    pub max_price_deviation: f64,
    /// Progress snapshot cadence, in evaluations.
    pub snapshot_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDefaults {
    pub min_turnover: f64,
    pub max_spread_pct: f64,
    /// Single-candle return treated as an anomalous spike.
    pub anomaly_return_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityDefaults {
    pub window: usize,
    /// Relative rise across the window that counts as rapidly increasing.
    pub rapid_increase_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlDefaults {
    pub min_training_rows: usize,
    pub feature_window: usize,
    pub label_horizon: usize,
    pub n_trees: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtcDefaults {
    pub reference_symbol: String,
    pub min_overlap_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationDefaults {
    pub grace_secs: u64,
    pub poll_interval_ms: u64,
}

/// Gate-9 rule table for one strategy family. Only the fields that family
/// consults are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyRuleDefaults {
    pub min_confidence: Option<f64>,
    pub max_abs_btc_correlation: Option<f64>,
    pub min_volatility: Option<f64>,
    pub min_signal_strength: Option<f64>,
    pub min_level_touches: Option<u32>,
    pub min_combined_score: Option<f64>,
    pub min_risk_reward: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeDefaults {
    pub eval_step_minutes: i64,
    pub lookback_days: i64,
    pub target_coverage: f64,
    pub min_volume: f64,
    pub max_spread_pct: f64,
    pub vol_min: f64,
    pub vol_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralDefaults {
    pub validator: ValidatorDefaults,
    pub entry_conditions: EntryConditionDefaults,
    pub support_resistance: SupportResistanceDefaults,
    pub evaluation: EvaluationDefaults,
    pub market: MarketDefaults,
    pub volatility: VolatilityDefaults,
    pub ml: MlDefaults,
    pub btc: BtcDefaults,
    pub cancellation: CancellationDefaults,
    pub strategy_rules: BTreeMap<String, StrategyRuleDefaults>,
    pub timeframes: BTreeMap<String, TimeframeDefaults>,
}

impl CentralDefaults {
    /// The compiled-in canonical defaults file.
    pub fn embedded() -> Result<Self> {
        toml::from_str(EMBEDDED_DEFAULTS).context("Failed to parse embedded defaults.toml")
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read defaults file {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse defaults file {:?}", path))
    }

    /// Embedded defaults, or the override file when one is configured.
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        match override_path {
            Some(path) => Self::load_from_path(path),
            None => Self::embedded(),
        }
    }

    /// Per-timeframe bundle. A missing entry is a deployment bug, not a
    /// situation to paper over with a fallback.
    pub fn timeframe(&self, tf: Timeframe) -> Result<&TimeframeDefaults, AnalysisError> {
        self.timeframes
            .get(tf.label())
            .ok_or_else(|| AnalysisError::missing_config(format!("timeframes.{}", tf.label())))
    }

    /// Gate-9 rule table for one strategy family.
    pub fn strategy_rules(&self, kind: BaseKind) -> Result<&StrategyRuleDefaults, AnalysisError> {
        self.strategy_rules
            .get(kind.label())
            .ok_or_else(|| AnalysisError::missing_config(format!("strategy_rules.{}", kind.label())))
    }
}
