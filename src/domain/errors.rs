use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of early-fail rejection reasons surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    SymbolNotFound,
    ExchangeNotSupported,
    DatabaseConnectionFailed,
    ApiTimeout,
    SymbolNotTradable,
    InsufficientLiquidity,
    InsufficientResources,
    InsufficientDataQuality,
    InsufficientHistoricalData,
    CustomRuleViolation,
}

impl FailReason {
    /// Actionable hint paired with the reason, shown verbatim to the user.
    pub fn suggestion(&self) -> &'static str {
        match self {
            FailReason::SymbolNotFound => {
                "check the ticker spelling, or switch to an exchange that lists this instrument"
            }
            FailReason::ExchangeNotSupported => {
                "select one of the supported exchanges (hyperliquid, gateio)"
            }
            FailReason::DatabaseConnectionFailed => {
                "verify database paths and file permissions, then retry"
            }
            FailReason::ApiTimeout => {
                "the exchange API did not answer in time; retry in a few minutes"
            }
            FailReason::SymbolNotTradable => {
                "the instrument is delisted or halted; pick an actively traded instrument"
            }
            FailReason::InsufficientLiquidity => {
                "24h volume is zero; wait for trading activity or pick a more liquid instrument"
            }
            FailReason::InsufficientResources => {
                "free up CPU, memory, or disk on the host before launching an analysis"
            }
            FailReason::InsufficientDataQuality => {
                "recent candle data has gaps; retry later or try a higher timeframe"
            }
            FailReason::InsufficientHistoricalData => {
                "try again after 90 days of history are available for this instrument"
            }
            FailReason::CustomRuleViolation => "a deployment-specific rule rejected this symbol",
        }
    }
}

/// Early-fail verdict carried into the ledger and the API response.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("validation failed at {step}: {reason:?}")]
pub struct ValidationFailure {
    pub reason: FailReason,
    /// Identity of the check that rejected, e.g. "historical_reach".
    pub step: String,
    pub suggestion: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ValidationFailure {
    pub fn new(reason: FailReason, step: impl Into<String>) -> Self {
        Self {
            reason,
            step: step.into(),
            suggestion: reason.suggestion().to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Closed error taxonomy of the analysis path. Every variant has a fixed
/// propagation policy; see the match in `worker::classify_task_error`.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Early-fail check rejected the request. No tasks are created.
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    /// Market data missing or below minimum size at the point of use.
    /// The owning task fails; sibling tasks continue.
    #[error("insufficient market data in {context}: {rows} rows, need {required}")]
    InsufficientMarketData {
        context: String,
        rows: usize,
        required: usize,
    },

    /// A required config key is absent and no central default exists.
    /// Deployment bug; fail fast.
    #[error("missing configuration: {key}")]
    InsufficientConfiguration { key: String },

    /// Leverage computation cannot produce a safe value despite inputs being
    /// present. Recorded as an early exit at the leverage_decision stage.
    #[error("leverage analysis failed: {reason}")]
    LeverageAnalysis { reason: String },

    /// Hard invariant violated after an earlier stage vouched for the data.
    #[error("critical invariant violated: {detail}")]
    CriticalAnalysis { detail: String },

    /// Entry price drifted more than 5% from the reference price. The
    /// evaluation is dropped as early_exit(price_consistency).
    #[error(
        "price consistency violated: entry {entry} deviates {deviation_pct:.2}% from reference {reference}"
    )]
    PriceConsistency {
        reference: f64,
        entry: f64,
        deviation_pct: f64,
    },
}

impl AnalysisError {
    pub fn insufficient_data(context: impl Into<String>, rows: usize, required: usize) -> Self {
        AnalysisError::InsufficientMarketData {
            context: context.into(),
            rows,
            required,
        }
    }

    pub fn missing_config(key: impl Into<String>) -> Self {
        AnalysisError::InsufficientConfiguration { key: key.into() }
    }

    pub fn critical(detail: impl Into<String>) -> Self {
        AnalysisError::CriticalAnalysis {
            detail: detail.into(),
        }
    }

    pub fn price_consistency(reference: f64, entry: f64) -> Self {
        let deviation_pct = if reference != 0.0 {
            (entry - reference).abs() / reference * 100.0
        } else {
            f64::INFINITY
        };
        AnalysisError::PriceConsistency {
            reference,
            entry,
            deviation_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_reason_serde_snake_case() {
        let json = serde_json::to_string(&FailReason::InsufficientHistoricalData).unwrap();
        assert_eq!(json, "\"insufficient_historical_data\"");
        let back: FailReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FailReason::InsufficientHistoricalData);
    }

    #[test]
    fn test_validation_failure_display() {
        let failure = ValidationFailure::new(FailReason::SymbolNotFound, "symbol_existence");
        let msg = failure.to_string();
        assert!(msg.contains("symbol_existence"));
        assert!(msg.contains("SymbolNotFound"));
    }

    #[test]
    fn test_price_consistency_deviation() {
        let err = AnalysisError::price_consistency(100.0, 107.0);
        match err {
            AnalysisError::PriceConsistency { deviation_pct, .. } => {
                assert!((deviation_pct - 7.0).abs() < 1e-9);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_insufficient_data_formatting() {
        let err = AnalysisError::insufficient_data("btc_window", 12, 50);
        let msg = err.to_string();
        assert!(msg.contains("btc_window"));
        assert!(msg.contains("12"));
        assert!(msg.contains("50"));
    }
}
