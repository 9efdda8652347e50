use crate::domain::candle::Symbol;
use crate::domain::errors::ValidationFailure;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How the onboarding request selects strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnboardingMode {
    /// All active default strategies across the default timeframes.
    Default,
    /// Exactly the strategy ids listed in the request.
    Selective,
    /// Strategies supplied inline by the caller.
    Custom,
}

impl FromStr for OnboardingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "default" => Ok(OnboardingMode::Default),
            "selective" => Ok(OnboardingMode::Selective),
            "custom" => Ok(OnboardingMode::Custom),
            _ => Err(anyhow!(
                "Invalid mode: '{}'. Must be 'default', 'selective', or 'custom'",
                s
            )),
        }
    }
}

impl fmt::Display for OnboardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OnboardingMode::Default => "default",
            OnboardingMode::Selective => "selective",
            OnboardingMode::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            _ => Err(anyhow!("Invalid execution status: '{}'", s)),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One structured entry of an execution's ordered error list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionErrorRecord {
    pub occurred_at: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ExecutionErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            occurred_at: Utc::now(),
            kind: kind.into(),
            message: message.into(),
            step: None,
            suggestion: None,
        }
    }

    pub fn from_validation(failure: &ValidationFailure) -> Self {
        Self {
            occurred_at: Utc::now(),
            kind: "validation_error".to_string(),
            message: failure.to_string(),
            step: Some(failure.step.clone()),
            suggestion: Some(failure.suggestion.clone()),
        }
    }
}

/// One user-initiated onboarding request, tracked end-to-end in the ledger.
/// Rows are never deleted; the ledger doubles as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub symbol: Symbol,
    pub mode: OnboardingMode,
    pub selected_strategy_ids: Vec<i64>,
    pub status: ExecutionStatus,
    pub progress_percent: f64,
    pub current_operation: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw user override JSON, re-resolved by each worker.
    pub filter_params: serde_json::Value,
    pub errors: Vec<ExecutionErrorRecord>,
}

/// Globally unique execution identifier:
/// `symbol_addition_<utc-timestamp>_<8-hex>`.
pub fn new_execution_id(now: DateTime<Utc>) -> String {
    let hex8 = Uuid::new_v4().simple().to_string()[..8].to_string();
    format!("symbol_addition_{}_{}", now.format("%Y%m%d%H%M%S"), hex8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_execution_id_format() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let id = new_execution_id(now);
        assert!(id.starts_with("symbol_addition_20250314092653_"));
        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_execution_ids_unique() {
        let now = Utc::now();
        assert_ne!(new_execution_id(now), new_execution_id(now));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(
                ExecutionStatus::from_str(&status.to_string()).unwrap(),
                status
            );
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            OnboardingMode::from_str("DEFAULT").unwrap(),
            OnboardingMode::Default
        );
        assert!(OnboardingMode::from_str("all").is_err());
    }
}
