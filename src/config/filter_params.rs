//! User-supplied threshold overrides, carried parent → worker through the
//! `FILTER_PARAMS` environment variable as JSON. This is the only payload the
//! process boundary sees besides the task key on argv; workers re-resolve
//! everything else from the databases and the central defaults.

use crate::domain::outcome::FilterStage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const FILTER_PARAMS_ENV: &str = "FILTER_PARAMS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConditionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_leverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_risk_reward: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportResistanceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_support_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_resistance_strength: Option<f64>,
}

/// Custom analysis period. Default-mode requests leave this unset and the
/// window ends at submission time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-request overrides. Unset fields fall through the resolution chain
/// (strategy config, then timeframe config, then central defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub entry_conditions: EntryConditionOverrides,
    pub support_resistance: SupportResistanceOverrides,
    /// Gates the caller asked to bypass entirely.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disabled_filters: Vec<FilterStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<PeriodOverride>,
}

impl FilterParams {
    pub fn is_empty(&self) -> bool {
        *self == FilterParams::default()
    }

    pub fn to_env_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize FILTER_PARAMS")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse FILTER_PARAMS JSON")
    }

    /// Reads the worker-side copy. Absent variable means "no overrides".
    pub fn from_env() -> Result<Self> {
        match std::env::var(FILTER_PARAMS_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Self::from_json(&raw),
            _ => Ok(FilterParams::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_round_trip() {
        let params = FilterParams::default();
        let json = params.to_env_json().unwrap();
        assert_eq!(FilterParams::from_json(&json).unwrap(), params);
    }

    #[test]
    fn test_spec_request_shape() {
        let raw = r#"{
            "entry_conditions": { "min_risk_reward": 2.0 },
            "support_resistance": { "min_support_strength": 0.7 }
        }"#;
        let params = FilterParams::from_json(raw).unwrap();
        assert_eq!(params.entry_conditions.min_risk_reward, Some(2.0));
        assert_eq!(params.entry_conditions.min_leverage, None);
        assert_eq!(params.support_resistance.min_support_strength, Some(0.7));
    }

    #[test]
    fn test_filter_stage_enum_round_trips_through_env_carriage() {
        // Every member of the closed rejection-stage enum must survive the
        // parent/worker process boundary unchanged.
        let params = FilterParams {
            disabled_filters: FilterStage::all().to_vec(),
            ..FilterParams::default()
        };
        let json = params.to_env_json().unwrap();
        let back = FilterParams::from_json(&json).unwrap();
        assert_eq!(back, params);
        assert_eq!(back.disabled_filters.len(), 9);
    }
}
