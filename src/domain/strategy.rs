use crate::domain::timeframe::Timeframe;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of strategy families. Adding a family means adding a variant
/// here plus a row in `strategy_configurations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseKind {
    ConservativeMl,
    AggressiveMl,
    AggressiveTraditional,
    FullMl,
    Balanced,
}

impl BaseKind {
    pub fn all() -> Vec<BaseKind> {
        vec![
            BaseKind::ConservativeMl,
            BaseKind::AggressiveMl,
            BaseKind::AggressiveTraditional,
            BaseKind::FullMl,
            BaseKind::Balanced,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            BaseKind::ConservativeMl => "conservative_ml",
            BaseKind::AggressiveMl => "aggressive_ml",
            BaseKind::AggressiveTraditional => "aggressive_traditional",
            BaseKind::FullMl => "full_ml",
            BaseKind::Balanced => "balanced",
        }
    }

    /// Human-facing catalog name.
    pub fn display_name(&self) -> &'static str {
        match self {
            BaseKind::ConservativeMl => "Conservative ML",
            BaseKind::AggressiveMl => "Aggressive ML",
            BaseKind::AggressiveTraditional => "Aggressive Traditional",
            BaseKind::FullMl => "Full ML",
            BaseKind::Balanced => "Balanced",
        }
    }

    /// Whether the family consults the ML predictor at all.
    pub fn uses_ml(&self) -> bool {
        !matches!(self, BaseKind::AggressiveTraditional)
    }

    /// Stop/take calculator wired to this family.
    pub fn stop_take_calculator(&self) -> StopTakeCalculator {
        match self {
            BaseKind::ConservativeMl | BaseKind::Balanced => StopTakeCalculator::LevelAnchored,
            BaseKind::AggressiveMl | BaseKind::AggressiveTraditional | BaseKind::FullMl => {
                StopTakeCalculator::VolatilityScaled
            }
        }
    }
}

impl FromStr for BaseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "conservative_ml" => Ok(BaseKind::ConservativeMl),
            "aggressive_ml" => Ok(BaseKind::AggressiveMl),
            "aggressive_traditional" => Ok(BaseKind::AggressiveTraditional),
            "full_ml" => Ok(BaseKind::FullMl),
            "balanced" => Ok(BaseKind::Balanced),
            _ => Err(anyhow!("Invalid strategy base kind: '{}'", s)),
        }
    }
}

impl fmt::Display for BaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Selection of the stop-loss/take-profit placement algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTakeCalculator {
    /// Anchored to the nearest strong support/resistance level.
    LevelAnchored,
    /// Level-anchored but widened with current volatility.
    VolatilityScaled,
}

/// Sentinel accepted wherever a threshold may defer to the central defaults
/// file. Stored in config JSON as the literal string `"use_default"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSentinel {
    UseDefault,
}

/// A threshold value that is either set explicitly or resolved against the
/// central defaults file at load time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Setting {
    Value(f64),
    Deferred(DefaultSentinel),
}

impl Setting {
    pub fn resolve(self, default: f64) -> f64 {
        match self {
            Setting::Value(v) => v,
            Setting::Deferred(_) => default,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Setting::Deferred(_))
    }
}

impl Default for Setting {
    fn default() -> Self {
        Setting::Deferred(DefaultSentinel::UseDefault)
    }
}

/// Per-strategy parameter bundle as stored in `strategy_configurations`.
/// Every field may be the `use_default` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub min_confidence: Setting,
    pub min_risk_reward: Setting,
    pub min_support_strength: Setting,
    pub min_resistance_strength: Setting,
    /// Leverage cap for signals emitted by this strategy.
    pub max_leverage: Setting,
    /// Risk score ceiling, in [0, 1].
    pub max_risk_level: Setting,
    /// Max tolerated loss of equity per trade, as a fraction.
    pub max_loss_pct: Setting,
    pub min_profit_probability: Setting,
    /// Proximity band to the nearest level, as fractions of price.
    pub min_level_distance_pct: Setting,
    pub max_level_distance_pct: Setting,
}

/// One row of the strategy catalog. Unique on `(name, base_kind, timeframe)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: i64,
    pub name: String,
    pub base_kind: BaseKind,
    pub timeframe: Timeframe,
    pub params: StrategyParams,
    pub is_active: bool,
    /// Included in default-mode onboarding runs.
    pub is_default: bool,
}

impl StrategyConfig {
    /// Tag stored on every emitted signal, e.g. "Conservative ML@1h".
    pub fn tag(&self) -> String {
        format!("{}@{}", self.name, self.timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_kind_round_trip() {
        for kind in BaseKind::all() {
            assert_eq!(BaseKind::from_str(kind.label()).unwrap(), kind);
        }
        assert!(BaseKind::from_str("momentum").is_err());
    }

    #[test]
    fn test_setting_sentinel_serde() {
        let explicit: Setting = serde_json::from_str("2.5").unwrap();
        assert_eq!(explicit, Setting::Value(2.5));

        let deferred: Setting = serde_json::from_str("\"use_default\"").unwrap();
        assert!(deferred.is_deferred());
        assert_eq!(serde_json::to_string(&deferred).unwrap(), "\"use_default\"");
    }

    #[test]
    fn test_setting_resolution() {
        assert_eq!(Setting::Value(3.0).resolve(1.2), 3.0);
        assert_eq!(Setting::default().resolve(1.2), 1.2);
    }

    #[test]
    fn test_params_default_all_deferred() {
        let params: StrategyParams = serde_json::from_str("{}").unwrap();
        assert!(params.min_confidence.is_deferred());
        assert!(params.max_leverage.is_deferred());
    }

    #[test]
    fn test_params_partial_override() {
        let params: StrategyParams =
            serde_json::from_str(r#"{"min_risk_reward": 2.0, "max_leverage": "use_default"}"#)
                .unwrap();
        assert_eq!(params.min_risk_reward, Setting::Value(2.0));
        assert!(params.max_leverage.is_deferred());
    }

    #[test]
    fn test_strategy_tag() {
        let config = StrategyConfig {
            id: 1,
            name: "Balanced".to_string(),
            base_kind: BaseKind::Balanced,
            timeframe: Timeframe::OneHour,
            params: StrategyParams::default(),
            is_active: true,
            is_default: true,
        };
        assert_eq!(config.tag(), "Balanced@1h");
    }
}
