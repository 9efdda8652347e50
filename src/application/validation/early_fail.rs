//! Early-fail validator.
//!
//! A fixed, ordered battery of nine checks, cheap to expensive, each
//! fail-fast: the first rejection ends the run before any worker or task row
//! exists. Every rejection carries a closed-enum reason, the identity of the
//! failing step, a user-actionable suggestion, and metadata.

use crate::config::defaults::ValidatorDefaults;
use crate::domain::candle::Symbol;
use crate::domain::errors::{FailReason, ValidationFailure};
use crate::domain::timeframe::Timeframe;
use crate::infrastructure::persistence::{
    analysis_repository, database, ledger_repository, AnalysisRepository, LedgerRepository,
};
use crate::infrastructure::providers::{MarketDataProvider, MarketInfo};
use crate::infrastructure::resources;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Deployment-specific rule slotted in as check 9.
#[async_trait]
pub trait CustomRule: Send + Sync {
    fn name(&self) -> &str;
    /// `Err(message)` rejects the symbol.
    async fn check(&self, symbol: &Symbol) -> Result<(), String>;
}

#[derive(Debug)]
pub enum Verdict {
    Pass,
    Fail(ValidationFailure),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

pub struct EarlyFailValidator {
    provider: Arc<dyn MarketDataProvider>,
    ledger: LedgerRepository,
    analysis: AnalysisRepository,
    config: ValidatorDefaults,
    custom_rules: Vec<Box<dyn CustomRule>>,
}

impl EarlyFailValidator {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        ledger: LedgerRepository,
        analysis: AnalysisRepository,
        config: ValidatorDefaults,
    ) -> Self {
        Self {
            provider,
            ledger,
            analysis,
            config,
            custom_rules: Vec::new(),
        }
    }

    pub fn with_custom_rules(mut self, rules: Vec<Box<dyn CustomRule>>) -> Self {
        self.custom_rules = rules;
        self
    }

    /// Runs the whole battery under the total budget. A budget overrun
    /// surfaces as `api_timeout` on the step that was in flight.
    pub async fn validate(&self, symbol: &Symbol) -> Result<Verdict> {
        let budget = std::time::Duration::from_secs(self.config.total_budget_secs);
        match tokio::time::timeout(budget, self.run_checks(symbol)).await {
            Ok(verdict) => verdict,
            Err(_) => Ok(Verdict::Fail(
                ValidationFailure::new(FailReason::ApiTimeout, "total_budget").with_metadata(
                    json!({ "budget_secs": self.config.total_budget_secs }),
                ),
            )),
        }
    }

    async fn run_checks(&self, symbol: &Symbol) -> Result<Verdict> {
        let check_timeout = std::time::Duration::from_secs(self.config.check_timeout_secs);
        let probe_timeout = std::time::Duration::from_secs(self.config.data_probe_timeout_secs);

        // 1. Symbol existence via exchange metadata.
        let market_info =
            match tokio::time::timeout(check_timeout, self.provider.get_market_info(symbol)).await
            {
                Err(_) => return fail(FailReason::ApiTimeout, "symbol_existence", None),
                Ok(Err(e)) => {
                    return fail(
                        FailReason::SymbolNotFound,
                        "symbol_existence",
                        Some(json!({ "error": e.to_string() })),
                    );
                }
                Ok(Ok(info)) => info,
            };

        // 2. Exchange supported.
        let exchange = self.provider.name();
        if !self
            .config
            .allowed_exchanges
            .iter()
            .any(|allowed| allowed == exchange)
        {
            return fail(
                FailReason::ExchangeNotSupported,
                "exchange_supported",
                Some(json!({ "exchange": exchange, "allowed": self.config.allowed_exchanges })),
            );
        }

        // 3. Both databases reachable with the required tables present.
        if let Some(failure) = self.check_databases().await {
            return Ok(Verdict::Fail(failure));
        }

        // 4. Connection round-trip.
        let now = Utc::now();
        match tokio::time::timeout(
            check_timeout,
            self.provider
                .get_ohlcv(symbol, Timeframe::OneHour, now - Duration::hours(3), now),
        )
        .await
        {
            Err(_) => return fail(FailReason::ApiTimeout, "connection_round_trip", None),
            Ok(Err(e)) => {
                return fail(
                    FailReason::ApiTimeout,
                    "connection_round_trip",
                    Some(json!({ "error": e.to_string() })),
                );
            }
            Ok(Ok(_)) => {}
        }

        // 5. Instrument currently tradable.
        if let Some(failure) = check_tradable(&market_info) {
            return Ok(Verdict::Fail(failure));
        }

        // 6. Host resources.
        let snapshot = tokio::task::spawn_blocking(resources::probe).await?;
        if !snapshot.within(
            self.config.max_cpu_pct,
            self.config.max_memory_pct,
            self.config.min_free_disk_gib,
        ) {
            return fail(
                FailReason::InsufficientResources,
                "host_resources",
                Some(json!({
                    "cpu_pct": snapshot.cpu_pct,
                    "memory_pct": snapshot.memory_pct,
                    "free_disk_gib": snapshot.free_disk_gib,
                })),
            );
        }

        // 7. Recent-sample data quality: 1h completeness over the last 30 days.
        let probe = tokio::time::timeout(
            probe_timeout,
            self.provider
                .get_ohlcv(symbol, Timeframe::OneHour, now - Duration::days(30), now),
        )
        .await;
        let recent = match probe {
            Err(_) => return fail(FailReason::ApiTimeout, "data_quality_probe", None),
            Ok(Err(e)) => {
                return fail(
                    FailReason::ApiTimeout,
                    "data_quality_probe",
                    Some(json!({ "error": e.to_string() })),
                );
            }
            Ok(Ok(candles)) => candles,
        };
        let expected = 30 * 24;
        let completeness_pct = completeness_pct(recent.len(), expected);
        if !completeness_ok(completeness_pct, self.config.min_completeness_pct) {
            return fail(
                FailReason::InsufficientDataQuality,
                "data_quality",
                Some(json!({
                    "completeness_pct": completeness_pct,
                    "required_pct": self.config.min_completeness_pct,
                })),
            );
        }

        // 8. Historical reach: a candle must exist at now - required_days.
        let required_start = now - Duration::days(self.config.required_history_days);
        let reach = tokio::time::timeout(
            probe_timeout,
            self.provider.get_ohlcv(
                symbol,
                Timeframe::OneHour,
                required_start - Duration::days(1),
                required_start + Duration::days(1),
            ),
        )
        .await;
        let old_candles = match reach {
            Err(_) => return fail(FailReason::ApiTimeout, "historical_reach", None),
            Ok(Err(e)) => {
                return fail(
                    FailReason::ApiTimeout,
                    "historical_reach",
                    Some(json!({ "error": e.to_string() })),
                );
            }
            Ok(Ok(candles)) => candles,
        };
        if old_candles.is_empty() {
            return fail(
                FailReason::InsufficientHistoricalData,
                "historical_reach",
                Some(json!({ "required_days": self.config.required_history_days })),
            );
        }

        // 9. Custom rules, in registration order.
        for rule in &self.custom_rules {
            if let Err(message) = rule.check(symbol).await {
                warn!("Custom rule '{}' rejected {}: {}", rule.name(), symbol, message);
                return fail(
                    FailReason::CustomRuleViolation,
                    "custom_rules",
                    Some(json!({ "rule": rule.name(), "message": message })),
                );
            }
        }

        info!("Early-fail validation passed for {}", symbol);
        Ok(Verdict::Pass)
    }

    async fn check_databases(&self) -> Option<ValidationFailure> {
        let db_timeout = std::time::Duration::from_secs(1);
        let ledger_ok = tokio::time::timeout(
            db_timeout,
            database::has_tables(self.ledger.pool(), &ledger_repository::REQUIRED_TABLES),
        )
        .await;
        let analysis_ok = tokio::time::timeout(
            db_timeout,
            database::has_tables(self.analysis.pool(), &analysis_repository::REQUIRED_TABLES),
        )
        .await;

        let describe = |r: &std::result::Result<Result<bool>, tokio::time::error::Elapsed>| {
            match r {
                Err(_) => Some("timeout".to_string()),
                Ok(Err(e)) => Some(e.to_string()),
                Ok(Ok(false)) => Some("missing tables".to_string()),
                Ok(Ok(true)) => None,
            }
        };

        let ledger_err = describe(&ledger_ok);
        let analysis_err = describe(&analysis_ok);
        if ledger_err.is_some() || analysis_err.is_some() {
            return Some(
                ValidationFailure::new(FailReason::DatabaseConnectionFailed, "databases")
                    .with_metadata(json!({
                        "ledger": ledger_err,
                        "analysis": analysis_err,
                    })),
            );
        }
        None
    }
}

fn check_tradable(info: &MarketInfo) -> Option<ValidationFailure> {
    if !info.is_active {
        return Some(
            ValidationFailure::new(FailReason::SymbolNotTradable, "tradable")
                .with_metadata(json!({ "native_symbol": info.native_symbol })),
        );
    }
    if info.volume_24h <= 0.0 {
        return Some(
            ValidationFailure::new(FailReason::InsufficientLiquidity, "tradable")
                .with_metadata(json!({ "volume_24h": info.volume_24h })),
        );
    }
    None
}

fn completeness_pct(rows: usize, expected: usize) -> f64 {
    if expected == 0 {
        0.0
    } else {
        rows as f64 / expected as f64 * 100.0
    }
}

/// Exactly the required percentage passes; anything below fails.
fn completeness_ok(pct: f64, required_pct: f64) -> bool {
    pct >= required_pct
}

fn fail(
    reason: FailReason,
    step: &str,
    metadata: Option<serde_json::Value>,
) -> Result<Verdict> {
    let mut failure = ValidationFailure::new(reason, step);
    if let Some(metadata) = metadata {
        failure = failure.with_metadata(metadata);
    }
    Ok(Verdict::Fail(failure))
}
