//! Configuration module for levscan.
//!
//! Structured configuration loading from environment variables, plus the
//! central defaults file every threshold resolves through.

pub mod defaults;
pub mod filter_params;
pub mod thresholds;

pub use defaults::CentralDefaults;
pub use filter_params::{FILTER_PARAMS_ENV, FilterParams};
pub use thresholds::ResolvedThresholds;

use anyhow::{Context, Result, bail};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable carrying the backtest/realtime flag. It is
/// propagated explicitly parent → worker and never defaulted: a worker
/// started without it is a programming error and must raise.
pub const ANALYSIS_MODE_ENV: &str = "ANALYSIS_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Backtest,
    Realtime,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Backtest => "backtest",
            AnalysisMode::Realtime => "realtime",
        }
    }

    /// Reads the mandatory mode flag. Absence raises.
    pub fn from_env() -> Result<Self> {
        let raw = env::var(ANALYSIS_MODE_ENV).with_context(|| {
            format!(
                "{} is not set; the parent must propagate it explicitly",
                ANALYSIS_MODE_ENV
            )
        })?;
        raw.parse()
    }
}

impl FromStr for AnalysisMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "backtest" => Ok(AnalysisMode::Backtest),
            "realtime" => Ok(AnalysisMode::Realtime),
            _ => bail!("Invalid {}: '{}'", ANALYSIS_MODE_ENV, s),
        }
    }
}

/// Process-level configuration, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ledger_db_url: String,
    pub analysis_db_url: String,
    /// Active exchange identity ("hyperliquid" or "gateio").
    pub provider: String,
    /// Content-addressed store for compressed per-task trade blobs.
    pub blob_dir: PathBuf,
    /// Shared directory for advisory progress snapshot files.
    pub progress_dir: PathBuf,
    /// Configured cap; the effective pool size is min(cap, host CPUs).
    pub max_workers: usize,
    pub bind_address: String,
    /// Optional override of the embedded central defaults file.
    pub defaults_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let max_workers = env::var("MAX_WORKERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse::<usize>()
            .context("MAX_WORKERS must be a positive integer")?;
        if max_workers == 0 {
            bail!("MAX_WORKERS must be at least 1");
        }

        Ok(Self {
            ledger_db_url: env::var("LEDGER_DB_URL")
                .unwrap_or_else(|_| "sqlite://data/ledger.db".to_string()),
            analysis_db_url: env::var("ANALYSIS_DB_URL")
                .unwrap_or_else(|_| "sqlite://data/analysis.db".to_string()),
            provider: env::var("DATA_PROVIDER").unwrap_or_else(|_| "hyperliquid".to_string()),
            blob_dir: env::var("BLOB_DIR")
                .unwrap_or_else(|_| "data/blobs".to_string())
                .into(),
            progress_dir: env::var("PROGRESS_DIR")
                .unwrap_or_else(|_| "data/progress".to_string())
                .into(),
            max_workers,
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "127.0.0.1:8787".to_string()),
            defaults_path: env::var("LEVSCAN_DEFAULTS").ok().map(PathBuf::from),
        })
    }

    pub fn load_defaults(&self) -> Result<CentralDefaults> {
        CentralDefaults::load(self.defaults_path.as_deref())
    }
}
