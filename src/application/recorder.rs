//! Result recorder.
//!
//! Routes every evaluation into exactly one of three paths (signal,
//! no-signal, early exit), keeps the running accounting, journals each
//! signal to disk as it is emitted (so a cancelled or killed task loses
//! nothing already processed), and on finalization runs the post-hoc exit
//! simulation, computes aggregates, and writes the gzip-compressed
//! content-addressed trade blob.

use crate::application::decision::AnalysisResult;
use crate::application::filtering::Evaluation;
use crate::domain::candle::Candle;
use crate::domain::outcome::{
    AnalysisAggregates, DecisionStage, Signal, TaskStats, TradeRecord,
};
use crate::domain::task::TaskKey;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The persisted, compressed per-task artifact.
#[derive(Debug, Serialize, Deserialize)]
pub struct TradeBlob {
    pub execution_id: String,
    pub strategy_id: i64,
    pub timeframe: String,
    pub strategy_tag: String,
    pub stats: TaskStats,
    pub trades: Vec<TradeRecord>,
}

pub struct FinalizedTask {
    pub aggregates: AnalysisAggregates,
    pub stats: TaskStats,
    pub trades: Vec<TradeRecord>,
    pub blob_path: Option<PathBuf>,
}

pub struct TaskRecorder {
    key: TaskKey,
    strategy_tag: String,
    blob_dir: PathBuf,
    journal_path: PathBuf,
    journal: File,
    stats: TaskStats,
    signals: Vec<Signal>,
}

impl TaskRecorder {
    pub fn new(
        blob_dir: &Path,
        key: TaskKey,
        strategy_tag: String,
        total_candidates: usize,
    ) -> Result<Self> {
        let journal_dir = blob_dir.join("journal").join(&key.execution_id);
        std::fs::create_dir_all(&journal_dir)
            .with_context(|| format!("Failed to create journal dir {:?}", journal_dir))?;
        let journal_path = journal_dir.join(format!("{}.jsonl", key.file_stem()));
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .with_context(|| format!("Failed to open journal {:?}", journal_path))?;

        Ok(Self {
            key,
            strategy_tag,
            blob_dir: blob_dir.to_path_buf(),
            journal_path,
            journal,
            stats: TaskStats {
                total_candidates,
                ..TaskStats::default()
            },
            signals: Vec::new(),
        })
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    /// Records one evaluation. Signals are flushed to the journal before the
    /// method returns, making each evaluation's write atomic at the
    /// append-a-line granularity.
    pub fn record(&mut self, at: DateTime<Utc>, evaluation: &Evaluation) -> Result<()> {
        match evaluation {
            Evaluation::Cancelled => return Ok(()),
            Evaluation::GateRejected { stage, .. } => {
                self.stats.evaluations_run += 1;
                self.stats.record_gate_rejection(*stage);
            }
            Evaluation::Outcome(result) => {
                self.stats.evaluations_run += 1;
                self.route_outcome(at, result)?;
            }
        }
        Ok(())
    }

    fn route_outcome(&mut self, at: DateTime<Utc>, result: &AnalysisResult) -> Result<()> {
        if let Some(recommendation) = &result.recommendation {
            let signal = Signal {
                timestamp: at,
                strategy_tag: self.strategy_tag.clone(),
                recommendation: recommendation.clone(),
                stage_results: result.stage_results.clone(),
            };
            let line = serde_json::to_string(&signal)?;
            writeln!(self.journal, "{}", line).context("Failed to append signal journal")?;
            self.journal.flush().context("Failed to flush signal journal")?;
            self.signals.push(signal);
            self.stats.signals += 1;
        } else if result.early_exit {
            let stage = result.exit_stage.unwrap_or(DecisionStage::DataSlice);
            let reason = result
                .exit_reason
                .unwrap_or(crate::domain::outcome::EarlyExitReason::InsufficientData);
            self.stats.record_early_exit(stage, reason);
        } else {
            // Full chain ran, decision declined. A valid, final outcome.
            self.stats.no_signals += 1;
        }
        Ok(())
    }

    /// Finishes the task: exit-simulates every emitted signal against the
    /// full series, computes aggregates, writes the compressed blob, and
    /// removes the journal. Safe to call after a partial run (cancellation):
    /// whatever was processed is preserved.
    pub fn finalize(self, full_series: &[Candle]) -> Result<FinalizedTask> {
        debug_assert!(self.stats.is_balanced(), "outcome accounting out of balance");

        let trades: Vec<TradeRecord> = self
            .signals
            .iter()
            .map(|signal| simulate_exit(signal, full_series))
            .collect();
        let aggregates = aggregate(&trades);

        let blob_path = if trades.is_empty() && self.stats.evaluations_run == 0 {
            None
        } else {
            let blob = TradeBlob {
                execution_id: self.key.execution_id.clone(),
                strategy_id: self.key.strategy_id,
                timeframe: self.key.timeframe.label().to_string(),
                strategy_tag: self.strategy_tag.clone(),
                stats: self.stats.clone(),
                trades: trades.clone(),
            };
            Some(write_blob(&self.blob_dir, &blob)?)
        };

        let _ = std::fs::remove_file(&self.journal_path);

        info!(
            "Task {} finalized: {} trades, {} no-signals, {} early exits over {} evaluations",
            self.key,
            self.stats.signals,
            self.stats.no_signals,
            self.stats.total_early_exits(),
            self.stats.evaluations_run
        );

        Ok(FinalizedTask {
            aggregates,
            stats: self.stats,
            trades,
            blob_path,
        })
    }
}

/// Post-hoc exit simulation: walks candles strictly after the signal until
/// the stop or the take is struck. Intra-candle both-sides hits resolve to
/// the stop (the conservative read). An unresolved trade closes at the last
/// available close.
fn simulate_exit(signal: &Signal, series: &[Candle]) -> TradeRecord {
    let entry = signal.recommendation.entry_price;
    let stop = signal.recommendation.stop_loss;
    let take = signal.recommendation.take_profit;
    let start = series.partition_point(|c| c.timestamp <= signal.timestamp);

    let mut exit_price = series.last().map(|c| c.close).unwrap_or(entry);
    let mut exit_timestamp = None;
    for candle in &series[start..] {
        if candle.low <= stop {
            exit_price = stop;
            exit_timestamp = Some(candle.timestamp);
            break;
        }
        if candle.high >= take {
            exit_price = take;
            exit_timestamp = Some(candle.timestamp);
            break;
        }
    }

    let pnl_pct = (exit_price - entry) / entry;
    let leveraged_return_pct = pnl_pct * signal.recommendation.leverage;
    TradeRecord {
        signal: signal.clone(),
        exit_price,
        exit_timestamp,
        pnl_pct,
        leveraged_return_pct,
        is_win: pnl_pct > 0.0,
    }
}

fn aggregate(trades: &[TradeRecord]) -> AnalysisAggregates {
    if trades.is_empty() {
        return AnalysisAggregates::default();
    }
    let n = trades.len() as f64;
    let wins = trades.iter().filter(|t| t.is_win).count() as f64;
    let returns: Vec<f64> = trades.iter().map(|t| t.leveraged_return_pct).collect();

    let mean = returns.iter().sum::<f64>() / n;
    let sharpe = if returns.len() > 1 {
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
        let std_dev = variance.sqrt();
        if std_dev > 1e-5 { Some(mean / std_dev) } else { Some(0.0) }
    } else {
        Some(0.0)
    };

    // Max drawdown over the compounded equity curve, as a fraction of peak.
    let mut equity = 1.0f64;
    let mut peak = 1.0f64;
    let mut max_drawdown = 0.0f64;
    for r in &returns {
        equity *= 1.0 + r;
        peak = peak.max(equity);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - equity) / peak);
        }
    }

    let avg_leverage =
        trades.iter().map(|t| t.signal.recommendation.leverage).sum::<f64>() / n;

    AnalysisAggregates {
        total_trades: trades.len() as u64,
        win_rate: Some(wins / n),
        sharpe_ratio: sharpe,
        max_drawdown: Some(max_drawdown),
        avg_leverage: Some(avg_leverage),
    }
}

/// Serializes, compresses, and stores the blob under a content-addressed
/// path (`<blob_dir>/<hh>/<sha256>.json.gz`).
fn write_blob(blob_dir: &Path, blob: &TradeBlob) -> Result<PathBuf> {
    let raw = serde_json::to_vec(blob)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish().context("Failed to compress trade blob")?;

    let digest = hex::encode(Sha256::digest(&compressed));
    let subdir = blob_dir.join(&digest[..2]);
    std::fs::create_dir_all(&subdir)
        .with_context(|| format!("Failed to create blob dir {:?}", subdir))?;
    let path = subdir.join(format!("{}.json.gz", digest));
    std::fs::write(&path, &compressed)
        .with_context(|| format!("Failed to write blob {:?}", path))?;

    debug!(
        "Blob {}: {} -> {} bytes ({:.0}% reduction)",
        digest,
        raw.len(),
        compressed.len(),
        (1.0 - compressed.len() as f64 / raw.len() as f64) * 100.0
    );
    Ok(path)
}

/// Reads a blob back, for inspection tooling and tests.
pub fn read_blob(path: &Path) -> Result<TradeBlob> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let file = File::open(path).with_context(|| format!("Failed to open blob {:?}", path))?;
    let mut decoder = GzDecoder::new(file);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .context("Failed to decompress trade blob")?;
    Ok(serde_json::from_slice(&raw)?)
}
