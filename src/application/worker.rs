//! Task worker.
//!
//! Runs exactly one `(execution, strategy, timeframe)` task end-to-end:
//! loads the config snapshots, fetches and prepares market data, walks the
//! evaluation grid in ascending timestamp order through the filter chain and
//! decision path, records every outcome, and finalizes the task row. This is
//! the body of the short-lived worker subprocess; tests drive it in-process.

use crate::application::cancel::{CancelFlag, spawn_cancellation_poller};
use crate::application::filtering::{Evaluation, FilterEngine, PreparedData, build_grid};
use crate::application::progress::{ProgressSnapshot, ProgressStore};
use crate::application::recorder::TaskRecorder;
use crate::config::{AnalysisMode, AppConfig, CentralDefaults, FilterParams, ResolvedThresholds};
use crate::domain::candle::Symbol;
use crate::domain::errors::AnalysisError;
use crate::domain::task::{TaskKey, TaskStatus};
use crate::infrastructure::persistence::{AnalysisRepository, LedgerRepository};
use crate::infrastructure::providers::{MarketDataProvider, ModeGuardedProvider};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared handles a worker needs. Built once per worker process.
pub struct WorkerEnv {
    pub config: AppConfig,
    pub defaults: CentralDefaults,
    pub ledger: LedgerRepository,
    pub analysis: AnalysisRepository,
    pub provider: Arc<dyn MarketDataProvider>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Completed,
    /// Cancellation observed at a checkpoint; processed outcomes are durable.
    Skipped,
    Failed(String),
}

impl TaskRunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskRunOutcome::Completed => 0,
            TaskRunOutcome::Skipped => 2,
            TaskRunOutcome::Failed(_) => 3,
        }
    }
}

pub async fn run_task(
    env: &WorkerEnv,
    key: TaskKey,
    filter_params: FilterParams,
    mode: AnalysisMode,
) -> Result<TaskRunOutcome> {
    // Checkpoint: before task start.
    if env.ledger.is_cancelled(&key.execution_id).await? {
        env.analysis.mark_task_skipped(&key, "cancelled").await?;
        return Ok(TaskRunOutcome::Skipped);
    }

    match run_task_inner(env, &key, filter_params, mode).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            let message = classify_task_error(&e);
            error!("Task {} failed: {}", key, message);
            env.analysis.mark_task_failed(&key, &message).await?;
            Ok(TaskRunOutcome::Failed(message))
        }
    }
}

async fn run_task_inner(
    env: &WorkerEnv,
    key: &TaskKey,
    filter_params: FilterParams,
    mode: AnalysisMode,
) -> Result<TaskRunOutcome> {
    let execution = env
        .ledger
        .get(&key.execution_id)
        .await?
        .with_context(|| format!("Unknown execution {}", key.execution_id))?;
    let symbol = execution.symbol.clone();

    let strategy = env
        .analysis
        .get_strategy(key.strategy_id)
        .await?
        .ok_or_else(|| {
            anyhow::Error::from(AnalysisError::missing_config(format!(
                "strategy_configurations.{}",
                key.strategy_id
            )))
        })?;
    let thresholds = ResolvedThresholds::resolve(&filter_params, &strategy, &env.defaults)
        .map_err(anyhow::Error::from)?;

    env.analysis.mark_task_running(key).await?;
    info!("Task {} running ({} on {})", key, strategy.tag(), symbol);

    // The mode guard makes any real-time price call in backtest mode an
    // error rather than a silent lookahead.
    let provider: Arc<dyn MarketDataProvider> =
        Arc::new(ModeGuardedProvider::new(env.provider.clone(), mode));

    let period = filter_params.period.unwrap_or_default();
    let now = period.end_date.unwrap_or_else(Utc::now);
    let fetch_start = fetch_window_start(&thresholds, &env.defaults, strategy.timeframe.minutes(), now);
    let candles = provider
        .get_ohlcv(&symbol, strategy.timeframe, fetch_start, now)
        .await
        .context("Initial candle fetch failed")?;
    if candles.is_empty() {
        return Err(AnalysisError::insufficient_data("task_window", 0, 1).into());
    }

    let btc_symbol = Symbol::parse(&env.defaults.btc.reference_symbol)?;
    let btc_candles = match provider
        .get_ohlcv(&btc_symbol, strategy.timeframe, fetch_start, now)
        .await
    {
        Ok(candles) => candles,
        Err(e) => {
            // Not task-fatal: evaluations needing the reference series will
            // early-exit at the correlation step instead.
            warn!("BTC reference fetch failed for {}: {}", key, e);
            Vec::new()
        }
    };

    let mut window_start = now - Duration::days(thresholds.lookback_days);
    if let Some(custom_start) = period.start_date {
        window_start = window_start.max(custom_start);
    }
    let first_eval = window_start.max(candles[0].timestamp);
    let data = PreparedData::prepare(
        symbol.clone(),
        strategy.timeframe,
        candles,
        btc_candles,
        &env.defaults,
        first_eval,
    )
    .map_err(anyhow::Error::from)?;

    let grid = build_grid(&data, &thresholds, now, period.start_date);
    let disabled: HashSet<_> = filter_params.disabled_filters.iter().copied().collect();
    let engine = FilterEngine::new(&data, &thresholds, &strategy, &env.defaults, disabled);

    let progress = ProgressStore::new(&env.config.progress_dir, &key.execution_id)?;
    let mut recorder = TaskRecorder::new(
        &env.config.blob_dir,
        key.clone(),
        strategy.tag(),
        grid.total_candidates,
    )?;

    let cancel = CancelFlag::new();
    let poller = spawn_cancellation_poller(
        env.ledger.clone(),
        key.execution_id.clone(),
        cancel.clone(),
        std::time::Duration::from_millis(env.defaults.cancellation.poll_interval_ms),
    );

    let snapshot_every = env.defaults.evaluation.snapshot_every.max(1);
    let total = grid.timepoints.len();
    let mut cancelled = false;

    for (index, at) in grid.timepoints.iter().enumerate() {
        // Checkpoint: between timepoints, every timepoint.
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        match engine.evaluate_at(*at, &cancel).map_err(anyhow::Error::from)? {
            Evaluation::Cancelled => {
                cancelled = true;
                break;
            }
            evaluation => recorder.record(*at, &evaluation)?,
        }

        if (index + 1) % snapshot_every == 0 || index + 1 == total {
            publish_progress(env, key, &progress, &recorder, index + 1, total, *at).await;
            tokio::task::yield_now().await;
        }
    }

    poller.abort();

    if cancelled {
        // Everything processed so far is flushed durably before the worker
        // reports the skip.
        let finalized = recorder.finalize(data.diagnostics_series())?;
        env.analysis
            .finalize_task(
                key,
                TaskStatus::Skipped,
                &finalized.aggregates,
                &finalized.stats,
                finalized.blob_path.as_deref().and_then(|p| p.to_str()),
                Some("cancelled"),
            )
            .await?;
        info!(
            "Task {} skipped after {} evaluations (cancelled)",
            key, finalized.stats.evaluations_run
        );
        return Ok(TaskRunOutcome::Skipped);
    }

    let finalized = recorder.finalize(data.diagnostics_series())?;
    env.analysis
        .finalize_task(
            key,
            TaskStatus::Completed,
            &finalized.aggregates,
            &finalized.stats,
            finalized.blob_path.as_deref().and_then(|p| p.to_str()),
            None,
        )
        .await?;

    if let Some(analysis_id) = env.analysis.analysis_id(key).await? {
        let wins = finalized.trades.iter().filter(|t| t.is_win).count() as u64;
        let losses = finalized.trades.len() as u64 - wins;
        let avg = (!finalized.trades.is_empty()).then(|| {
            finalized.trades.iter().map(|t| t.leveraged_return_pct).sum::<f64>()
                / finalized.trades.len() as f64
        });
        let best = finalized
            .trades
            .iter()
            .map(|t| t.leveraged_return_pct)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));
        let worst = finalized
            .trades
            .iter()
            .map(|t| t.leveraged_return_pct)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.min(r))));
        env.analysis
            .insert_trade_summary(
                analysis_id,
                &key.execution_id,
                finalized.aggregates.total_trades,
                wins,
                losses,
                avg,
                best,
                worst,
            )
            .await?;
    }

    Ok(TaskRunOutcome::Completed)
}

/// Fetches enough history before the evaluation window to warm up levels,
/// volatility, and the ML training set at this timeframe's candle width.
fn fetch_window_start(
    thresholds: &ResolvedThresholds,
    defaults: &CentralDefaults,
    timeframe_minutes: i64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let training_candles =
        (defaults.ml.min_training_rows + defaults.ml.label_horizon + defaults.ml.feature_window)
            as i64;
    let margin_minutes = training_candles * timeframe_minutes;
    let margin_days_div = margin_minutes / 1440;
    let margin_days_rem = margin_minutes % 1440;
    let margin_days = if margin_days_rem > 0 {
        margin_days_div + 1
    } else {
        margin_days_div
    }
    .max(30);
    now - Duration::days(thresholds.lookback_days + margin_days)
}

async fn publish_progress(
    env: &WorkerEnv,
    key: &TaskKey,
    progress: &ProgressStore,
    recorder: &TaskRecorder,
    done: usize,
    total: usize,
    at: DateTime<Utc>,
) {
    let snapshot = ProgressSnapshot::from_stats(key, recorder.stats(), done, total, None);
    if let Err(e) = progress.write(key, &snapshot) {
        warn!("Progress snapshot write failed for {}: {}", key, e);
    }
    let operation = format!(
        "analyzing {}@{}: timepoint {}/{} ({})",
        key.strategy_id,
        key.timeframe,
        done,
        total,
        at.format("%Y-%m-%d %H:%M")
    );
    if let Err(e) = env
        .ledger
        .update_progress(&key.execution_id, 0.0, &operation)
        .await
    {
        warn!("Ledger operation update failed for {}: {}", key, e);
    }
}

/// Maps the closed error taxonomy onto task failure messages. Everything
/// here fails only the owning task; sibling tasks continue.
fn classify_task_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<AnalysisError>() {
        Some(AnalysisError::InsufficientMarketData {
            context,
            rows,
            required,
        }) => format!(
            "insufficient market data ({}: {} rows, need {})",
            context, rows, required
        ),
        Some(AnalysisError::InsufficientConfiguration { key }) => {
            format!("missing configuration: {} (deployment bug)", key)
        }
        Some(AnalysisError::CriticalAnalysis { detail }) => {
            format!("critical invariant violated: {}", detail)
        }
        Some(other) => other.to_string(),
        None => format!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::{Execution, ExecutionStatus, OnboardingMode, new_execution_id};
    use crate::domain::strategy::BaseKind;
    use crate::domain::timeframe::Timeframe;
    use crate::infrastructure::persistence::database::open_pool;
    use crate::infrastructure::providers::mock::MockProvider;
    use crate::domain::task::AnalysisTask;

    async fn env_with_provider(provider: MockProvider) -> (tempfile::TempDir, WorkerEnv) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerRepository::new(
            open_pool(&format!("sqlite://{}/ledger.db", dir.path().display()))
                .await
                .unwrap(),
        );
        ledger.init().await.unwrap();
        let analysis = AnalysisRepository::new(
            open_pool(&format!("sqlite://{}/analysis.db", dir.path().display()))
                .await
                .unwrap(),
        );
        analysis.init().await.unwrap();
        analysis.seed_default_catalog().await.unwrap();

        let config = AppConfig {
            ledger_db_url: String::new(),
            analysis_db_url: String::new(),
            provider: "mock".to_string(),
            blob_dir: dir.path().join("blobs"),
            progress_dir: dir.path().join("progress"),
            max_workers: 2,
            bind_address: "127.0.0.1:0".to_string(),
            defaults_path: None,
        };
        let env = WorkerEnv {
            config,
            defaults: CentralDefaults::embedded().unwrap(),
            ledger,
            analysis,
            provider: Arc::new(provider),
        };
        (dir, env)
    }

    async fn seed_execution(env: &WorkerEnv, strategy_id: i64, timeframe: Timeframe) -> TaskKey {
        let execution = Execution {
            execution_id: new_execution_id(Utc::now()),
            symbol: Symbol::parse("SOL").unwrap(),
            mode: OnboardingMode::Selective,
            selected_strategy_ids: vec![strategy_id],
            status: ExecutionStatus::Running,
            progress_percent: 0.0,
            current_operation: String::new(),
            started_at: Utc::now(),
            completed_at: None,
            filter_params: serde_json::json!({}),
            errors: vec![],
        };
        env.ledger.create_execution(&execution).await.unwrap();
        let key = TaskKey {
            execution_id: execution.execution_id,
            strategy_id,
            timeframe,
        };
        env.analysis
            .create_pending_task(&AnalysisTask::pending(key.clone(), Utc::now()))
            .await
            .unwrap();
        key
    }

    async fn balanced_strategy_id(env: &WorkerEnv) -> i64 {
        env.analysis
            .list_active_defaults()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.base_kind == BaseKind::Balanced && s.timeframe == Timeframe::OneHour)
            .unwrap()
            .id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_task_completes_and_accounts() {
        let (_dir, env) = env_with_provider(MockProvider::default()).await;
        let strategy_id = balanced_strategy_id(&env).await;
        let key = seed_execution(&env, strategy_id, Timeframe::OneHour).await;

        let outcome = run_task(
            &env,
            key.clone(),
            FilterParams::default(),
            AnalysisMode::Backtest,
        )
        .await
        .unwrap();
        assert_eq!(outcome, TaskRunOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);

        let tasks = env.analysis.tasks_for_execution(&key.execution_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert!(tasks[0].completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_precancelled_task_is_skipped() {
        let (_dir, env) = env_with_provider(MockProvider::default()).await;
        let strategy_id = balanced_strategy_id(&env).await;
        let key = seed_execution(&env, strategy_id, Timeframe::OneHour).await;
        env.ledger.request_cancel(&key.execution_id).await.unwrap();

        let outcome = run_task(
            &env,
            key.clone(),
            FilterParams::default(),
            AnalysisMode::Backtest,
        )
        .await
        .unwrap();
        assert_eq!(outcome, TaskRunOutcome::Skipped);
        assert_eq!(outcome.exit_code(), 2);

        let tasks = env.analysis.tasks_for_execution(&key.execution_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Skipped);
        assert_eq!(tasks[0].error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_strategy_fails_task_only() {
        let (_dir, env) = env_with_provider(MockProvider::default()).await;
        let key = seed_execution(&env, 424242, Timeframe::OneHour).await;

        let outcome = run_task(
            &env,
            key.clone(),
            FilterParams::default(),
            AnalysisMode::Backtest,
        )
        .await
        .unwrap();
        match outcome {
            TaskRunOutcome::Failed(message) => {
                assert!(message.contains("missing configuration"))
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let tasks = env.analysis.tasks_for_execution(&key.execution_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
    }
}
