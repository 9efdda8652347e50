//! Bounded worker pool.
//!
//! Each task runs end-to-end in one short-lived worker subprocess (isolation
//! against memory growth, clean cancellation by process termination). The
//! pool caps concurrency at `min(configured cap, host CPUs)`, watches the
//! ledger for cancellation, escalates to `kill` after the grace window, and
//! finalizes the execution row from the terminal task states.

use crate::application::worker::{TaskRunOutcome, WorkerEnv, run_task};
use crate::config::{ANALYSIS_MODE_ENV, AnalysisMode, AppConfig, FILTER_PARAMS_ENV, FilterParams};
use crate::domain::execution::{Execution, ExecutionErrorRecord, ExecutionStatus};
use crate::domain::task::{AnalysisTask, TaskKey, TaskStatus};
use crate::infrastructure::persistence::{AnalysisRepository, LedgerRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Seam between the pool and the process boundary. Production launches the
/// `worker` subcommand of this binary; tests run the worker in-process.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        key: &TaskKey,
        filter_params: &FilterParams,
        cancel_grace: Duration,
        ledger: LedgerRepository,
    ) -> Result<TaskRunOutcome>;
}

/// Spawns `<current_exe> worker ...` with the task key on argv and
/// `FILTER_PARAMS` / `ANALYSIS_MODE` in the environment. Nothing else
/// crosses the boundary; the worker re-resolves config from the databases
/// and the central defaults.
pub struct SubprocessLauncher {
    config: AppConfig,
    poll_interval: Duration,
}

impl SubprocessLauncher {
    pub fn new(config: AppConfig, poll_interval: Duration) -> Self {
        Self {
            config,
            poll_interval,
        }
    }
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
    async fn launch(
        &self,
        key: &TaskKey,
        filter_params: &FilterParams,
        cancel_grace: Duration,
        ledger: LedgerRepository,
    ) -> Result<TaskRunOutcome> {
        let exe = std::env::current_exe().context("Cannot resolve worker executable")?;
        let mut command = tokio::process::Command::new(exe);
        command
            .arg("worker")
            .arg("--execution-id")
            .arg(&key.execution_id)
            .arg("--strategy-id")
            .arg(key.strategy_id.to_string())
            .arg("--timeframe")
            .arg(key.timeframe.label())
            .env(FILTER_PARAMS_ENV, filter_params.to_env_json()?)
            .env(ANALYSIS_MODE_ENV, AnalysisMode::Backtest.as_str())
            .env("LEDGER_DB_URL", &self.config.ledger_db_url)
            .env("ANALYSIS_DB_URL", &self.config.analysis_db_url)
            .env("DATA_PROVIDER", &self.config.provider)
            .env("BLOB_DIR", &self.config.blob_dir)
            .env("PROGRESS_DIR", &self.config.progress_dir)
            .kill_on_drop(true);
        if let Some(defaults_path) = &self.config.defaults_path {
            command.env("LEVSCAN_DEFAULTS", defaults_path);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn worker for {}", key))?;

        // Cooperative cancel first; kill only after the grace window.
        let watch = async {
            loop {
                match ledger.is_cancelled(&key.execution_id).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => warn!("Pool cancellation poll failed: {}", e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
            tokio::time::sleep(cancel_grace).await;
        };

        tokio::select! {
            status = child.wait() => {
                let status = status.context("Worker wait failed")?;
                Ok(match status.code() {
                    Some(0) => TaskRunOutcome::Completed,
                    Some(2) => TaskRunOutcome::Skipped,
                    code => TaskRunOutcome::Failed(format!(
                        "worker exited with {:?}", code
                    )),
                })
            }
            _ = watch => {
                warn!("Worker for {} exceeded the cancellation grace window; killing", key);
                child.kill().await.ok();
                let _ = child.wait().await;
                Ok(TaskRunOutcome::Failed("cancelled_hard".to_string()))
            }
        }
    }
}

/// Runs the worker in this process. Used by tests and by single-process
/// deployments where subprocess isolation is not wanted.
pub struct InProcessLauncher {
    env: Arc<WorkerEnv>,
}

impl InProcessLauncher {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        key: &TaskKey,
        filter_params: &FilterParams,
        _cancel_grace: Duration,
        _ledger: LedgerRepository,
    ) -> Result<TaskRunOutcome> {
        run_task(
            &self.env,
            key.clone(),
            filter_params.clone(),
            AnalysisMode::Backtest,
        )
        .await
    }
}

pub struct WorkerPool {
    ledger: LedgerRepository,
    analysis: AnalysisRepository,
    launcher: Arc<dyn WorkerLauncher>,
    max_workers: usize,
    cancel_grace: Duration,
}

impl WorkerPool {
    pub fn new(
        ledger: LedgerRepository,
        analysis: AnalysisRepository,
        launcher: Arc<dyn WorkerLauncher>,
        configured_cap: usize,
        cancel_grace: Duration,
    ) -> Self {
        let host_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let max_workers = configured_cap.min(host_cpus).max(1);
        Self {
            ledger,
            analysis,
            launcher,
            max_workers,
            cancel_grace,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs every planned task to a terminal state and finalizes the
    /// execution row. Returns the final execution status.
    pub async fn run_execution(
        &self,
        execution: &Execution,
        tasks: Vec<AnalysisTask>,
    ) -> Result<ExecutionStatus> {
        let total = tasks.len().max(1);
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let filter_params: FilterParams =
            serde_json::from_value(execution.filter_params.clone()).unwrap_or_default();

        info!(
            "Running {} tasks for {} with {} workers",
            tasks.len(),
            execution.execution_id,
            self.max_workers
        );

        let mut pending = FuturesUnordered::new();
        for task in tasks {
            let semaphore = semaphore.clone();
            let launcher = self.launcher.clone();
            let ledger = self.ledger.clone();
            let analysis = self.analysis.clone();
            let filter_params = filter_params.clone();
            let cancel_grace = self.cancel_grace;

            pending.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;

                // Checkpoint: before task start. Never start work for a
                // cancelled execution.
                match ledger.is_cancelled(&task.key.execution_id).await {
                    Ok(true) => {
                        let _ = analysis.mark_task_skipped(&task.key, "cancelled").await;
                        return (task.key, TaskRunOutcome::Skipped);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Pre-start cancellation check failed: {}", e),
                }

                let outcome = match launcher
                    .launch(&task.key, &filter_params, cancel_grace, ledger)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => TaskRunOutcome::Failed(format!("launch failed: {:#}", e)),
                };
                (task.key, outcome)
            }));
        }

        // Process results in completion order so progress moves as soon as
        // any task lands.
        let mut terminal = 0usize;
        while let Some(joined) = pending.next().await {
            let (key, outcome) = joined.context("Worker join failed")?;
            terminal += 1;
            let progress = terminal as f64 / total as f64 * 100.0;
            let operation = match &outcome {
                TaskRunOutcome::Completed => format!("task {} completed", key),
                TaskRunOutcome::Skipped => format!("task {} skipped", key),
                TaskRunOutcome::Failed(message) => {
                    self.ledger
                        .append_error(
                            &key.execution_id,
                            &ExecutionErrorRecord::new("task_error", message.clone()),
                        )
                        .await
                        .ok();
                    format!("task {} failed", key)
                }
            };
            self.ledger
                .update_progress(&key.execution_id, progress, &operation)
                .await
                .ok();
        }

        self.finalize(execution).await
    }

    /// Ledger finalizer: reconciles task rows and derives the terminal
    /// execution status.
    async fn finalize(&self, execution: &Execution) -> Result<ExecutionStatus> {
        let execution_id = &execution.execution_id;
        let was_cancelled = self.ledger.is_cancelled(execution_id).await?;

        if was_cancelled {
            let skipped = self
                .analysis
                .skip_pending_tasks(execution_id, "cancelled")
                .await?;
            // A worker that survived the kill escalation left its row
            // `running`; force those to failed.
            let hard_failed = self
                .analysis
                .force_fail_running_tasks(execution_id, "cancelled_hard")
                .await?;
            info!(
                "Execution {} cancelled: {} pending skipped, {} hard-failed",
                execution_id, skipped, hard_failed
            );
            self.ledger
                .update_status(
                    execution_id,
                    ExecutionStatus::Cancelled,
                    None,
                    Some("cancelled"),
                )
                .await?;
            return Ok(ExecutionStatus::Cancelled);
        }

        let tasks = self.analysis.tasks_for_execution(execution_id).await?;
        let any_failed = tasks.iter().any(|t| t.status == TaskStatus::Failed);
        let any_completed = tasks.iter().any(|t| t.status == TaskStatus::Completed);
        let all_terminal = tasks.iter().all(|t| t.status.is_terminal());

        let status = if !all_terminal {
            warn!(
                "Execution {} finalizing with non-terminal tasks; forcing failed",
                execution_id
            );
            self.analysis
                .force_fail_running_tasks(execution_id, "worker lost")
                .await?;
            ExecutionStatus::Failed
        } else if any_failed {
            ExecutionStatus::Failed
        } else if any_completed {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };

        let (progress, operation) = match status {
            ExecutionStatus::Success => (Some(100.0), "analysis complete"),
            _ => (None, "analysis finished with failures"),
        };
        self.ledger
            .update_status(execution_id, status, progress, Some(operation))
            .await?;
        info!("Execution {} finalized as {}", execution_id, status);
        Ok(status)
    }
}
