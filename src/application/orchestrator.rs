//! Onboarding orchestrator.
//!
//! One entry point for "analyze instrument X": runs the early-fail battery,
//! writes the ledger rows (rejections included, since the ledger is the
//! audit trail), expands the request into pending tasks, and hands the task
//! list to the worker pool. The HTTP handler detaches the heavy phase and
//! returns the execution id immediately; the CLI awaits it.

use crate::application::planner::{CustomStrategySpec, TaskPlanner};
use crate::application::validation::early_fail::{EarlyFailValidator, Verdict};
use crate::application::worker_pool::WorkerPool;
use crate::config::FilterParams;
use crate::domain::candle::Symbol;
use crate::domain::errors::ValidationFailure;
use crate::domain::execution::{
    Execution, ExecutionErrorRecord, ExecutionStatus, OnboardingMode, new_execution_id,
};
use crate::domain::task::AnalysisTask;
use crate::infrastructure::persistence::{AnalysisRepository, LedgerRepository};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingRequest {
    pub symbol: String,
    pub mode: OnboardingMode,
    #[serde(default)]
    pub selected_strategy_ids: Vec<i64>,
    #[serde(default)]
    pub filter_params: Option<FilterParams>,
    #[serde(default)]
    pub custom_strategies: Vec<CustomStrategySpec>,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Request accepted; tasks are planned and the pool owns them now.
    Accepted {
        execution: Execution,
        tasks: Vec<AnalysisTask>,
    },
    /// Early-fail rejection. A failed ledger row exists for the audit trail.
    Rejected {
        execution_id: String,
        failure: ValidationFailure,
    },
}

pub struct OnboardingService {
    validator: EarlyFailValidator,
    planner: TaskPlanner,
    pool: Arc<WorkerPool>,
    ledger: LedgerRepository,
    analysis: AnalysisRepository,
}

impl OnboardingService {
    pub fn new(
        validator: EarlyFailValidator,
        planner: TaskPlanner,
        pool: Arc<WorkerPool>,
        ledger: LedgerRepository,
        analysis: AnalysisRepository,
    ) -> Self {
        Self {
            validator,
            planner,
            pool,
            ledger,
            analysis,
        }
    }

    /// Validates and plans. On acceptance the returned tasks are already
    /// observable as `pending`; the caller decides whether to await
    /// `run_to_completion` or detach it.
    pub async fn submit(&self, request: &OnboardingRequest) -> Result<SubmitOutcome> {
        let symbol = Symbol::parse(&request.symbol)?;
        let execution_id = new_execution_id(Utc::now());
        let filter_params = request.filter_params.clone().unwrap_or_default();

        info!("Onboarding request for {} ({})", symbol, execution_id);
        let verdict = self.validator.validate(&symbol).await?;

        let mut execution = Execution {
            execution_id: execution_id.clone(),
            symbol,
            mode: request.mode,
            selected_strategy_ids: request.selected_strategy_ids.clone(),
            status: ExecutionStatus::Pending,
            progress_percent: 0.0,
            current_operation: "validating".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            filter_params: serde_json::to_value(&filter_params)
                .context("Failed to serialize filter params")?,
            errors: Vec::new(),
        };

        if let Verdict::Fail(failure) = verdict {
            // The rejection is still recorded: audit trail.
            execution.status = ExecutionStatus::Failed;
            execution.completed_at = Some(Utc::now());
            execution.current_operation = format!("validation failed: {}", failure.step);
            execution.errors.push(ExecutionErrorRecord::from_validation(&failure));
            self.ledger.create_execution(&execution).await?;
            self.ledger
                .record_step(&execution_id, &failure.step, "failed", Some(&failure.suggestion))
                .await?;
            return Ok(SubmitOutcome::Rejected {
                execution_id,
                failure,
            });
        }

        self.ledger.create_execution(&execution).await?;
        self.ledger
            .record_step(&execution_id, "early_fail_validation", "passed", None)
            .await?;
        self.ledger
            .update_status(
                &execution_id,
                ExecutionStatus::Running,
                Some(0.0),
                Some("planning tasks"),
            )
            .await?;
        execution.status = ExecutionStatus::Running;

        let tasks = match self
            .planner
            .plan(&execution, &request.custom_strategies)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Planning failed for {}: {:#}", execution_id, e);
                self.ledger
                    .append_error(
                        &execution_id,
                        &ExecutionErrorRecord::new("planning_error", format!("{:#}", e)),
                    )
                    .await?;
                self.ledger
                    .update_status(
                        &execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some("planning failed"),
                    )
                    .await?;
                return Err(e);
            }
        };
        self.ledger
            .record_step(
                &execution_id,
                "task_planning",
                "passed",
                Some(&format!("{} tasks", tasks.len())),
            )
            .await?;

        Ok(SubmitOutcome::Accepted { execution, tasks })
    }

    /// Runs the planned tasks to their terminal states and finalizes the
    /// execution. Blocking variant used by the CLI; the API spawns it.
    pub async fn run_to_completion(
        &self,
        execution: &Execution,
        tasks: Vec<AnalysisTask>,
    ) -> Result<ExecutionStatus> {
        self.pool.run_execution(execution, tasks).await
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let accepted = self.ledger.request_cancel(execution_id).await?;
        if accepted {
            // Pending tasks never start once the flag is set; flip them now
            // so progress polls see the terminal state early.
            self.analysis
                .skip_pending_tasks(execution_id, "cancelled")
                .await?;
        }
        Ok(accepted)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Execution>> {
        self.ledger.list_recent(limit).await
    }

    pub async fn execution_report(&self, execution_id: &str) -> Result<Option<ExecutionReport>> {
        let Some(execution) = self.ledger.get(execution_id).await? else {
            return Ok(None);
        };
        let tasks = self.analysis.tasks_for_execution(execution_id).await?;
        Ok(Some(ExecutionReport::new(execution, tasks)))
    }
}

/// Progress-poll payload combining the authoritative ledger row with the
/// per-task states.
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub symbol: String,
    pub status: ExecutionStatus,
    pub progress_percent: f64,
    pub current_operation: String,
    pub errors: Vec<ExecutionErrorRecord>,
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub strategy_id: i64,
    pub timeframe: String,
    pub status: String,
    pub error_message: Option<String>,
}

impl ExecutionReport {
    fn new(execution: Execution, tasks: Vec<AnalysisTask>) -> Self {
        Self {
            execution_id: execution.execution_id,
            symbol: execution.symbol.to_string(),
            status: execution.status,
            progress_percent: execution.progress_percent,
            current_operation: execution.current_operation,
            errors: execution.errors,
            tasks: tasks
                .into_iter()
                .map(|t| TaskReport {
                    strategy_id: t.key.strategy_id,
                    timeframe: t.key.timeframe.label().to_string(),
                    status: t.status.to_string(),
                    error_message: t.error_message,
                })
                .collect(),
        }
    }
}
