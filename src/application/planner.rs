//! Task planner.
//!
//! Expands an accepted onboarding request into concrete task rows, one per
//! (strategy, timeframe) pair, all inserted as `pending` before any worker
//! starts. Progress is therefore observable upfront.

use crate::domain::execution::{Execution, OnboardingMode};
use crate::domain::strategy::{BaseKind, StrategyConfig, StrategyParams};
use crate::domain::task::{AnalysisTask, TaskKey};
use crate::domain::timeframe::Timeframe;
use crate::infrastructure::persistence::AnalysisRepository;
use anyhow::{Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Inline strategy definition for custom-mode requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomStrategySpec {
    pub name: String,
    pub base_kind: BaseKind,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub params: StrategyParams,
}

pub struct TaskPlanner {
    analysis: AnalysisRepository,
}

impl TaskPlanner {
    pub fn new(analysis: AnalysisRepository) -> Self {
        Self { analysis }
    }

    /// Creates one pending task row per planned strategy. Returns the
    /// planned tasks in creation order.
    pub async fn plan(
        &self,
        execution: &Execution,
        custom_strategies: &[CustomStrategySpec],
    ) -> Result<Vec<AnalysisTask>> {
        let strategies = self.select_strategies(execution, custom_strategies).await?;
        if strategies.is_empty() {
            bail!(
                "No strategies selected for execution {} (mode {})",
                execution.execution_id,
                execution.mode
            );
        }

        let now = Utc::now();
        let mut tasks = Vec::with_capacity(strategies.len());
        for strategy in &strategies {
            let task = AnalysisTask::pending(
                TaskKey {
                    execution_id: execution.execution_id.clone(),
                    strategy_id: strategy.id,
                    timeframe: strategy.timeframe,
                },
                now,
            );
            self.analysis.create_pending_task(&task).await?;
            tasks.push(task);
        }

        info!(
            "Planned {} tasks for {} ({} mode)",
            tasks.len(),
            execution.execution_id,
            execution.mode
        );
        Ok(tasks)
    }

    async fn select_strategies(
        &self,
        execution: &Execution,
        custom_strategies: &[CustomStrategySpec],
    ) -> Result<Vec<StrategyConfig>> {
        match execution.mode {
            OnboardingMode::Default => self.analysis.list_active_defaults().await,
            OnboardingMode::Selective => {
                if execution.selected_strategy_ids.is_empty() {
                    bail!("Selective mode requires selected_strategy_ids");
                }
                let strategies = self
                    .analysis
                    .get_strategies_by_ids(&execution.selected_strategy_ids)
                    .await?;
                if strategies.len() != execution.selected_strategy_ids.len() {
                    bail!(
                        "Unknown strategy ids in selection: requested {:?}, found {}",
                        execution.selected_strategy_ids,
                        strategies.len()
                    );
                }
                Ok(strategies)
            }
            OnboardingMode::Custom => {
                if custom_strategies.is_empty() {
                    bail!("Custom mode requires at least one strategy definition");
                }
                let mut strategies = Vec::with_capacity(custom_strategies.len());
                for spec in custom_strategies {
                    let id = self
                        .analysis
                        .insert_strategy(
                            &spec.name,
                            spec.base_kind,
                            spec.timeframe,
                            &spec.params,
                            false,
                        )
                        .await?;
                    strategies.push(StrategyConfig {
                        id,
                        name: spec.name.clone(),
                        base_kind: spec.base_kind,
                        timeframe: spec.timeframe,
                        params: spec.params,
                        is_active: true,
                        is_default: false,
                    });
                }
                Ok(strategies)
            }
        }
    }
}
