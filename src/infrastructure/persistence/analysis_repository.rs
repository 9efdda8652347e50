use crate::domain::outcome::{AnalysisAggregates, TaskStats};
use crate::domain::strategy::{BaseKind, StrategyConfig, StrategyParams};
use crate::domain::task::{AnalysisTask, TaskKey, TaskStatus};
use crate::domain::timeframe::Timeframe;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{info, warn};

/// Tables the early-fail validator requires in the analysis database.
pub const REQUIRED_TABLES: [&str; 3] =
    ["strategy_configurations", "analyses", "analysis_trades_summary"];

/// Store of the strategy catalog and per-task analysis outcomes. Each task
/// row is written only by its owning worker; the cancellation path may flip
/// pending rows to skipped.
#[derive(Clone)]
pub struct AnalysisRepository {
    pool: SqlitePool,
}

impl AnalysisRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_configurations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                base_kind TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                parameters_json TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (name, base_kind, timeframe)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create strategy_configurations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analyses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                strategy_id INTEGER NOT NULL,
                timeframe TEXT NOT NULL,
                task_status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                total_trades INTEGER NOT NULL DEFAULT 0,
                win_rate REAL,
                sharpe_ratio REAL,
                max_drawdown REAL,
                avg_leverage REAL,
                no_signal_count INTEGER NOT NULL DEFAULT 0,
                filter_histogram TEXT NOT NULL DEFAULT '{}',
                early_exit_histogram TEXT NOT NULL DEFAULT '{}',
                compressed_path TEXT,
                chart_path TEXT,
                UNIQUE (execution_id, strategy_id, timeframe)
            );
            CREATE INDEX IF NOT EXISTS idx_analyses_execution
            ON analyses (execution_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create analyses table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_trades_summary (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                analysis_id INTEGER NOT NULL,
                execution_id TEXT NOT NULL,
                total_trades INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                avg_leveraged_return_pct REAL,
                best_trade_pct REAL,
                worst_trade_pct REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_summary_analysis
            ON analysis_trades_summary (analysis_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create analysis_trades_summary table")?;

        info!("Analysis store schema initialized.");
        Ok(())
    }

    // --- Strategy catalog -------------------------------------------------

    /// Seeds the default catalog on first startup: one strategy per base
    /// kind per default timeframe, all thresholds deferred to the central
    /// defaults. Idempotent.
    pub async fn seed_default_catalog(&self) -> Result<usize> {
        let mut inserted = 0usize;
        for kind in BaseKind::all() {
            for timeframe in Timeframe::defaults() {
                let result = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO strategy_configurations
                        (name, base_kind, timeframe, parameters_json, is_active, is_default, created_at)
                    VALUES (?, ?, ?, ?, 1, 1, ?)
                    "#,
                )
                .bind(kind.display_name())
                .bind(kind.label())
                .bind(timeframe.label())
                .bind(serde_json::to_string(&StrategyParams::default())?)
                .bind(Utc::now())
                .execute(&self.pool)
                .await
                .context("Failed to seed strategy catalog")?;
                inserted += result.rows_affected() as usize;
            }
        }
        if inserted > 0 {
            info!("Seeded {} default strategy configurations", inserted);
        }
        Ok(inserted)
    }

    pub async fn insert_strategy(
        &self,
        name: &str,
        base_kind: BaseKind,
        timeframe: Timeframe,
        params: &StrategyParams,
        is_default: bool,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO strategy_configurations
                (name, base_kind, timeframe, parameters_json, is_active, is_default, created_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (name, base_kind, timeframe) DO UPDATE SET
                parameters_json = excluded.parameters_json,
                is_active = 1
            "#,
        )
        .bind(name)
        .bind(base_kind.label())
        .bind(timeframe.label())
        .bind(serde_json::to_string(params)?)
        .bind(is_default)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert strategy configuration")?;

        if result.last_insert_rowid() > 0 {
            return Ok(result.last_insert_rowid());
        }
        // Upsert hit the conflict arm; fetch the existing id.
        let row = sqlx::query(
            "SELECT id FROM strategy_configurations WHERE name = ? AND base_kind = ? AND timeframe = ?",
        )
        .bind(name)
        .bind(base_kind.label())
        .bind(timeframe.label())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_strategy(&self, id: i64) -> Result<Option<StrategyConfig>> {
        let row = sqlx::query("SELECT * FROM strategy_configurations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_strategy).transpose()
    }

    pub async fn get_strategies_by_ids(&self, ids: &[i64]) -> Result<Vec<StrategyConfig>> {
        let mut strategies = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(strategy) = self.get_strategy(*id).await? {
                strategies.push(strategy);
            }
        }
        Ok(strategies)
    }

    pub async fn list_active_defaults(&self) -> Result<Vec<StrategyConfig>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_configurations WHERE is_active = 1 AND is_default = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_strategy).collect()
    }

    // --- Task lifecycle ---------------------------------------------------

    /// Inserts one pending task row. The row must be observable before any
    /// worker starts on it.
    pub async fn create_pending_task(&self, task: &AnalysisTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analyses
                (execution_id, strategy_id, timeframe, task_status, created_at, retry_count)
            VALUES (?, ?, ?, 'pending', ?, 0)
            "#,
        )
        .bind(&task.key.execution_id)
        .bind(task.key.strategy_id)
        .bind(task.key.timeframe.label())
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to create pending task row")?;
        Ok(())
    }

    pub async fn mark_task_running(&self, key: &TaskKey) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analyses SET task_status = 'running', started_at = ?
            WHERE execution_id = ? AND strategy_id = ? AND timeframe = ? AND task_status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(&key.execution_id)
        .bind(key.strategy_id)
        .bind(key.timeframe.label())
        .execute(&self.pool)
        .await
        .context("Failed to mark task running")?;
        Ok(())
    }

    /// Finalizes a task in one statement: terminal status, aggregates,
    /// histograms, and blob path together.
    pub async fn finalize_task(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        aggregates: &AnalysisAggregates,
        stats: &TaskStats,
        compressed_path: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analyses SET
                task_status = ?,
                completed_at = ?,
                error_message = ?,
                total_trades = ?,
                win_rate = ?,
                sharpe_ratio = ?,
                max_drawdown = ?,
                avg_leverage = ?,
                no_signal_count = ?,
                filter_histogram = ?,
                early_exit_histogram = ?,
                compressed_path = ?
            WHERE execution_id = ? AND strategy_id = ? AND timeframe = ?
            "#,
        )
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(error_message)
        .bind(aggregates.total_trades as i64)
        .bind(aggregates.win_rate)
        .bind(aggregates.sharpe_ratio)
        .bind(aggregates.max_drawdown)
        .bind(aggregates.avg_leverage)
        .bind(stats.no_signals as i64)
        .bind(serde_json::to_string(&stats.gate_rejections)?)
        .bind(serde_json::to_string(&stats.early_exits)?)
        .bind(compressed_path)
        .bind(&key.execution_id)
        .bind(key.strategy_id)
        .bind(key.timeframe.label())
        .execute(&self.pool)
        .await
        .context("Failed to finalize task")?;
        Ok(())
    }

    pub async fn mark_task_failed(&self, key: &TaskKey, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analyses SET task_status = 'failed', completed_at = ?, error_message = ?
            WHERE execution_id = ? AND strategy_id = ? AND timeframe = ?
            "#,
        )
        .bind(Utc::now())
        .bind(error_message)
        .bind(&key.execution_id)
        .bind(key.strategy_id)
        .bind(key.timeframe.label())
        .execute(&self.pool)
        .await
        .context("Failed to mark task failed")?;
        Ok(())
    }

    pub async fn mark_task_skipped(&self, key: &TaskKey, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analyses SET task_status = 'skipped', completed_at = ?, error_message = ?
            WHERE execution_id = ? AND strategy_id = ? AND timeframe = ?
              AND task_status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(&key.execution_id)
        .bind(key.strategy_id)
        .bind(key.timeframe.label())
        .execute(&self.pool)
        .await
        .context("Failed to mark task skipped")?;
        Ok(())
    }

    /// Cancellation path: flips every still-pending task of an execution to
    /// skipped so it never starts.
    pub async fn skip_pending_tasks(&self, execution_id: &str, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE analyses SET task_status = 'skipped', completed_at = ?, error_message = ?
            WHERE execution_id = ? AND task_status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .context("Failed to skip pending tasks")?;
        Ok(result.rows_affected())
    }

    /// Ledger finalizer: any task still `running` after the cancellation
    /// grace window was hard-killed and is forced to failed.
    pub async fn force_fail_running_tasks(
        &self,
        execution_id: &str,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE analyses SET task_status = 'failed', completed_at = ?, error_message = ?
            WHERE execution_id = ? AND task_status = 'running'
            "#,
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .context("Failed to force-fail running tasks")?;
        if result.rows_affected() > 0 {
            warn!(
                "Forced {} running tasks of {} to failed ({})",
                result.rows_affected(),
                execution_id,
                reason
            );
        }
        Ok(result.rows_affected())
    }

    pub async fn tasks_for_execution(&self, execution_id: &str) -> Result<Vec<AnalysisTask>> {
        let rows = sqlx::query(
            "SELECT * FROM analyses WHERE execution_id = ? ORDER BY strategy_id, timeframe",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    pub async fn analysis_id(&self, key: &TaskKey) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT id FROM analyses WHERE execution_id = ? AND strategy_id = ? AND timeframe = ?",
        )
        .bind(&key.execution_id)
        .bind(key.strategy_id)
        .bind(key.timeframe.label())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("id").map_err(Into::into)).transpose()
    }

    pub async fn insert_trade_summary(
        &self,
        analysis_id: i64,
        execution_id: &str,
        total_trades: u64,
        wins: u64,
        losses: u64,
        avg_leveraged_return_pct: Option<f64>,
        best_trade_pct: Option<f64>,
        worst_trade_pct: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_trades_summary
                (analysis_id, execution_id, total_trades, wins, losses,
                 avg_leveraged_return_pct, best_trade_pct, worst_trade_pct, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(analysis_id)
        .bind(execution_id)
        .bind(total_trades as i64)
        .bind(wins as i64)
        .bind(losses as i64)
        .bind(avg_leveraged_return_pct)
        .bind(best_trade_pct)
        .bind(worst_trade_pct)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert trade summary")?;
        Ok(())
    }
}

fn row_to_strategy(row: sqlx::sqlite::SqliteRow) -> Result<StrategyConfig> {
    let base_kind: String = row.try_get("base_kind")?;
    let timeframe: String = row.try_get("timeframe")?;
    let params_raw: String = row.try_get("parameters_json")?;

    Ok(StrategyConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        base_kind: BaseKind::from_str(&base_kind)?,
        timeframe: Timeframe::from_str(&timeframe)?,
        params: serde_json::from_str(&params_raw)
            .context("Invalid parameters_json in strategy_configurations")?,
        is_active: row.try_get("is_active")?,
        is_default: row.try_get("is_default")?,
    })
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Result<AnalysisTask> {
    let timeframe: String = row.try_get("timeframe")?;
    let status: String = row.try_get("task_status")?;

    Ok(AnalysisTask {
        key: TaskKey {
            execution_id: row.try_get("execution_id")?,
            strategy_id: row.try_get("strategy_id")?,
            timeframe: Timeframe::from_str(&timeframe)?,
        },
        status: TaskStatus::from_str(&status)?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::open_pool;

    async fn repo() -> (tempfile::TempDir, AnalysisRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/analysis.db", dir.path().display());
        let repo = AnalysisRepository::new(open_pool(&url).await.unwrap());
        repo.init().await.unwrap();
        (dir, repo)
    }

    fn task_key(execution_id: &str, strategy_id: i64) -> TaskKey {
        TaskKey {
            execution_id: execution_id.to_string(),
            strategy_id,
            timeframe: Timeframe::OneHour,
        }
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let (_dir, repo) = repo().await;
        let first = repo.seed_default_catalog().await.unwrap();
        assert_eq!(first, BaseKind::all().len() * Timeframe::defaults().len());
        let second = repo.seed_default_catalog().await.unwrap();
        assert_eq!(second, 0);

        let defaults = repo.list_active_defaults().await.unwrap();
        assert_eq!(defaults.len(), first);
    }

    #[tokio::test]
    async fn test_task_key_unique_per_execution() {
        let (_dir, repo) = repo().await;
        let key = task_key("exec_a", 1);
        let task = AnalysisTask::pending(key.clone(), Utc::now());
        repo.create_pending_task(&task).await.unwrap();
        // Same key again violates uniqueness.
        assert!(repo.create_pending_task(&task).await.is_err());
        // Same (strategy, timeframe) under a new execution is fine.
        let other = AnalysisTask::pending(task_key("exec_b", 1), Utc::now());
        repo.create_pending_task(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_pending_running_completed() {
        let (_dir, repo) = repo().await;
        let key = task_key("exec_a", 1);
        repo.create_pending_task(&AnalysisTask::pending(key.clone(), Utc::now()))
            .await
            .unwrap();

        let tasks = repo.tasks_for_execution("exec_a").await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Pending);

        repo.mark_task_running(&key).await.unwrap();
        let aggregates = AnalysisAggregates {
            total_trades: 0,
            ..AnalysisAggregates::default()
        };
        repo.finalize_task(&key, TaskStatus::Completed, &aggregates, &TaskStats::default(), None, None)
            .await
            .unwrap();

        let tasks = repo.tasks_for_execution("exec_a").await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert!(tasks[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_skip_pending_leaves_running_untouched() {
        let (_dir, repo) = repo().await;
        let running = task_key("exec_a", 1);
        let pending = task_key("exec_a", 2);
        repo.create_pending_task(&AnalysisTask::pending(running.clone(), Utc::now()))
            .await
            .unwrap();
        repo.create_pending_task(&AnalysisTask::pending(pending.clone(), Utc::now()))
            .await
            .unwrap();
        repo.mark_task_running(&running).await.unwrap();

        let skipped = repo.skip_pending_tasks("exec_a", "cancelled").await.unwrap();
        assert_eq!(skipped, 1);

        let tasks = repo.tasks_for_execution("exec_a").await.unwrap();
        let by_id: std::collections::HashMap<i64, TaskStatus> = tasks
            .iter()
            .map(|t| (t.key.strategy_id, t.status))
            .collect();
        assert_eq!(by_id[&1], TaskStatus::Running);
        assert_eq!(by_id[&2], TaskStatus::Skipped);

        let failed = repo
            .force_fail_running_tasks("exec_a", "cancelled_hard")
            .await
            .unwrap();
        assert_eq!(failed, 1);
    }
}
