use crate::domain::candle::Symbol;
use crate::domain::execution::{
    Execution, ExecutionErrorRecord, ExecutionStatus, OnboardingMode,
};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{info, warn};

/// Tables the early-fail validator requires in the ledger database.
pub const REQUIRED_TABLES: [&str; 2] = ["executions", "execution_steps"];

/// Durable store of onboarding executions. Rows are never deleted; the table
/// is the audit trail. Writers: the request handler (create), workers
/// (status/progress), and the cancellation path (status flip).
#[derive(Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                selected_strategy_ids TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                progress_percent REAL NOT NULL DEFAULT 0,
                current_operation TEXT NOT NULL DEFAULT '',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                filter_params TEXT NOT NULL DEFAULT '{}',
                errors TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create executions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_execution_steps_execution
            ON execution_steps (execution_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create execution_steps table")?;

        info!("Ledger schema initialized.");
        Ok(())
    }

    pub async fn create_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (execution_id, symbol, mode, selected_strategy_ids, status,
                 progress_percent, current_operation, started_at, completed_at,
                 filter_params, errors)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.execution_id)
        .bind(execution.symbol.as_str())
        .bind(execution.mode.to_string())
        .bind(serde_json::to_string(&execution.selected_strategy_ids)?)
        .bind(execution.status.to_string())
        .bind(execution.progress_percent)
        .bind(&execution.current_operation)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.filter_params.to_string())
        .bind(serde_json::to_string(&execution.errors)?)
        .execute(&self.pool)
        .await
        .context("Failed to insert execution")?;

        info!("Ledger row created for {}", execution.execution_id);
        Ok(())
    }

    /// Updates status and optionally progress/current_operation. Progress is
    /// clamped monotonically non-decreasing; a stale writer can never move it
    /// backwards. Terminal statuses stamp `completed_at`.
    pub async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        progress: Option<f64>,
        current_operation: Option<&str>,
    ) -> Result<()> {
        let completed_at: Option<DateTime<Utc>> =
            status.is_terminal().then(Utc::now);

        sqlx::query(
            r#"
            UPDATE executions SET
                status = ?,
                progress_percent = MAX(progress_percent, COALESCE(?, progress_percent)),
                current_operation = COALESCE(?, current_operation),
                completed_at = COALESCE(?, completed_at)
            WHERE execution_id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(progress)
        .bind(current_operation)
        .bind(completed_at)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .context("Failed to update execution status")?;

        Ok(())
    }

    /// Bumps progress without touching the status.
    pub async fn update_progress(
        &self,
        execution_id: &str,
        progress: f64,
        current_operation: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions SET
                progress_percent = MAX(progress_percent, ?),
                current_operation = ?
            WHERE execution_id = ?
            "#,
        )
        .bind(progress)
        .bind(current_operation)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .context("Failed to update execution progress")?;
        Ok(())
    }

    /// Appends one structured error to the execution's ordered error list.
    pub async fn append_error(
        &self,
        execution_id: &str,
        error: &ExecutionErrorRecord,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT errors FROM executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("Unknown execution: {}", execution_id))?;

        let raw: String = row.try_get("errors")?;
        let mut errors: Vec<ExecutionErrorRecord> =
            serde_json::from_str(&raw).unwrap_or_default();
        errors.push(error.clone());

        sqlx::query("UPDATE executions SET errors = ? WHERE execution_id = ?")
            .bind(serde_json::to_string(&errors)?)
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("Failed to append execution error")?;
        Ok(())
    }

    pub async fn record_step(
        &self,
        execution_id: &str,
        step_name: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_steps (execution_id, step_name, status, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution_id)
        .bind(step_name)
        .bind(status)
        .bind(detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to record execution step")?;
        Ok(())
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_execution).transpose()
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Execution>> {
        let rows = sqlx::query("SELECT * FROM executions ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_execution).collect()
    }

    /// Flips the execution to `cancelled`. Returns false when the execution
    /// was already terminal (the cancellation is then not honored).
    pub async fn request_cancel(&self, execution_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE executions SET status = 'cancelled', completed_at = ?
            WHERE execution_id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .context("Failed to request cancellation")?;

        let accepted = result.rows_affected() > 0;
        if accepted {
            warn!("Cancellation accepted for {}", execution_id);
        }
        Ok(accepted)
    }

    /// Single-read cancellation probe used at worker checkpoints.
    pub async fn is_cancelled(&self, execution_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT status FROM executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(status == "cancelled")
            }
            None => Ok(false),
        }
    }
}

fn row_to_execution(row: sqlx::sqlite::SqliteRow) -> Result<Execution> {
    let symbol: String = row.try_get("symbol")?;
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let ids_raw: String = row.try_get("selected_strategy_ids")?;
    let filter_raw: String = row.try_get("filter_params")?;
    let errors_raw: String = row.try_get("errors")?;

    Ok(Execution {
        execution_id: row.try_get("execution_id")?,
        symbol: Symbol::parse(&symbol)?,
        mode: OnboardingMode::from_str(&mode)?,
        selected_strategy_ids: serde_json::from_str(&ids_raw).unwrap_or_default(),
        status: ExecutionStatus::from_str(&status)?,
        progress_percent: row.try_get("progress_percent")?,
        current_operation: row.try_get("current_operation")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        filter_params: serde_json::from_str(&filter_raw)
            .unwrap_or(serde_json::Value::Null),
        errors: serde_json::from_str(&errors_raw).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::new_execution_id;
    use crate::infrastructure::persistence::database::open_pool;

    async fn repo() -> (tempfile::TempDir, LedgerRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/ledger.db", dir.path().display());
        let repo = LedgerRepository::new(open_pool(&url).await.unwrap());
        repo.init().await.unwrap();
        (dir, repo)
    }

    fn sample_execution() -> Execution {
        Execution {
            execution_id: new_execution_id(Utc::now()),
            symbol: Symbol::parse("BTC").unwrap(),
            mode: OnboardingMode::Default,
            selected_strategy_ids: vec![],
            status: ExecutionStatus::Pending,
            progress_percent: 0.0,
            current_operation: "validating".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            filter_params: serde_json::json!({}),
            errors: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_dir, repo) = repo().await;
        let execution = sample_execution();
        repo.create_execution(&execution).await.unwrap();

        let loaded = repo.get(&execution.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.symbol.as_str(), "BTC");
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert_eq!(loaded.mode, OnboardingMode::Default);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (_dir, repo) = repo().await;
        let execution = sample_execution();
        repo.create_execution(&execution).await.unwrap();
        let id = &execution.execution_id;

        repo.update_progress(id, 40.0, "running").await.unwrap();
        repo.update_progress(id, 25.0, "running").await.unwrap();

        let loaded = repo.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.progress_percent, 40.0);
    }

    #[tokio::test]
    async fn test_cancel_only_non_terminal() {
        let (_dir, repo) = repo().await;
        let execution = sample_execution();
        repo.create_execution(&execution).await.unwrap();
        let id = &execution.execution_id;

        assert!(repo.request_cancel(id).await.unwrap());
        assert!(repo.is_cancelled(id).await.unwrap());
        // Second cancel is a no-op: already terminal.
        assert!(!repo.request_cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_error_preserves_order() {
        let (_dir, repo) = repo().await;
        let execution = sample_execution();
        repo.create_execution(&execution).await.unwrap();
        let id = &execution.execution_id;

        repo.append_error(id, &ExecutionErrorRecord::new("validation_error", "first"))
            .await
            .unwrap();
        repo.append_error(id, &ExecutionErrorRecord::new("task_error", "second"))
            .await
            .unwrap();

        let loaded = repo.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.errors.len(), 2);
        assert_eq!(loaded.errors[0].message, "first");
        assert_eq!(loaded.errors[1].message, "second");
    }
}
