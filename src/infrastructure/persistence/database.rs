use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Opens a SQLite pool with WAL journaling, creating the file and its parent
/// directory when missing. Both the ledger DB and the analysis DB go through
/// here so the journal mode stays consistent.
pub async fn open_pool(db_url: &str) -> Result<SqlitePool> {
    if let Some(path_part) = db_url.strip_prefix("sqlite://") {
        let path = Path::new(path_part);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to SQLite database {}", db_url))?;

    info!("Connected to database: {}", db_url);
    Ok(pool)
}

/// Checks that every named table exists. Used by the early-fail validator's
/// database check.
pub async fn has_tables(pool: &SqlitePool, tables: &[&str]) -> Result<bool> {
    for table in tables {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(pool)
        .await
        .with_context(|| format!("Failed to probe for table {}", table))?;
        let n: i64 = row.try_get("n")?;
        if n == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_pool_creates_file_and_wal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/test.db", dir.path().display());
        let pool = open_pool(&url).await.unwrap();

        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        assert!(has_tables(&pool, &["t"]).await.unwrap());
        assert!(!has_tables(&pool, &["missing"]).await.unwrap());
    }
}
