//! Store lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::AdminStore;

impl AdminStore {
    /// Open (or create) the store at `db_path`, with per-job directories under `admin_dir`
    pub async fn open(db_path: &Path, admin_dir: &Path) -> Result<Self> {
        for dir in db_path.parent().into_iter().chain(std::iter::once(admin_dir)) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "failed to create {}: {e}",
                    dir.display()
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "failed to parse database path: {e}"
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "failed to connect to database: {e}"
            )))
        })?;

        let store = Self {
            pool,
            admin_dir: admin_dir.to_path_buf(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "failed to acquire connection: {e}"
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "failed to create schema_version table: {e}"
            )))
        })?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "failed to query schema version: {e}"
                )))
            })?;

        if current.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }
        Ok(())
    }

    /// v1: queue, history, kv
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("applying admin store migration v1");

        sqlx::query("BEGIN").execute(&mut *conn).await.map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "failed to begin transaction: {e}"
            )))
        })?;

        let result = async {
            for statement in [
                r#"
                CREATE TABLE queue (
                    job_id TEXT PRIMARY KEY,
                    position INTEGER NOT NULL,
                    priority INTEGER NOT NULL,
                    paused INTEGER NOT NULL DEFAULT 0
                )
                "#,
                r#"
                CREATE TABLE history (
                    job_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    category TEXT,
                    status TEXT NOT NULL,
                    fail_message TEXT,
                    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                    bad_articles INTEGER NOT NULL DEFAULT 0,
                    workdir TEXT NOT NULL,
                    completed_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX idx_history_completed_at ON history(completed_at)",
                r#"
                CREATE TABLE kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )
                "#,
            ] {
                sqlx::query(statement)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "migration v1 failed: {e}"
                        )))
                    })?;
            }
            Self::record_migration(conn, 1).await
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await.map_err(|e| {
                    Error::Database(DatabaseError::MigrationFailed(format!(
                        "failed to commit migration v1: {e}"
                    )))
                })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("admin store migration v1 complete");
        Ok(())
    }

    async fn record_migration(conn: &mut SqliteConnection, version: i64) -> Result<()> {
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "failed to record migration v{version}: {e}"
                )))
            })?;
        Ok(())
    }
}
