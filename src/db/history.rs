//! History of jobs that left the queue.

use crate::types::{HistoryEntry, JobId, JobStatus};
use crate::{Error, Result};
use chrono::{TimeZone, Utc};
use std::path::PathBuf;

use super::{AdminStore, HistoryRow};

impl AdminStore {
    /// Record a job that finished, failed or was deleted. A second record for
    /// the same job replaces the first.
    pub async fn insert_history(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO history (
                job_id, name, category, status, fail_message,
                downloaded_bytes, bad_articles, workdir, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.name)
        .bind(&entry.category)
        .bind(entry.status.to_string())
        .bind(&entry.fail_message)
        .bind(entry.downloaded_bytes as i64)
        .bind(i64::from(entry.bad_articles))
        .bind(entry.workdir.to_string_lossy().into_owned())
        .bind(entry.completed_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(Error::Sqlx)?;
        Ok(())
    }

    /// History, most recent first
    pub async fn query_history(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT job_id, name, category, status, fail_message,
                   downloaded_bytes, bad_articles, workdir, completed_at
            FROM history
            ORDER BY completed_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(rows.into_iter().map(HistoryEntry::from).collect())
    }

    /// Drop one history record; false when there was none
    pub async fn delete_history(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM history WHERE job_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

impl From<HistoryRow> for HistoryEntry {
    fn from(row: HistoryRow) -> Self {
        HistoryEntry {
            id: row.job_id,
            name: row.name,
            category: row.category,
            status: row.status.parse().unwrap_or(JobStatus::Failed),
            fail_message: row.fail_message,
            downloaded_bytes: row.downloaded_bytes.max(0) as u64,
            bad_articles: row.bad_articles.max(0) as u32,
            workdir: PathBuf::from(row.workdir),
            completed_at: Utc
                .timestamp_opt(row.completed_at, 0)
                .single()
                .unwrap_or_default(),
        }
    }
}
