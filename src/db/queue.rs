//! Queue order and priorities.

use crate::{Error, Result};

use super::{AdminStore, QueueRow};

impl AdminStore {
    /// Replace the stored queue order
    pub async fn save_queue(&self, rows: &[QueueRow]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Sqlx)?;
        sqlx::query("DELETE FROM queue")
            .execute(&mut *tx)
            .await
            .map_err(Error::Sqlx)?;
        for row in rows {
            sqlx::query("INSERT INTO queue (job_id, position, priority, paused) VALUES (?, ?, ?, ?)")
                .bind(&row.job_id)
                .bind(row.position)
                .bind(row.priority)
                .bind(row.paused)
                .execute(&mut *tx)
                .await
                .map_err(Error::Sqlx)?;
        }
        tx.commit().await.map_err(Error::Sqlx)?;
        Ok(())
    }

    /// Stored queue, head first
    pub async fn load_queue(&self) -> Result<Vec<QueueRow>> {
        sqlx::query_as::<_, QueueRow>(
            "SELECT job_id, position, priority, paused FROM queue ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)
    }
}
