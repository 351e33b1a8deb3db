//! Admin store for usenet-engine
//!
//! Queue order, history and small key/value state live in SQLite (`admin.db`).
//! Everything per job lives in `<admin_dir>/<job_id>/`: the `job.json`
//! snapshot, the gzipped manifest and the cache's spill files.
//!
//! ## Submodules
//!
//! Methods on [`AdminStore`] are organized by domain:
//! - [`migrations`] - store lifecycle, schema migrations
//! - [`queue`] - queue order and priorities
//! - [`history`] - finished, failed and deleted jobs
//! - [`kv`] - meter counters and other small state
//! - [`snapshot`] - per-job admin directory

use crate::types::JobId;
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;
use std::path::{Path, PathBuf};

mod history;
mod kv;
mod migrations;
mod queue;
mod snapshot;

/// Name of the job snapshot file
pub const JOB_FILE: &str = "job.json";

/// Name of the stored manifest copy
pub const MANIFEST_FILE: &str = "manifest.nzb.gz";

/// One queue position as stored
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct QueueRow {
    /// Job in this position
    pub job_id: JobId,
    /// 0 = head
    pub position: i64,
    /// [`Priority::to_i32`](crate::types::Priority::to_i32) encoding
    pub priority: i32,
    /// Paused flag at save time
    pub paused: bool,
}

/// History row as stored
#[derive(Debug, Clone, FromRow)]
struct HistoryRow {
    job_id: JobId,
    name: String,
    category: Option<String>,
    status: String,
    fail_message: Option<String>,
    downloaded_bytes: i64,
    bad_articles: i64,
    workdir: String,
    completed_at: i64,
}

/// Persistent admin state
#[derive(Debug, Clone)]
pub struct AdminStore {
    pool: SqlitePool,
    admin_dir: PathBuf,
}

impl AdminStore {
    /// Root of the per-job admin directories
    pub fn admin_dir(&self) -> &Path {
        &self.admin_dir
    }

    /// Admin directory of one job
    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.admin_dir.join(id.as_str())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
