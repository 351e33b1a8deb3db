//! Startup restore and shutdown coordination.

use crate::bpsmeter::MeterState;
use crate::cache::ArticleCache;
use crate::db::AdminStore;
use crate::error::Result;
use crate::model::Job;
use crate::types::{JobStatus, Priority};
use crate::warnings::Warnings;
use std::sync::atomic::Ordering;

use super::UsenetDownloader;
use super::engine::METER_KEY;

/// Load the queue left by the previous run.
///
/// Jobs whose snapshot cannot be read are skipped with a warning. Articles the
/// last run had decoded but not written survive only if their spill file is
/// still on disk; the rest are fetched again.
pub(super) async fn restore_jobs(
    store: &AdminStore,
    cache: &ArticleCache,
    warnings: &Warnings,
) -> Result<Vec<Job>> {
    let rows = store.load_queue().await?;
    let mut jobs = Vec::with_capacity(rows.len());

    for row in rows {
        let mut job = match store.load_job(&row.job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %row.job_id, error = %e, "cannot restore job, skipping");
                warnings.warn(format!("Could not restore job {}: {e}", row.job_id));
                continue;
            }
        };
        if matches!(
            job.status,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Deleted
        ) {
            continue;
        }

        let priority = Priority::from_i32(row.priority);
        job.priority = if priority.is_regular() {
            priority
        } else {
            Priority::Normal
        };
        job.paused = row.paused;
        if matches!(job.status, JobStatus::Downloading | JobStatus::Checking) {
            job.status = JobStatus::Queued;
        }

        let mut refetch = 0usize;
        for id in job.article_ids() {
            let Some(article) = job.article_mut(&id) else {
                continue;
            };
            article.fetcher = None;
            if article.decoded && !article.on_disk && !cache.adopt_spilled(&id) {
                job.reset_article(&id);
                refetch += 1;
            }
        }
        if refetch > 0 {
            tracing::debug!(job_id = %job.id, refetch, "articles lost at halt will be fetched again");
        }
        jobs.push(job);
    }

    tracing::info!(jobs = jobs.len(), "queue restored");
    Ok(jobs)
}

/// Traffic counters of the previous run, if any were saved
pub(super) async fn restore_meter(store: &AdminStore) -> Option<MeterState> {
    match store.get_kv::<MeterState>(METER_KEY).await {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(error = %e, "traffic counters unreadable, starting fresh");
            None
        }
    }
}

impl UsenetDownloader {
    /// Gracefully shut down the downloader
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new jobs
    /// 2. Stops the scheduling task, which cancels fetches, stops the decoder
    ///    and assembler (each bounded by `shutdown_timeout`), flushes the
    ///    article cache and writes the queue and job snapshots
    /// 3. Closes the admin store
    ///
    /// Calling it a second time is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new jobs
        self.accepting.store(false, Ordering::SeqCst);

        // 2. Stop the engine and wait for its teardown
        self.cancel.cancel();
        let handle = match self.engine.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "engine task ended abnormally");
        }

        // 3. Close the admin store
        self.store.close().await;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
