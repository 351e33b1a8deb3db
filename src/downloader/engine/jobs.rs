//! Job endings: hand-off to post-processing, failure and deletion

use super::Engine;
use crate::error::Result;
use crate::model::Job;
use crate::postproc::{FinishedFile, FinishedJob};
use crate::types::{ArticleId, EngineState, Event, HistoryEntry, JobId, JobStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A post-processing hand-off returned
pub(in crate::downloader) struct PostProcDone {
    job: JobId,
    result: Result<()>,
}

fn history_entry(job: &Job, status: JobStatus, fail_message: Option<String>) -> HistoryEntry {
    HistoryEntry {
        id: job.id.clone(),
        name: job.name.clone(),
        category: job.category.clone(),
        status,
        fail_message,
        downloaded_bytes: job.downloaded_bytes(),
        bad_articles: job.bad_articles,
        workdir: job.workdir.clone(),
        completed_at: Utc::now(),
    }
}

impl Engine {
    /// No server is left to try for an article
    pub(super) async fn on_exhausted(&mut self, id: ArticleId) {
        debug!(article = %id, "no server left for article");
        self.dirty.insert(id.job.clone());
        let fraction = self.config.download.hopeless_fraction;
        let Some(job) = self.queue.get_mut(&id.job) else {
            return;
        };
        if job.precheck {
            self.check_precheck_done(&id.job).await;
            return;
        }
        if self.config.download.fail_hopeless_jobs && job.is_hopeless(fraction) {
            let reason = format!(
                "hopeless: {} of {} bytes unavailable",
                job.missing_bytes, job.size_bytes
            );
            self.fail_job(&id.job, reason).await;
            return;
        }

        let Some(file) = job.files.get_mut(id.file) else {
            return;
        };
        let lowest = file
            .articles
            .get(id.article)
            .is_some_and(|a| a.lowest_partnum);
        if lowest && !file.filename_checked {
            // the declared name stands
            file.filename_checked = true;
            self.sync_file(&id.job, id.file, None);
        } else {
            self.sync_file(&id.job, id.file, Some(id.article));
        }
    }

    /// End the availability pass once every article is checked or given up on
    pub(super) async fn check_precheck_done(&mut self, job_id: &JobId) {
        let fraction = self.config.download.hopeless_fraction;
        let Some(job) = self.queue.get_mut(job_id) else {
            return;
        };
        if !job.precheck || !job.is_check_done() {
            return;
        }
        if job.is_hopeless(fraction) {
            let reason = format!(
                "pre-check: {} of {} bytes unavailable",
                job.missing_bytes, job.size_bytes
            );
            self.fail_job(job_id, reason).await;
            return;
        }
        info!(job_id = %job_id, bad_articles = job.bad_articles, "pre-check passed, downloading");
        job.finish_precheck();
        self.dirty.insert(job_id.clone());
    }

    /// Hand the job to post-processing when nothing holds it back
    pub(super) async fn try_finish(&mut self, job_id: &JobId) {
        if !self.assembled.contains(job_id) || self.reinspecting.contains_key(job_id) {
            return;
        }
        let ready = self.is_live(job_id)
            && self
                .queue
                .get(job_id)
                .is_some_and(|j| !j.paused && j.status != JobStatus::Failed);
        if ready {
            self.hand_off(job_id).await;
        }
    }

    async fn hand_off(&mut self, job_id: &JobId) {
        let Some(mut job) = self.queue.remove(job_id) else {
            return;
        };
        self.assembled.remove(job_id);
        self.ended.remove(job_id);
        self.dirty.remove(job_id);
        self.queue_dirty = true;

        job.status = JobStatus::Finished;
        if let Err(e) = self.store.save_job(&job).await {
            warn!(job_id = %job_id, error = %e, "failed to save final job snapshot");
        }
        let entry = history_entry(&job, JobStatus::Finished, None);
        if let Err(e) = self.store.insert_history(&entry).await {
            error!(job_id = %job_id, error = %e, "failed to write history");
        }

        let finished = FinishedJob {
            id: job.id.clone(),
            name: job.name.clone(),
            category: job.category.clone(),
            workdir: job.workdir.clone(),
            files: job
                .files
                .iter()
                .map(|f| FinishedFile {
                    filename: f.filename.clone(),
                    declared_name: f.declared_name.clone(),
                    signature: f.signature,
                    crc: f.crc,
                    bad_articles: f.bad_articles(),
                })
                .collect(),
            bad_articles: job.bad_articles,
            password: job.correct_password.clone().or_else(|| job.password.clone()),
            downloaded_bytes: entry.downloaded_bytes,
        };
        info!(job_id = %job_id, name = %job.name, bad_articles = job.bad_articles, "job finished, handing to post-processing");
        self.emit(Event::JobFinished {
            id: job.id.clone(),
            name: job.name.clone(),
            workdir: job.workdir.clone(),
            bad_articles: job.bad_articles,
        });

        self.postproc.insert(job_id.clone(), entry);
        if self.config.download.pause_on_post_processing && self.state == EngineState::Running {
            self.state = EngineState::PostprocPaused;
            self.emit(Event::StateChanged {
                state: self.state,
            });
        }

        let handoff = Arc::clone(&self.handoff);
        let done = self.postproc_tx.clone();
        tokio::spawn(async move {
            let job = finished.id.clone();
            let result = handoff.process(finished).await;
            done.send(PostProcDone { job, result }).ok();
        });
    }

    pub(super) async fn on_postproc(&mut self, done: PostProcDone) {
        let PostProcDone { job, result } = done;
        let entry = self.postproc.remove(&job);
        match result {
            Ok(()) => debug!(job_id = %job, "post-processing done"),
            Err(e) => {
                warn!(job_id = %job, error = %e, "post-processing failed");
                self.warnings
                    .warn(format!("Post-processing of {job} failed: {e}"));
                if let Some(mut entry) = entry {
                    entry.status = JobStatus::Failed;
                    entry.fail_message = Some(e.to_string());
                    if let Err(e) = self.store.insert_history(&entry).await {
                        error!(job_id = %job, error = %e, "failed to update history");
                    }
                }
            }
        }
        if let Err(e) = self.store.remove_job_dir(&job).await {
            warn!(job_id = %job, error = %e, "failed to remove admin directory");
        }
        if self.postproc.is_empty() && self.state == EngineState::PostprocPaused {
            self.state = EngineState::Running;
            info!("post-processing idle, downloading again");
            self.emit(Event::StateChanged {
                state: self.state,
            });
        }
    }

    /// Fail a job to history; its working directory stays for inspection
    pub(super) async fn fail_job(&mut self, job_id: &JobId, reason: String) {
        let Some(job) = self.queue.get_mut(job_id) else {
            return;
        };
        if job.is_deleted() || job.status == JobStatus::Failed {
            return;
        }
        job.status = JobStatus::Failed;
        job.fail_message = Some(reason.clone());
        let entry = history_entry(job, JobStatus::Failed, Some(reason.clone()));
        warn!(job_id = %job_id, reason = %reason, "job failed");
        self.warnings.warn(format!("{} failed: {reason}", entry.name));
        if let Err(e) = self.store.insert_history(&entry).await {
            error!(job_id = %job_id, error = %e, "failed to write history");
        }
        self.emit(Event::JobFailed {
            id: job_id.clone(),
            reason,
        });
        self.retire(job_id, false).await;
    }

    /// Operator delete: the job leaves the queue once its in-flight articles return
    pub(super) async fn delete_job(&mut self, job_id: &JobId, del_files: bool) -> Result<()> {
        let job = self
            .queue
            .get_mut(job_id)
            .filter(|j| !j.is_deleted() && j.status != JobStatus::Failed)
            .ok_or_else(|| crate::error::Error::job_not_found(job_id))?;
        job.status = JobStatus::Deleted;
        info!(job_id = %job_id, del_files, in_flight = job.in_flight(), "deleting job");
        self.emit(Event::JobDeleted { id: job_id.clone() });
        self.retire(job_id, del_files).await;
        Ok(())
    }

    /// Stop all work for the job and drop it once nothing is in flight
    async fn retire(&mut self, job_id: &JobId, del_files: bool) {
        self.retiring.insert(job_id.clone(), del_files);
        self.cache.mark_deleted(job_id);
        self.assembler.submit(crate::assembler::AssembleMsg::Forget {
            job: job_id.clone(),
        });
        self.assembled.remove(job_id);
        self.ended.remove(job_id);
        self.reinspecting.remove(job_id);
        self.queue_dirty = true;
        self.drain(job_id).await;
    }

    /// Drop a retiring job once its last in-flight article came back
    pub(super) async fn drain(&mut self, job_id: &JobId) {
        let Some(&del_files) = self.retiring.get(job_id) else {
            return;
        };
        if self.queue.get(job_id).is_some_and(|j| j.in_flight() > 0) {
            return;
        }
        self.retiring.remove(job_id);
        self.dirty.remove(job_id);
        self.queue_dirty = true;
        let Some(job) = self.queue.remove(job_id) else {
            return;
        };

        self.cache.purge_job(job_id).await;
        if let Err(e) = self.store.remove_job_dir(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to remove admin directory");
        }
        if del_files {
            match tokio::fs::remove_dir_all(&job.workdir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(job_id = %job_id, path = %job.workdir.display(), error = %e, "failed to remove working directory")
                }
            }
        }
        debug!(job_id = %job_id, "job removed from the queue");
    }
}
