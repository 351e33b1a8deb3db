//! Feeding the assembler and acting on its reports

use super::Engine;
use crate::archive::{ArchiveReport, inspectable_kind};
use crate::assembler::{
    ArchivePolicy, AssembleMsg, AssembleStep, AssemblyReport, FileCursor, Slot,
};
use crate::config::{ArchiveAction, ArchiveConfig};
use crate::model::Article;
use crate::types::{Event, JobId, PauseReason, StorageArea};
use tracing::{debug, error, info, warn};

/// Inspection settings for an assembled file, `None` when it is not inspected
pub(super) fn archive_policy(
    config: &ArchiveConfig,
    job_password: Option<&str>,
    filename: &str,
) -> Option<ArchivePolicy> {
    inspectable_kind(filename)?;
    let check_password = config.pause_on_pwrar != ArchiveAction::Off;
    let check_members = config.action_on_unwanted_extensions != ArchiveAction::Off;
    if !check_password && !check_members {
        return None;
    }
    Some(ArchivePolicy {
        passwords: job_password
            .map(str::to_string)
            .into_iter()
            .chain(config.passwords.iter().cloned())
            .collect(),
        banned: if check_members {
            config.unwanted_extensions.clone()
        } else {
            Vec::new()
        },
    })
}

/// What the assembler should do with an article, if anything yet
fn slot_of(article: &Article) -> Option<Slot> {
    if article.on_disk {
        None
    } else if article.decoded {
        Some(Slot::Decoded {
            data_begin: article.data_begin,
            size: article.data_size.unwrap_or(0),
            crc: article.crc.unwrap_or(0),
        })
    } else if article.failed {
        Some(Slot::Gap)
    } else {
        None
    }
}

impl Engine {
    /// Send the settled articles of a file to the assembler; `only` limits it
    /// to one article. Nothing is sent before the file name is settled.
    pub(super) fn sync_file(&mut self, job_id: &JobId, file: usize, only: Option<usize>) {
        let Some(job) = self.queue.get(job_id) else {
            return;
        };
        let Some(nzf) = job.files.get(file) else {
            return;
        };
        if nzf.assembled || !nzf.filename_checked {
            return;
        }
        let slots: Vec<(usize, Slot)> = nzf
            .articles
            .iter()
            .enumerate()
            .skip(nzf.assembled_upto)
            .filter(|(index, _)| only.is_none_or(|o| o == *index))
            .filter_map(|(index, article)| slot_of(article).map(|slot| (index, slot)))
            .collect();
        if slots.is_empty() {
            return;
        }
        let progress = if job.size_bytes == 0 {
            0.0
        } else {
            job.downloaded_bytes() as f64 / job.size_bytes as f64
        };
        let step = AssembleStep {
            job: job_id.clone(),
            file,
            path: job.workdir.join(&nzf.filename),
            total: nzf.articles.len(),
            resume: FileCursor::resume(nzf),
            slots,
            inspect: archive_policy(&self.config.archive, job.password.as_deref(), &nzf.filename),
            progress,
        };
        self.assembler.submit(AssembleMsg::Step(step));
    }

    /// Tell the assembler every file of the job is done (once per job)
    pub(super) fn end_of_job(&mut self, job: &JobId) {
        if self.ended.insert(job.clone()) {
            self.assembler.submit(AssembleMsg::EndOfJob { job: job.clone() });
        }
    }

    pub(super) async fn on_assembly(&mut self, report: AssemblyReport) {
        match report {
            AssemblyReport::Progress {
                id,
                written,
                upto,
                crc,
            } => {
                let Some(job) = self.queue.get_mut(&id.job) else {
                    return;
                };
                if let Some(file) = job.files.get_mut(id.file) {
                    file.assembled_upto = file.assembled_upto.max(upto);
                    file.crc = Some(crc);
                    if written && let Some(article) = file.articles.get_mut(id.article) {
                        article.on_disk = true;
                        article.decoded = false;
                    }
                }
                self.dirty.insert(id.job);
            }
            AssemblyReport::FileDone {
                job,
                file,
                crc,
                size,
            } => self.on_file_done(job, file, crc, size),
            AssemblyReport::ArchiveChecked { job, file, report } => {
                self.on_archive_checked(job, file, report).await
            }
            AssemblyReport::Missing { id } => {
                warn!(article = %id, "decoded article vanished from the cache, fetching it again");
                if self.is_live(&id.job) {
                    self.refetch(&id);
                }
            }
            AssemblyReport::DiskFull { id } => {
                error!(article = %id, "disk full while assembling");
                self.refetch(&id);
                self.warnings
                    .error("Disk full while assembling files, downloader paused");
                self.emit(Event::DiskFull {
                    area: StorageArea::Incomplete,
                    required_bytes: self.config.download.download_free,
                });
                self.pause(PauseReason::DiskFull);
            }
            AssemblyReport::DiskError { id, message } => {
                error!(article = %id, error = %message, "write error while assembling");
                self.refetch(&id);
                if let Some(job) = self.queue.get_mut(&id.job) {
                    job.fail_message = Some(message.clone());
                }
                self.warnings.error(format!("Write error: {message}"));
                self.pause(PauseReason::DiskError);
            }
            AssemblyReport::SpaceLow {
                area,
                required,
                available,
            } => {
                warn!(area = ?area, required, available, "free space below the floor");
                self.warnings.warn(format!(
                    "Free space in the {area:?} area is below {required} bytes ({available} left), downloader paused"
                ));
                self.emit(Event::DiskFull {
                    area,
                    required_bytes: required,
                });
                self.pause(PauseReason::DiskFull);
            }
            AssemblyReport::JobAssembled { job } => {
                debug!(job_id = %job, "every file of the job is on disk");
                self.assembled.insert(job.clone());
                self.try_finish(&job).await;
            }
        }
    }

    fn on_file_done(&mut self, job_id: JobId, file: usize, crc: u32, size: u64) {
        if !self.is_live(&job_id) {
            return;
        }
        let Some(job) = self.queue.get_mut(&job_id) else {
            return;
        };
        let Some(nzf) = job.files.get_mut(file) else {
            return;
        };
        nzf.assembled = true;
        nzf.crc = Some(crc);
        nzf.actual_bytes = Some(size);
        let event = Event::FileAssembled {
            id: job_id.clone(),
            filename: nzf.filename.clone(),
            bad_articles: nzf.bad_articles(),
        };
        info!(job_id = %job_id, filename = %nzf.filename, size, "file assembled");
        let all_done = job.is_assembled();
        self.dirty.insert(job_id.clone());
        self.emit(event);
        if all_done {
            self.end_of_job(&job_id);
        }
    }

    async fn on_archive_checked(&mut self, job_id: JobId, file: usize, report: ArchiveReport) {
        if let Some(pending) = self.reinspecting.get_mut(&job_id) {
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.reinspecting.remove(&job_id);
            }
        }
        if !self.is_live(&job_id) {
            return;
        }
        let on_encrypted = self.config.archive.pause_on_pwrar;
        let on_unwanted = self.config.archive.action_on_unwanted_extensions;
        let Some(job) = self.queue.get_mut(&job_id) else {
            return;
        };
        let name = job.name.clone();
        let archive = job
            .files
            .get(file)
            .map(|f| f.filename.clone())
            .unwrap_or_default();

        if let Some(member) = report.unwanted.clone()
            && on_unwanted != ArchiveAction::Off
        {
            job.unwanted = Some(member.clone());
            warn!(job_id = %job_id, archive = %archive, member = %member, "banned file inside archive");
            self.warnings
                .warn(format!("{name}: {archive} contains banned file {member}"));
            self.emit(Event::UnwantedExtension {
                id: job_id.clone(),
                archive: archive.clone(),
                member: member.clone(),
            });
            match on_unwanted {
                ArchiveAction::Pause => self.pause_job_for(&job_id, "unwanted extension"),
                ArchiveAction::Abort => {
                    self.fail_job(&job_id, format!("unwanted extension: {member}"))
                        .await;
                    return;
                }
                ArchiveAction::Off => {}
            }
        }

        if report.encrypted && on_encrypted != ArchiveAction::Off {
            if let Some(job) = self.queue.get_mut(&job_id) {
                job.encrypted = 1;
            }
            warn!(job_id = %job_id, archive = %archive, cloaked = report.cloaked, "encrypted archive");
            self.warnings.warn(format!("{name}: {archive} is encrypted"));
            self.emit(Event::Encrypted {
                id: job_id.clone(),
                archive,
            });
            match on_encrypted {
                ArchiveAction::Pause => self.pause_job_for(&job_id, "encrypted"),
                ArchiveAction::Abort => {
                    if let Some(job) = self.queue.get_mut(&job_id) {
                        job.encrypted = 2;
                    }
                    self.fail_job(&job_id, "encryption".to_string()).await;
                    return;
                }
                ArchiveAction::Off => {}
            }
        } else if let Some(password) = report.password
            && let Some(job) = self.queue.get_mut(&job_id)
        {
            debug!(job_id = %job_id, "archive password confirmed");
            job.correct_password = Some(password);
            job.encrypted = 0;
        }

        self.dirty.insert(job_id.clone());
        self.try_finish(&job_id).await;
    }

    /// Pause one job on a policy decision
    pub(super) fn pause_job_for(&mut self, job_id: &JobId, reason: &str) {
        let Some(job) = self.queue.get_mut(job_id) else {
            return;
        };
        if !job.paused {
            job.paused = true;
            info!(job_id = %job_id, reason, "job paused");
            self.dirty.insert(job_id.clone());
            self.queue_dirty = true;
            self.emit(Event::JobPaused {
                id: job_id.clone(),
                reason: reason.to_string(),
            });
        }
    }
}
