//! Decoder outcomes

use super::Engine;
use crate::decoder::{DecodeOutcome, DecodedMeta};
use crate::error::DecodeError;
use crate::servers::Pick;
use crate::types::{ArticleId, Event, PauseReason, ServerId, StorageArea};
use crate::utils::{is_disk_full, sanitize_filename};
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl Engine {
    pub(super) async fn on_decode(&mut self, outcome: DecodeOutcome) {
        let job = match &outcome {
            DecodeOutcome::Ready { id, .. }
            | DecodeOutcome::Checked { id, .. }
            | DecodeOutcome::Failed { id, .. }
            | DecodeOutcome::SaveFailed { id, .. }
            | DecodeOutcome::Dropped { id } => id.job.clone(),
        };

        match outcome {
            DecodeOutcome::Ready {
                id,
                server,
                meta,
                crc_mismatch,
            } => self.on_decoded(id, server, meta, crc_mismatch).await,
            DecodeOutcome::Checked { id, .. } => {
                if self.is_live(&id.job) {
                    self.on_checked(&id).await;
                } else {
                    self.clear_fetcher(&id);
                }
            }
            DecodeOutcome::Failed { id, server, error } => self.on_decode_failed(id, server, error),
            DecodeOutcome::SaveFailed { id, server, error } => {
                if is_disk_full(&error) {
                    error!(article = %id, error = %error, "disk full while saving article");
                    self.warnings
                        .error(format!("Disk full while saving articles: {error}"));
                    self.emit(Event::DiskFull {
                        area: StorageArea::Incomplete,
                        required_bytes: self.config.download.download_free,
                    });
                    self.pause(PauseReason::DiskFull);
                } else {
                    error!(article = %id, server = %server, error = %error, "failed to save article");
                    self.warnings.error(format!("Failed to save article: {error}"));
                    self.pause(PauseReason::DiskError);
                }
                self.refetch(&id);
            }
            DecodeOutcome::Dropped { id } => {
                debug!(article = %id, "payload of a deleted job dropped");
                self.clear_fetcher(&id);
            }
        }

        self.drain(&job).await;
    }

    async fn on_decoded(
        &mut self,
        id: ArticleId,
        server: ServerId,
        meta: DecodedMeta,
        crc_mismatch: Option<(Option<u32>, u32)>,
    ) {
        if !self.is_live(&id.job) {
            self.cache.purge(std::slice::from_ref(&id)).await;
            self.clear_fetcher(&id);
            return;
        }

        if let Some((expected, computed)) = crc_mismatch {
            warn!(
                article = %id,
                server = %server,
                expected = ?expected.map(|c| format!("{c:08x}")),
                computed = %format!("{computed:08x}"),
                "CRC mismatch"
            );
            if self.config.download.fail_on_crc && self.try_elsewhere(&id, &server) {
                self.cache.purge(std::slice::from_ref(&id)).await;
                return;
            }
        }

        let Some(job) = self.queue.get_mut(&id.job) else {
            return;
        };
        let Some(file) = job.files.get_mut(id.file) else {
            return;
        };
        let Some(article) = file.articles.get_mut(id.article) else {
            return;
        };
        article.apply_decoded(&meta, crc_mismatch.is_some());
        let lowest = article.lowest_partnum;

        let sync = if lowest && !file.filename_checked {
            if let Some(name) = meta.filename.as_deref().map(sanitize_filename)
                && name != file.filename
            {
                info!(job_id = %id.job, declared = %file.filename, actual = %name, "file name taken from the payload");
                file.filename = name;
            }
            file.signature = meta.signature;
            if file.actual_bytes.is_none() {
                file.actual_bytes = meta.file_size;
            }
            file.filename_checked = true;
            Some(None)
        } else if file.filename_checked {
            Some(Some(id.article))
        } else {
            None
        };
        self.dirty.insert(id.job.clone());

        if let Some(only) = sync {
            self.sync_file(&id.job, id.file, only);
        }
    }

    /// Put `server` on the article's try-list and refetch it when another
    /// server could still deliver it. Returns `false` when none could.
    fn try_elsewhere(&mut self, id: &ArticleId, server: &str) -> bool {
        let Some(job) = self.queue.get_mut(&id.job) else {
            return false;
        };
        let posted_at = job.posted_at;
        let Some(article) = job.article_mut(id) else {
            return false;
        };
        article.try_list.add(server);
        let mut allow_backup = article.allow_backup_server;
        let pick = self
            .servers
            .pick(&article.try_list, &mut allow_backup, posted_at, Instant::now());
        if pick == Pick::Exhausted {
            debug!(article = %id, "no other server for a CRC refetch, keeping the data");
            return false;
        }
        job.reset_article(id);
        debug!(article = %id, "refetching after CRC mismatch");
        true
    }

    fn on_decode_failed(&mut self, id: ArticleId, server: ServerId, error: DecodeError) {
        match error {
            DecodeError::OutOfMemory => {
                error!(article = %id, "out of memory while decoding");
                self.warnings
                    .error("Out of memory while decoding, downloader paused");
                self.pause(PauseReason::OutOfMemory);
                self.refetch(&id);
            }
            DecodeError::NotAvailable(reason) => {
                debug!(article = %id, server = %server, reason = %reason, "server answered without the article");
                self.tried_on(&id, &server);
            }
            other => {
                warn!(article = %id, server = %server, error = %other, "undecodable article");
                self.tried_on(&id, &server);
            }
        }
    }

    /// The article was served during pre-check
    pub(super) async fn on_checked(&mut self, id: &ArticleId) {
        if let Some(article) = self.article_mut(id) {
            article.fetcher = None;
            article.checked = true;
        }
        self.check_precheck_done(&id.job).await;
    }
}
