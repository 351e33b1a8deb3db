use super::{Article, NzbFile};
use crate::types::{ArticleId, JobId, JobInfo, JobStatus, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Output of an external pre-queue script
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreQueueResult {
    /// Category chosen by the script
    pub category: Option<String>,
    /// Priority chosen by the script
    pub priority: Option<Priority>,
}

/// One manifest being downloaded
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    /// Stable job identifier
    pub id: JobId,
    /// Display name, from the manifest or the caller
    pub name: String,
    /// Category the job was filed under
    pub category: Option<String>,
    /// Scheduling rank; always a regular level
    pub priority: Priority,
    /// Lifecycle state
    pub status: JobStatus,
    /// Paused by the operator or by a policy (encryption, banned content)
    pub paused: bool,
    /// Flagged as a duplicate by the pre-queue script
    pub duplicate: bool,
    /// Target files in manifest order
    pub files: Vec<NzbFile>,
    /// Sum of the declared file sizes
    pub size_bytes: u64,
    /// Declared bytes of articles no server could deliver
    pub missing_bytes: u64,
    /// Articles no server could deliver
    pub bad_articles: u32,
    /// Password supplied with the job or by the operator
    pub password: Option<String>,
    /// Password that opened the job's archives
    pub correct_password: Option<String>,
    /// 0 = not encrypted, 1 = encrypted and waiting, 2 = aborted for encryption
    pub encrypted: u8,
    /// Banned member found inside an archive
    pub unwanted: Option<String>,
    /// Post date, held back by the propagation delay
    pub posted_at: Option<DateTime<Utc>>,
    /// When the job entered the queue
    pub added_at: DateTime<Utc>,
    /// Insertion counter; ties within a priority keep this order
    pub seq: u64,
    /// Running the availability pass
    pub precheck: bool,
    /// Where files are assembled
    pub workdir: PathBuf,
    /// Why the job failed
    pub fail_message: Option<String>,
}

impl Job {
    /// New job from parsed files
    pub fn new(id: JobId, name: impl Into<String>, files: Vec<NzbFile>, workdir: PathBuf) -> Self {
        let size_bytes = files.iter().map(|f| f.declared_bytes).sum();
        Self {
            id,
            name: name.into(),
            category: None,
            priority: Priority::Normal,
            status: JobStatus::Queued,
            paused: false,
            duplicate: false,
            files,
            size_bytes,
            missing_bytes: 0,
            bad_articles: 0,
            password: None,
            correct_password: None,
            encrypted: 0,
            unwanted: None,
            posted_at: None,
            added_at: Utc::now(),
            seq: 0,
            precheck: false,
            workdir,
            fail_message: None,
        }
    }

    /// Look up an article
    pub fn article(&self, id: &ArticleId) -> Option<&Article> {
        self.files.get(id.file)?.articles.get(id.article)
    }

    /// Look up an article for mutation
    pub fn article_mut(&mut self, id: &ArticleId) -> Option<&mut Article> {
        self.files.get_mut(id.file)?.articles.get_mut(id.article)
    }

    /// Put an article back to the fetchable state. Returns false for an unknown id.
    pub fn reset_article(&mut self, id: &ArticleId) -> bool {
        let Some(file) = self.files.get_mut(id.file) else {
            return false;
        };
        let Some(article) = file.articles.get_mut(id.article) else {
            return false;
        };
        article.reset_for_refetch();
        file.rewind(id.article);
        true
    }

    /// Ids of every article
    pub fn article_ids(&self) -> Vec<ArticleId> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(f, file)| {
                (0..file.articles.len()).map(move |a| ArticleId::new(self.id.clone(), f, a))
            })
            .collect()
    }

    /// Articles currently assigned to a fetcher
    pub fn in_flight(&self) -> usize {
        self.files
            .iter()
            .flat_map(|f| &f.articles)
            .filter(|a| a.fetcher.is_some())
            .count()
    }

    /// Deleted jobs only linger until their in-flight work drains
    pub fn is_deleted(&self) -> bool {
        self.status == JobStatus::Deleted
    }

    /// Can articles of this job be dispatched at all
    pub fn is_dispatchable(&self) -> bool {
        !self.paused
            && self.priority != Priority::Stop
            && matches!(
                self.status,
                JobStatus::Queued | JobStatus::Downloading | JobStatus::Checking
            )
    }

    /// Give up on an article: count it and its bytes
    pub fn mark_exhausted(&mut self, id: &ArticleId) -> bool {
        let Some(article) = self.article_mut(id) else {
            return false;
        };
        if article.failed {
            return false;
        }
        article.failed = true;
        article.fetcher = None;
        let bytes = article.bytes;
        self.bad_articles += 1;
        self.missing_bytes += bytes;
        true
    }

    /// Unfetchable bytes exceed `fraction` of the job size
    pub fn is_hopeless(&self, fraction: f64) -> bool {
        self.size_bytes > 0 && self.missing_bytes as f64 > self.size_bytes as f64 * fraction
    }

    /// Every file is finalized on disk
    pub fn is_assembled(&self) -> bool {
        self.files.iter().all(|f| f.assembled)
    }

    /// Every article is checked or given up on (pre-check pass)
    pub fn is_check_done(&self) -> bool {
        self.files
            .iter()
            .flat_map(|f| &f.articles)
            .all(|a| a.checked || a.failed)
    }

    /// Clear try-lists of articles the assembler has not moved past.
    /// Failed articles there become fetchable again.
    pub fn reset_try_lists(&mut self) {
        let mut restored_bytes = 0;
        let mut restored = 0;
        for file in &mut self.files {
            let upto = file.assembled_upto;
            file.rewind(upto);
            for article in file.articles.iter_mut().skip(upto) {
                article.try_list.reset();
                article.allow_backup_server = false;
                article.tries = 0;
                if article.failed {
                    article.failed = false;
                    restored += 1;
                    restored_bytes += article.bytes;
                }
            }
        }
        self.bad_articles = self.bad_articles.saturating_sub(restored);
        self.missing_bytes = self.missing_bytes.saturating_sub(restored_bytes);
    }

    /// End the pre-check pass: articles become fetchable for the real download
    pub fn finish_precheck(&mut self) {
        self.precheck = false;
        self.status = JobStatus::Queued;
        for article in self.files.iter_mut().flat_map(|f| f.articles.iter_mut()) {
            article.checked = false;
            article.try_list.reset();
            article.allow_backup_server = false;
        }
    }

    /// Bytes fetched so far
    pub fn downloaded_bytes(&self) -> u64 {
        self.files.iter().map(NzbFile::downloaded_bytes).sum()
    }

    /// Control-plane view
    pub fn info(&self, position: usize) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            category: self.category.clone(),
            priority: self.priority,
            status: if self.paused && !self.is_deleted() {
                JobStatus::Paused
            } else {
                self.status
            },
            position,
            size_bytes: self.size_bytes,
            downloaded_bytes: self.downloaded_bytes(),
            bad_articles: self.bad_articles,
            files: self.files.len(),
            files_done: self.files.iter().filter(|f| f.assembled).count(),
            encrypted: self.encrypted,
            duplicate: self.duplicate,
            correct_password: self.correct_password.clone(),
            added_at: self.added_at,
        }
    }
}
