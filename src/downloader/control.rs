//! Operator control: pause, resume, delete, reorder, priority, servers, queries.

use crate::config::{ConfigChange, ServerConfig};
use crate::error::Result;
use crate::model::Job;
use crate::queue::{PurgeSelector, SortDirection, SortKey};
use crate::types::{
    EngineStatus, HistoryEntry, JobId, JobInfo, Priority, ServerId, ServerStatus,
};
use crate::warnings::Warning;

use super::UsenetDownloader;
use super::command::Command;

impl UsenetDownloader {
    /// Pause a job
    ///
    /// The job keeps its queue position. Articles already dispatched finish;
    /// nothing new is dispatched for it until [`resume`](Self::resume).
    ///
    /// # Errors
    ///
    /// `JobError::NotFound` when the job is not in the queue.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use usenet_engine::*;
    /// # async fn example(downloader: UsenetDownloader, id: JobId) -> Result<()> {
    /// downloader.pause(&id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn pause(&self, id: &JobId) -> Result<()> {
        self.request(|reply| Command::PauseJob {
            id: id.clone(),
            reply,
        })
        .await
    }

    /// Resume a paused job
    ///
    /// A job that was held back after its last file was assembled is handed to
    /// post-processing right away.
    pub async fn resume(&self, id: &JobId) -> Result<()> {
        self.request(|reply| Command::ResumeJob {
            id: id.clone(),
            reply,
        })
        .await
    }

    /// Pause the whole downloader
    ///
    /// Jobs at `Force` priority keep downloading.
    pub async fn pause_all(&self) -> Result<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    /// Resume the downloader, whatever paused it
    pub async fn resume_all(&self) -> Result<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Rename a job and/or supply its archive password
    ///
    /// A password resumes a job held for encryption; its assembled archives are
    /// inspected again with the new password first.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use usenet_engine::*;
    /// # async fn example(downloader: UsenetDownloader, id: JobId) -> Result<()> {
    /// downloader.rename(&id, None, Some("secret".into())).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn rename(
        &self,
        id: &JobId,
        name: Option<String>,
        password: Option<String>,
    ) -> Result<()> {
        self.request(|reply| Command::Rename {
            id: id.clone(),
            name,
            password,
            reply,
        })
        .await
    }

    /// Delete a job
    ///
    /// The job stops at once; it leaves the queue when its in-flight articles
    /// have come back. Cached articles and the admin directory go with it, and
    /// with `del_files` the partially assembled files too.
    pub async fn delete(&self, id: &JobId, del_files: bool) -> Result<()> {
        self.request(|reply| Command::Delete {
            id: id.clone(),
            del_files,
            reply,
        })
        .await
    }

    /// Delete every job the selector matches; returns the deleted ids
    pub async fn purge(&self, selector: PurgeSelector, del_files: bool) -> Result<Vec<JobId>> {
        self.request(|reply| Command::Purge {
            selector,
            del_files,
            reply,
        })
        .await
    }

    /// Move a job to a queue position; returns where it landed
    ///
    /// Moving across a priority boundary gives the job its new neighbour's priority.
    pub async fn move_to(&self, id: &JobId, index: usize) -> Result<usize> {
        self.request(|reply| Command::MoveTo {
            id: id.clone(),
            index,
            reply,
        })
        .await
    }

    /// Move a job directly behind another; returns where it landed
    pub async fn move_after(&self, id: &JobId, anchor: &JobId) -> Result<usize> {
        self.request(|reply| Command::MoveAfter {
            id: id.clone(),
            anchor: anchor.clone(),
            reply,
        })
        .await
    }

    /// Change a job's priority; returns its new position
    ///
    /// `Default` resolves to the category's priority. `Paused` and `Duplicate`
    /// pause the job and keep its rank.
    pub async fn set_priority(&self, id: &JobId, priority: Priority) -> Result<usize> {
        self.request(|reply| Command::ChangePriority {
            id: id.clone(),
            priority,
            reply,
        })
        .await
    }

    /// Sort the queue within each priority rank
    pub async fn sort_queue(&self, key: SortKey, direction: SortDirection) -> Result<()> {
        self.request(|reply| Command::Sort {
            key,
            direction,
            reply,
        })
        .await
    }

    /// Restrict dispatch to the head job
    pub fn set_top_only(&self, top_only: bool) {
        self.bus.publish(ConfigChange::TopOnly(top_only));
    }

    /// Change the article cache budget (negative means the platform maximum)
    pub fn set_cache_limit(&self, limit: i64) {
        self.bus.publish(ConfigChange::CacheLimit(limit));
    }

    /// Change the bandwidth limit in bytes per second (`None` = unlimited)
    pub fn set_speed_limit(&self, limit_bps: Option<u64>) {
        self.bus.publish(ConfigChange::BandwidthLimit(limit_bps));
    }

    /// Control-plane view of one job
    pub async fn job_info(&self, id: &JobId) -> Result<JobInfo> {
        self.request(|reply| Command::JobInfo {
            id: id.clone(),
            reply,
        })
        .await
    }

    /// Full state of one job, down to its articles
    pub async fn job(&self, id: &JobId) -> Result<Job> {
        self.request(|reply| Command::Job {
            id: id.clone(),
            reply,
        })
        .await
    }

    /// Every job in queue order
    pub async fn queue_snapshot(&self) -> Result<Vec<JobInfo>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Downloader state, throughput and cache figures
    pub async fn status(&self) -> Result<EngineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Jobs that left the queue, most recent first
    pub async fn history(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        self.store.query_history(limit, offset).await
    }

    /// Remove a history entry; `false` when there was none
    pub async fn delete_history(&self, id: &JobId) -> Result<bool> {
        self.store.delete_history(id).await
    }

    /// Recent warnings and errors, oldest first
    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings.list()
    }

    /// Forget all warnings
    pub fn clear_warnings(&self) {
        self.warnings.clear()
    }

    /// Connection and traffic figures per server
    pub async fn server_status(&self) -> Result<Vec<ServerStatus>> {
        self.request(|reply| Command::Servers { reply }).await
    }

    /// Add a server or replace the settings of an existing one
    ///
    /// Existing connections of a reconfigured server are retired as they come
    /// back. A new server resets every article's try-list.
    pub async fn update_server(&self, server: ServerConfig) -> Result<()> {
        self.request(|reply| Command::UpdateServer {
            config: Box::new(server),
            reply,
        })
        .await
    }

    /// Enable a server; every article's try-list is reset
    pub async fn enable_server(&self, server: &str) -> Result<()> {
        self.request(|reply| Command::EnableServer {
            server: ServerId::from(server),
            reply,
        })
        .await
    }

    /// Disable a server; its connections close as they come back
    pub async fn disable_server(&self, server: &str) -> Result<()> {
        self.request(|reply| Command::DisableServer {
            server: ServerId::from(server),
            reply,
        })
        .await
    }

    /// Remove a server
    pub async fn remove_server(&self, server: &str) -> Result<()> {
        self.request(|reply| Command::RemoveServer {
            server: ServerId::from(server),
            reply,
        })
        .await
    }
}
