//! Requests from [`UsenetDownloader`](super::UsenetDownloader) handles to the engine task

use crate::config::ServerConfig;
use crate::error::Result;
use crate::model::Job;
use crate::queue::{PurgeSelector, SortDirection, SortKey};
use crate::types::{EngineStatus, JobId, JobInfo, Priority, ServerId, ServerStatus};
use tokio::sync::oneshot;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    Add {
        job: Box<Job>,
        reply: Reply<usize>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    PauseJob {
        id: JobId,
        reply: Reply<()>,
    },
    ResumeJob {
        id: JobId,
        reply: Reply<()>,
    },
    Rename {
        id: JobId,
        name: Option<String>,
        password: Option<String>,
        reply: Reply<()>,
    },
    Delete {
        id: JobId,
        del_files: bool,
        reply: Reply<()>,
    },
    Purge {
        selector: PurgeSelector,
        del_files: bool,
        reply: Reply<Vec<JobId>>,
    },
    MoveTo {
        id: JobId,
        index: usize,
        reply: Reply<usize>,
    },
    MoveAfter {
        id: JobId,
        anchor: JobId,
        reply: Reply<usize>,
    },
    ChangePriority {
        id: JobId,
        priority: Priority,
        reply: Reply<usize>,
    },
    Sort {
        key: SortKey,
        direction: SortDirection,
        reply: Reply<()>,
    },
    JobInfo {
        id: JobId,
        reply: Reply<JobInfo>,
    },
    Job {
        id: JobId,
        reply: Reply<Job>,
    },
    Snapshot {
        reply: Reply<Vec<JobInfo>>,
    },
    Status {
        reply: Reply<EngineStatus>,
    },
    Servers {
        reply: Reply<Vec<ServerStatus>>,
    },
    UpdateServer {
        config: Box<ServerConfig>,
        reply: Reply<()>,
    },
    EnableServer {
        server: ServerId,
        reply: Reply<()>,
    },
    DisableServer {
        server: ServerId,
        reply: Reply<()>,
    },
    RemoveServer {
        server: ServerId,
        reply: Reply<()>,
    },
}
