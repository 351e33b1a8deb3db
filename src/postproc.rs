//! Hand-off of assembled jobs to a post-processor
//!
//! Verification, repair, extraction and moving to the complete area live
//! outside the engine. The engine calls [`PostProcessorHandoff::found_recovery_set`]
//! as soon as a recovery file is assembled and [`PostProcessorHandoff::process`]
//! once every file of a job is on disk. While `process` runs the job is out of
//! the queue; with `pause_on_post_processing` the downloader sits in
//! `POSTPROC_PAUSED` until every running hand-off returns.

use crate::error::{Error, Result};
use crate::types::JobId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

/// One assembled file as the post-processor sees it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedFile {
    /// Name on disk
    pub filename: String,
    /// Name the manifest declared
    pub declared_name: String,
    /// MD5 of the first 16 KiB, when the first article decoded
    pub signature: Option<[u8; 16]>,
    /// CRC32 of everything written
    pub crc: Option<u32>,
    /// Articles no server could deliver
    pub bad_articles: u32,
}

/// A job whose files are all assembled
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedJob {
    pub id: JobId,
    pub name: String,
    pub category: Option<String>,
    /// Directory holding the assembled files
    pub workdir: PathBuf,
    pub files: Vec<FinishedFile>,
    pub bad_articles: u32,
    /// Password that opened the job's archives, or the one supplied with it
    pub password: Option<String>,
    pub downloaded_bytes: u64,
}

/// The post-processing side of the engine
#[async_trait]
pub trait PostProcessorHandoff: Send + Sync {
    /// A recovery (par2) file was assembled for `job`
    async fn found_recovery_set(&self, job: &JobId, path: &Path);

    /// Process a finished job; returns when post-processing is done
    async fn process(&self, job: FinishedJob) -> Result<()>;
}

/// Hand-off that accepts everything and does nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandoff;

#[async_trait]
impl PostProcessorHandoff for NoopHandoff {
    async fn found_recovery_set(&self, _job: &JobId, _path: &Path) {}

    async fn process(&self, job: FinishedJob) -> Result<()> {
        tracing::debug!(job_id = %job.id, "no post-processor configured");
        Ok(())
    }
}

/// Message from a [`ChannelHandoff`] to its consumer
#[derive(Debug)]
pub enum PostProcMessage {
    /// Recovery file assembled
    RecoverySet { job: JobId, path: PathBuf },
    /// Finished job; answer on `done` when post-processing is over
    Job {
        job: FinishedJob,
        done: oneshot::Sender<Result<()>>,
    },
}

/// Hand-off that forwards everything over a channel to the embedding application
#[derive(Clone, Debug)]
pub struct ChannelHandoff {
    tx: mpsc::UnboundedSender<PostProcMessage>,
}

impl ChannelHandoff {
    /// Hand-off plus the receiving end for the consumer
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PostProcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PostProcessorHandoff for ChannelHandoff {
    async fn found_recovery_set(&self, job: &JobId, path: &Path) {
        let _ = self.tx.send(PostProcMessage::RecoverySet {
            job: job.clone(),
            path: path.to_path_buf(),
        });
    }

    async fn process(&self, job: FinishedJob) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(PostProcMessage::Job { job, done })
            .map_err(|_| Error::Other("post-processor is gone".into()))?;
        // a consumer that drops the reply counts as done
        wait.await.unwrap_or(Ok(()))
    }
}
