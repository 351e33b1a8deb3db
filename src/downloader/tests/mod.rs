use super::test_helpers::*;
use super::*;
use crate::config::ArchiveAction;
use crate::postproc::{ChannelHandoff, PostProcMessage};
use crate::queue::{PurgeSelector, SortDirection, SortKey};
use crate::types::{EngineState, JobId, JobStatus, Priority};
use std::time::Duration;


/// Poll `check` until it holds or 20 seconds pass
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Add a manifest of posted files and return the job id
async fn add_posted(
    downloader: &UsenetDownloader,
    files: &[(&str, u64, u64)],
    options: AddOptions,
) -> JobId {
    let posted: Vec<(&str, Vec<(String, u64)>)> = files
        .iter()
        .map(|&(name, total, part)| (name, posted_file(name, total, part)))
        .collect();
    downloader
        .add_nzb_content(nzb_xml(&posted).as_bytes(), "posted", options)
        .await
        .unwrap()
}

/// Downloader whose finished jobs arrive on the returned channel
async fn downloader_with_handoff(
    config: crate::config::Config,
) -> (
    UsenetDownloader,
    tokio::sync::mpsc::UnboundedReceiver<PostProcMessage>,
) {
    let (handoff, rx) = ChannelHandoff::new();
    let downloader = downloader_with(
        config,
        Collaborators {
            handoff: std::sync::Arc::new(handoff),
            ..Collaborators::default()
        },
    )
    .await;
    (downloader, rx)
}

/// Next finished job from the hand-off channel, acknowledged as done
async fn next_finished(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<PostProcMessage>,
) -> crate::postproc::FinishedJob {
    let deadline = Duration::from_secs(20);
    loop {
        let message = tokio::time::timeout(deadline, rx.recv())
            .await
            .expect("timed out waiting for a finished job")
            .expect("hand-off channel closed");
        if let PostProcMessage::Job { job, done } = message {
            done.send(Ok(())).ok();
            return job;
        }
    }
}
