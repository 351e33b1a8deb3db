//! File assembly
//!
//! A single task appends decoded payloads to their target files. The
//! scheduling loop submits [`Slot`]s as articles settle; the assembler keeps a
//! cursor per file and only ever writes the article at the cursor, so writes
//! (and the running CRC) follow declared order even when decodes finish out of
//! order. A file is finalized once the cursor passes its last article.

use crate::archive::{ArchiveInspector, ArchiveReport, check_archive};
use crate::cache::ArticleCache;
use crate::config::DownloadConfig;
use crate::model::NzbFile;
use crate::postproc::PostProcessorHandoff;
use crate::types::{ArticleId, JobId, StorageArea};
use crate::utils::{get_available_space, is_disk_full, is_recovery_file};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum gap between two free-space checks
const SPACE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Job progress from which the complete area is checked too
const COMPLETE_CHECK_PROGRESS: f64 = 0.95;

/// Target file access
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Current length (0 when the file does not exist yet)
    async fn len(&self, path: &Path) -> io::Result<u64>;

    /// Write all of `data` at `offset`, creating the file when needed
    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Cut the file back to `len`
    async fn truncate(&self, path: &Path, len: u64) -> io::Result<()>;

    /// The file is complete
    async fn finalize(&self, path: &Path) -> io::Result<()>;
}

/// [`FileStore`] on the local filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFileStore;

#[async_trait]
impl FileStore for LocalFileStore {
    async fn len(&self, path: &Path) -> io::Result<u64> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn truncate(&self, path: &Path, len: u64) -> io::Result<()> {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await
    }

    async fn finalize(&self, path: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
        }
        #[cfg(not(unix))]
        {
            let _ = path;
        }
        Ok(())
    }
}

/// Where a file's assembly stands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileCursor {
    /// Index of the next article to write
    pub next: usize,
    /// CRC32 of the bytes written so far
    pub crc: u32,
    /// Bytes written so far
    pub written: u64,
    /// End of the furthest write (append position for payloads without an offset)
    pub end: u64,
}

impl FileCursor {
    /// Resume point for a file partly assembled by an earlier run
    pub fn resume(file: &NzbFile) -> Self {
        let mut cursor = FileCursor {
            next: file.assembled_upto,
            crc: file.crc.unwrap_or(0),
            ..Default::default()
        };
        for article in file.articles.iter().take(file.assembled_upto).filter(|a| a.on_disk) {
            let size = article.data_size.unwrap_or(0);
            cursor.written += size;
            let end = article.data_begin.map_or(cursor.end + size, |b| b + size);
            cursor.end = cursor.end.max(end);
        }
        cursor
    }
}

/// An article's contribution to its file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Payload is in the cache
    Decoded {
        /// Offset in the file, when the framing carried one
        data_begin: Option<u64>,
        /// Payload length
        size: u64,
        /// CRC32 of the payload
        crc: u32,
    },
    /// No server delivered it; nothing is written
    Gap,
}

/// Passwords and banned extensions for archive inspection
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchivePolicy {
    pub passwords: Vec<String>,
    pub banned: Vec<String>,
}

/// New slots for one file
#[derive(Clone, Debug)]
pub struct AssembleStep {
    pub job: JobId,
    /// File index within the job
    pub file: usize,
    /// Target path
    pub path: PathBuf,
    /// Articles in the file; the file is done when the cursor reaches it
    pub total: usize,
    /// Used when the assembler has no cursor for this file yet
    pub resume: FileCursor,
    /// `(article index, slot)`
    pub slots: Vec<(usize, Slot)>,
    /// Inspect the file once done
    pub inspect: Option<ArchivePolicy>,
    /// Fraction of the job downloaded, for the complete-area check
    pub progress: f64,
}

/// Work for the assembler
#[derive(Clone, Debug)]
pub enum AssembleMsg {
    Step(AssembleStep),
    /// Every file of the job is done
    EndOfJob { job: JobId },
    /// The job was deleted: drop its cursors and pending slots
    Forget { job: JobId },
    /// Inspect an assembled archive again (new password)
    Reinspect {
        job: JobId,
        file: usize,
        path: PathBuf,
        policy: ArchivePolicy,
    },
}

/// What the assembler did
#[derive(Clone, Debug, PartialEq)]
pub enum AssemblyReport {
    /// The cursor moved past an article
    Progress {
        id: ArticleId,
        /// Bytes were written (false for a gap)
        written: bool,
        /// New cursor position
        upto: usize,
        /// Running CRC
        crc: u32,
    },
    /// The file is finalized
    FileDone {
        job: JobId,
        file: usize,
        crc: u32,
        size: u64,
    },
    /// Archive inspection verdict
    ArchiveChecked {
        job: JobId,
        file: usize,
        report: ArchiveReport,
    },
    /// The payload was no longer in the cache
    Missing { id: ArticleId },
    /// Disk full while writing; the file was cut back to its previous length
    DiskFull { id: ArticleId },
    /// Other write failure
    DiskError { id: ArticleId, message: String },
    /// Free space fell below the floor
    SpaceLow {
        area: StorageArea,
        required: u64,
        available: u64,
    },
    /// Reply to [`AssembleMsg::EndOfJob`]
    JobAssembled { job: JobId },
}

/// Free-space floors
#[derive(Clone, Debug, Default)]
pub struct FreeSpacePolicy {
    pub incomplete_dir: PathBuf,
    pub download_free: u64,
    pub complete_dir: PathBuf,
    pub complete_free: u64,
    pub direct_unpack: bool,
}

impl From<&DownloadConfig> for FreeSpacePolicy {
    fn from(cfg: &DownloadConfig) -> Self {
        Self {
            incomplete_dir: cfg.incomplete_dir.clone(),
            download_free: cfg.download_free,
            complete_dir: cfg.complete_dir.clone(),
            complete_free: cfg.complete_free,
            direct_unpack: cfg.direct_unpack,
        }
    }
}

/// Collaborators of the assembler task
pub struct AssemblerDeps {
    pub cache: Arc<ArticleCache>,
    pub store: Arc<dyn FileStore>,
    pub inspector: Arc<dyn ArchiveInspector>,
    pub handoff: Arc<dyn PostProcessorHandoff>,
    pub space: FreeSpacePolicy,
}

/// Handle to the assembler task
pub struct Assembler {
    tx: mpsc::UnboundedSender<AssembleMsg>,
    backlog: Arc<AtomicUsize>,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Assembler {
    /// Spawn the assembler task; reports go to `reports`
    pub fn start(deps: AssemblerDeps, reports: mpsc::UnboundedSender<AssemblyReport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let worker = Worker {
            deps,
            reports,
            backlog: Arc::clone(&backlog),
            files: HashMap::new(),
            last_space_check: None,
        };
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));
        Self {
            tx,
            backlog,
            cancel,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Queue work. Decoded slots count toward the backlog until written.
    pub fn submit(&self, msg: AssembleMsg) {
        if let AssembleMsg::Step(step) = &msg {
            let decoded = step
                .slots
                .iter()
                .filter(|(_, s)| matches!(s, Slot::Decoded { .. }))
                .count();
            self.backlog.fetch_add(decoded, Ordering::SeqCst);
        }
        if self.tx.send(msg).is_err() {
            warn!("assembler is gone, dropping work");
        }
    }

    /// Decoded payloads waiting to be written
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Stop the task, waiting at most `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle
            && tokio::time::timeout(timeout, handle).await.is_err()
        {
            warn!("assembler did not stop in time, abandoning it");
        }
    }
}

struct FileState {
    path: PathBuf,
    total: usize,
    cursor: FileCursor,
    pending: BTreeMap<usize, Slot>,
    inspect: Option<ArchivePolicy>,
    progress: f64,
    done: bool,
}

struct Worker {
    deps: AssemblerDeps,
    reports: mpsc::UnboundedSender<AssemblyReport>,
    backlog: Arc<AtomicUsize>,
    files: HashMap<(JobId, usize), FileState>,
    last_space_check: Option<Instant>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AssembleMsg>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.handle(msg).await;
        }
        debug!("assembler stopped");
    }

    fn report(&self, report: AssemblyReport) {
        let _ = self.reports.send(report);
    }

    fn consumed(&self) {
        let _ = self
            .backlog
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    async fn handle(&mut self, msg: AssembleMsg) {
        match msg {
            AssembleMsg::Step(step) => self.step(step).await,
            AssembleMsg::EndOfJob { job } => {
                self.files.retain(|(j, _), _| j != &job);
                info!(job_id = %job, "all files assembled");
                self.report(AssemblyReport::JobAssembled { job });
            }
            AssembleMsg::Forget { job } => {
                let keys: Vec<_> = self.files.keys().filter(|(j, _)| j == &job).cloned().collect();
                for key in keys {
                    if let Some(state) = self.files.remove(&key) {
                        for slot in state.pending.values() {
                            if matches!(slot, Slot::Decoded { .. }) {
                                self.consumed();
                            }
                        }
                    }
                }
                debug!(job_id = %job, "assembler forgot job");
            }
            AssembleMsg::Reinspect {
                job,
                file,
                path,
                policy,
            } => {
                let report = self.inspect(&job, &path, &policy).await;
                self.report(AssemblyReport::ArchiveChecked { job, file, report });
            }
        }
    }

    async fn step(&mut self, step: AssembleStep) {
        let key = (step.job.clone(), step.file);
        let mut state = self.files.remove(&key).unwrap_or_else(|| FileState {
            path: step.path.clone(),
            total: step.total,
            cursor: step.resume,
            pending: BTreeMap::new(),
            inspect: None,
            progress: 0.0,
            done: false,
        });
        state.path = step.path;
        state.total = step.total;
        state.inspect = step.inspect;
        state.progress = step.progress;

        for (index, slot) in step.slots {
            let stale = index < state.cursor.next || state.done;
            let replaced = if stale {
                None
            } else {
                state.pending.insert(index, slot)
            };
            if stale && matches!(slot, Slot::Decoded { .. }) {
                self.consumed();
            }
            if matches!(replaced, Some(Slot::Decoded { .. })) {
                self.consumed();
            }
        }

        let wrote = self.advance(&step.job, step.file, &mut state).await;
        if !state.done && state.cursor.next >= state.total {
            self.finish_file(&step.job, step.file, &mut state).await;
        }
        let progress = state.progress;
        self.files.insert(key, state);
        if wrote {
            self.check_space(progress);
        }
    }

    /// Write everything contiguous from the cursor. Returns true when bytes were written.
    async fn advance(&mut self, job: &JobId, file: usize, state: &mut FileState) -> bool {
        let mut wrote = false;
        while let Some(slot) = state.pending.remove(&state.cursor.next) {
            let index = state.cursor.next;
            let id = ArticleId::new(job.clone(), file, index);
            match slot {
                Slot::Gap => {
                    state.cursor.next += 1;
                    self.report(AssemblyReport::Progress {
                        id,
                        written: false,
                        upto: state.cursor.next,
                        crc: state.cursor.crc,
                    });
                }
                Slot::Decoded {
                    data_begin,
                    size,
                    crc,
                } => {
                    self.consumed();
                    if let Err(report) = self.write_one(&id, state, data_begin, size, crc).await {
                        self.report(report);
                        break;
                    }
                    wrote = true;
                    self.report(AssemblyReport::Progress {
                        id,
                        written: true,
                        upto: state.cursor.next,
                        crc: state.cursor.crc,
                    });
                }
            }
        }
        wrote
    }

    async fn write_one(
        &self,
        id: &ArticleId,
        state: &mut FileState,
        data_begin: Option<u64>,
        size: u64,
        crc: u32,
    ) -> Result<(), AssemblyReport> {
        let data = match self.deps.cache.load(id).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                warn!(article = %id, "decoded payload missing from cache");
                return Err(AssemblyReport::Missing { id: id.clone() });
            }
            Err(e) => {
                error!(article = %id, error = %e, "cannot read spilled payload");
                return Err(AssemblyReport::Missing { id: id.clone() });
            }
        };
        if data.len() as u64 != size {
            debug!(article = %id, expected = size, actual = data.len(), "payload size differs from decode report");
        }

        let store = &self.deps.store;
        let offset = data_begin.unwrap_or(state.cursor.end);
        let before = store.len(&state.path).await.unwrap_or(0);
        if let Err(e) = store.write_at(&state.path, offset, &data).await {
            if let Err(te) = store.truncate(&state.path, before).await {
                warn!(path = %state.path.display(), error = %te, "cannot cut file back after failed write");
            }
            if is_disk_full(&e) {
                error!(article = %id, path = %state.path.display(), "disk full while assembling");
                return Err(AssemblyReport::DiskFull { id: id.clone() });
            }
            error!(article = %id, path = %state.path.display(), error = %e, "write failed");
            return Err(AssemblyReport::DiskError {
                id: id.clone(),
                message: e.to_string(),
            });
        }

        let len = data.len() as u64;
        let actual_crc = if data.len() as u64 == size {
            crc
        } else {
            crc32fast::hash(&data)
        };
        let mut running = crc32fast::Hasher::new_with_initial_len(state.cursor.crc, state.cursor.written);
        running.combine(&crc32fast::Hasher::new_with_initial_len(actual_crc, len));
        state.cursor.crc = running.finalize();
        state.cursor.written += len;
        state.cursor.end = state.cursor.end.max(offset + len);
        state.cursor.next += 1;
        Ok(())
    }

    async fn finish_file(&mut self, job: &JobId, file: usize, state: &mut FileState) {
        if let Err(e) = self.deps.store.finalize(&state.path).await {
            warn!(path = %state.path.display(), error = %e, "cannot finalize file");
        }
        state.done = true;
        info!(job_id = %job, path = %state.path.display(), bytes = state.cursor.written, "file assembled");
        self.report(AssemblyReport::FileDone {
            job: job.clone(),
            file,
            crc: state.cursor.crc,
            size: state.cursor.end,
        });

        let name = state
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if is_recovery_file(&name) {
            self.deps.handoff.found_recovery_set(job, &state.path).await;
        }
        if let Some(policy) = state.inspect.take() {
            let report = self.inspect(job, &state.path, &policy).await;
            self.report(AssemblyReport::ArchiveChecked {
                job: job.clone(),
                file,
                report,
            });
        }
    }

    async fn inspect(&self, job: &JobId, path: &Path, policy: &ArchivePolicy) -> ArchiveReport {
        match check_archive(
            self.deps.inspector.as_ref(),
            path,
            &policy.passwords,
            &policy.banned,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(job_id = %job, path = %path.display(), error = %e, "archive inspection failed");
                ArchiveReport::default()
            }
        }
    }

    fn check_space(&mut self, progress: f64) {
        let now = Instant::now();
        if self
            .last_space_check
            .is_some_and(|last| now.duration_since(last) < SPACE_CHECK_INTERVAL)
        {
            return;
        }
        self.last_space_check = Some(now);

        let space = &self.deps.space;
        let mut checks = vec![(StorageArea::Incomplete, &space.incomplete_dir, space.download_free)];
        if space.direct_unpack || progress >= COMPLETE_CHECK_PROGRESS {
            checks.push((StorageArea::Complete, &space.complete_dir, space.complete_free));
        }
        for (area, dir, required) in checks {
            if required == 0 {
                continue;
            }
            match get_available_space(dir) {
                Ok(available) if available < required => {
                    warn!(?area, available, required, "free space below floor");
                    self.report(AssemblyReport::SpaceLow {
                        area,
                        required,
                        available,
                    });
                }
                Ok(_) => {}
                Err(e) => debug!(?area, error = %e, "free-space check failed"),
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::LocalArchiveInspector;
    use crate::postproc::FinishedJob;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Local store that fails one write with ENOSPC after writing half of it
    #[derive(Default)]
    struct FullOnce {
        fail_at: Mutex<Option<u64>>,
    }

    #[async_trait]
    impl FileStore for FullOnce {
        async fn len(&self, path: &Path) -> io::Result<u64> {
            LocalFileStore.len(path).await
        }

        async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
            let fail = {
                let mut fail_at = self.fail_at.lock().unwrap();
                if *fail_at == Some(offset) {
                    *fail_at = None;
                    true
                } else {
                    false
                }
            };
            if fail {
                LocalFileStore
                    .write_at(path, offset, &data[..data.len() / 2])
                    .await?;
                return Err(io::Error::from_raw_os_error(28));
            }
            LocalFileStore.write_at(path, offset, data).await
        }

        async fn truncate(&self, path: &Path, len: u64) -> io::Result<()> {
            LocalFileStore.truncate(path, len).await
        }

        async fn finalize(&self, path: &Path) -> io::Result<()> {
            LocalFileStore.finalize(path).await
        }
    }

    #[derive(Default)]
    struct RecordingHandoff {
        recovery: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl PostProcessorHandoff for RecordingHandoff {
        async fn found_recovery_set(&self, _job: &JobId, path: &Path) {
            self.recovery.lock().unwrap().push(path.to_path_buf());
        }

        async fn process(&self, _job: FinishedJob) -> crate::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        dir: TempDir,
        cache: Arc<ArticleCache>,
        assembler: Assembler,
        reports: mpsc::UnboundedReceiver<AssemblyReport>,
        handoff: Arc<RecordingHandoff>,
    }

    fn harness(store: Arc<dyn FileStore>) -> Harness {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ArticleCache::new(1 << 20, dir.path().join("admin")));
        let handoff = Arc::new(RecordingHandoff::default());
        let (tx, reports) = mpsc::unbounded_channel();
        let assembler = Assembler::start(
            AssemblerDeps {
                cache: Arc::clone(&cache),
                store,
                inspector: Arc::new(LocalArchiveInspector),
                handoff: Arc::clone(&handoff) as Arc<dyn PostProcessorHandoff>,
                space: FreeSpacePolicy::default(),
            },
            tx,
        );
        Harness {
            dir,
            cache,
            assembler,
            reports,
            handoff,
        }
    }

    fn parts() -> Vec<Vec<u8>> {
        vec![vec![1u8; 100], vec![2u8; 100], vec![3u8; 50]]
    }

    async fn stage(h: &Harness, job: &JobId, index: usize, data: &[u8]) -> (usize, Slot) {
        let id = ArticleId::new(job.clone(), 0, index);
        h.cache.save(&id, data.to_vec(), false).await.unwrap();
        (
            index,
            Slot::Decoded {
                data_begin: Some(index as u64 * 100),
                size: data.len() as u64,
                crc: crc32fast::hash(data),
            },
        )
    }

    fn step(job: &JobId, path: PathBuf, slots: Vec<(usize, Slot)>) -> AssembleMsg {
        AssembleMsg::Step(AssembleStep {
            job: job.clone(),
            file: 0,
            path,
            total: 3,
            resume: FileCursor::default(),
            slots,
            inspect: None,
            progress: 0.5,
        })
    }

    async fn next_report(h: &mut Harness) -> AssemblyReport {
        tokio::time::timeout(Duration::from_secs(5), h.reports.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn writes_in_declared_order_and_finalizes() {
        let mut h = harness(Arc::new(LocalFileStore));
        let job = JobId::from("j");
        let path = h.dir.path().join("out.bin");
        let parts = parts();

        // last two parts arrive first: nothing can be written yet
        let late = vec![
            stage(&h, &job, 2, &parts[2]).await,
            stage(&h, &job, 1, &parts[1]).await,
        ];
        h.assembler.submit(step(&job, path.clone(), late));
        let first = vec![stage(&h, &job, 0, &parts[0]).await];
        h.assembler.submit(step(&job, path.clone(), first));

        let mut written = Vec::new();
        loop {
            match next_report(&mut h).await {
                AssemblyReport::Progress { id, written: true, .. } => written.push(id.article),
                AssemblyReport::FileDone { crc, size, .. } => {
                    assert_eq!(size, 250);
                    assert_eq!(crc, crc32fast::hash(&parts.concat()));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(written, vec![0, 1, 2]);
        assert_eq!(std::fs::read(&path).unwrap(), parts.concat());
        assert_eq!(h.assembler.backlog(), 0);
        assert_eq!(h.cache.used(), 0);
    }

    #[tokio::test]
    async fn disk_full_cuts_back_and_resumes_on_resubmit() {
        let store = Arc::new(FullOnce::default());
        *store.fail_at.lock().unwrap() = Some(100);
        let mut h = harness(store);
        let job = JobId::from("j");
        let path = h.dir.path().join("out.bin");
        let parts = parts();

        let slots = vec![
            stage(&h, &job, 0, &parts[0]).await,
            stage(&h, &job, 1, &parts[1]).await,
        ];
        h.assembler.submit(step(&job, path.clone(), slots));
        assert!(matches!(next_report(&mut h).await, AssemblyReport::Progress { written: true, .. }));
        assert_eq!(
            next_report(&mut h).await,
            AssemblyReport::DiskFull {
                id: ArticleId::new(job.clone(), 0, 1)
            }
        );
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);

        // the article is fetched again and resubmitted with the last one
        let slots = vec![
            stage(&h, &job, 1, &parts[1]).await,
            stage(&h, &job, 2, &parts[2]).await,
        ];
        h.assembler.submit(step(&job, path.clone(), slots));
        loop {
            if let AssemblyReport::FileDone { crc, .. } = next_report(&mut h).await {
                assert_eq!(crc, crc32fast::hash(&parts.concat()));
                break;
            }
        }
        assert_eq!(std::fs::read(&path).unwrap(), parts.concat());
    }

    #[tokio::test]
    async fn gaps_are_skipped_and_missing_payloads_reported() {
        let mut h = harness(Arc::new(LocalFileStore));
        let job = JobId::from("j");
        let path = h.dir.path().join("out.bin");
        let parts = parts();

        let present = stage(&h, &job, 0, &parts[0]).await;
        let absent = (
            1,
            Slot::Decoded {
                data_begin: Some(100),
                size: 100,
                crc: 0,
            },
        );
        h.assembler.submit(step(&job, path.clone(), vec![present, absent]));
        assert!(matches!(next_report(&mut h).await, AssemblyReport::Progress { .. }));
        assert_eq!(
            next_report(&mut h).await,
            AssemblyReport::Missing {
                id: ArticleId::new(job.clone(), 0, 1)
            }
        );

        h.assembler
            .submit(step(&job, path.clone(), vec![(1, Slot::Gap), (2, Slot::Gap)]));
        let mut gaps = 0;
        loop {
            match next_report(&mut h).await {
                AssemblyReport::Progress { written: false, .. } => gaps += 1,
                AssemblyReport::FileDone { size, .. } => {
                    assert_eq!(size, 100);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(gaps, 2);
    }

    #[tokio::test]
    async fn recovery_file_triggers_hook_and_end_of_job_replies() {
        let mut h = harness(Arc::new(LocalFileStore));
        let job = JobId::from("j");
        let path = h.dir.path().join("set.vol00+01.par2");
        let id = ArticleId::new(job.clone(), 0, 0);
        h.cache.save(&id, b"PAR2".to_vec(), false).await.unwrap();
        h.assembler.submit(AssembleMsg::Step(AssembleStep {
            job: job.clone(),
            file: 0,
            path: path.clone(),
            total: 1,
            resume: FileCursor::default(),
            slots: vec![(
                0,
                Slot::Decoded {
                    data_begin: None,
                    size: 4,
                    crc: crc32fast::hash(b"PAR2"),
                },
            )],
            inspect: None,
            progress: 1.0,
        }));
        h.assembler.submit(AssembleMsg::EndOfJob { job: job.clone() });
        loop {
            if let AssemblyReport::JobAssembled { job: done } = next_report(&mut h).await {
                assert_eq!(done, job);
                break;
            }
        }
        assert_eq!(h.handoff.recovery.lock().unwrap().as_slice(), &[path]);
    }

    #[test]
    fn resume_point_counts_written_articles() {
        use crate::model::Article;
        let mut file = NzbFile::new(
            "s",
            "f.bin".into(),
            (1..=3).map(|p| Article::new(format!("m{p}"), 100, p)).collect(),
        );
        for (i, article) in file.articles.iter_mut().take(2).enumerate() {
            article.on_disk = true;
            article.data_begin = Some(i as u64 * 100);
            article.data_size = Some(100);
        }
        file.assembled_upto = 2;
        file.crc = Some(42);
        assert_eq!(
            FileCursor::resume(&file),
            FileCursor {
                next: 2,
                crc: 42,
                written: 200,
                end: 200
            }
        );
    }
}
