//! The scheduling loop
//!
//! One task owns the [`Queue`] and the [`ServerSet`]. Everything else reaches
//! it through channels: operator commands, finished fetches, decoder outcomes,
//! assembler reports and post-processing completions. After every event the
//! loop hands new articles to idle connections.

mod assembly;
mod commands;
mod decode;
mod fetch;
mod jobs;

use super::Collaborators;
use super::command::Command;
use crate::assembler::{Assembler, AssemblerDeps, AssemblyReport, FreeSpacePolicy};
use crate::bpsmeter::{BpsMeter, MeterState, QuotaSignal};
use crate::cache::ArticleCache;
use crate::config::{CacheConfig, Config, ConfigChange, ServerConfig};
use crate::db::{AdminStore, QueueRow};
use crate::decoder::{DecodeOutcome, DecoderPool};
use crate::error::Result;
use crate::model::{Article, Job};
use crate::postproc::PostProcessorHandoff;
use crate::queue::{DispatchScope, Queue};
use crate::servers::ServerSet;
use crate::speed_limiter::SpeedLimiter;
use crate::types::{ArticleId, EngineState, Event, HistoryEntry, JobId, PauseReason};
use crate::warnings::Warnings;
use chrono::Utc;
use fetch::FetchDone;
use jobs::PostProcDone;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Housekeeping period
const TICK: Duration = Duration::from_millis(500);

/// Ticks between job snapshot flushes
const PERSIST_EVERY: u64 = 4;

/// Ticks between meter snapshots
const METER_EVERY: u64 = 60;

/// Admin-store key of the traffic counters
pub(crate) const METER_KEY: &str = "bps_meter";

/// Longest propagation delay honored (one year)
const MAX_PROPAGATION_MINUTES: u64 = 525_600;

/// What the engine is built from
pub(in crate::downloader) struct EngineParts {
    pub config: Arc<Config>,
    pub store: Arc<AdminStore>,
    pub cache: Arc<ArticleCache>,
    pub events: broadcast::Sender<Event>,
    pub warnings: Arc<Warnings>,
    pub config_rx: broadcast::Receiver<ConfigChange>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub collaborators: Collaborators,
    pub cancel: CancellationToken,
    pub restored: Vec<Job>,
    pub meter: Option<MeterState>,
}

/// Receiving ends of the loop's channels
pub(in crate::downloader) struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    fetches: mpsc::UnboundedReceiver<FetchDone>,
    decoded: mpsc::UnboundedReceiver<DecodeOutcome>,
    assembly: mpsc::UnboundedReceiver<AssemblyReport>,
    postproc: mpsc::UnboundedReceiver<PostProcDone>,
    config: broadcast::Receiver<ConfigChange>,
    delayed: watch::Receiver<bool>,
}

/// State owned by the scheduling task
pub(in crate::downloader) struct Engine {
    config: Arc<Config>,
    store: Arc<AdminStore>,
    cache: Arc<ArticleCache>,
    events: broadcast::Sender<Event>,
    warnings: Arc<Warnings>,
    handoff: Arc<dyn PostProcessorHandoff>,

    queue: Queue,
    servers: ServerSet,
    limiter: SpeedLimiter,
    decoder: DecoderPool,
    assembler: Assembler,
    meter: BpsMeter,

    state: EngineState,
    pause_reason: Option<PauseReason>,

    cancel: CancellationToken,
    fetch_cancel: CancellationToken,
    fetches: JoinSet<()>,
    /// Fetch tasks not yet reported back
    in_flight: usize,
    fetch_tx: mpsc::UnboundedSender<FetchDone>,
    postproc_tx: mpsc::UnboundedSender<PostProcDone>,

    /// History rows of jobs in post-processing
    postproc: HashMap<JobId, HistoryEntry>,
    /// Jobs whose end-of-job marker went to the assembler
    ended: HashSet<JobId>,
    /// Jobs the assembler reported complete
    assembled: HashSet<JobId>,
    /// Outstanding archive re-inspections per job
    reinspecting: HashMap<JobId, usize>,
    /// Deleted or failed jobs waiting for their in-flight articles; value is `del_files`
    retiring: HashMap<JobId, bool>,

    dirty: HashSet<JobId>,
    queue_dirty: bool,
    ticks: u64,
}

impl Engine {
    /// Build the engine and start its worker pools
    pub(in crate::downloader) fn new(parts: EngineParts) -> Result<(Self, Inbox)> {
        let EngineParts {
            config,
            store,
            cache,
            events,
            warnings,
            config_rx,
            commands,
            collaborators,
            cancel,
            restored,
            meter,
        } = parts;

        let limiter = SpeedLimiter::new(config.download.bandwidth_limit);
        let servers = ServerSet::from_config(&config.servers, Some(limiter.clone()))?;

        let (decoded_tx, decoded) = mpsc::unbounded_channel();
        let decoder = DecoderPool::start(
            config.download.decoder_workers,
            config.download.decoder_high_water,
            config.download.decoder_low_water,
            Arc::clone(&cache),
            decoded_tx,
        );
        let delayed = decoder.delayed();

        let (assembly_tx, assembly) = mpsc::unbounded_channel();
        let assembler = Assembler::start(
            AssemblerDeps {
                cache: Arc::clone(&cache),
                store: collaborators.files,
                inspector: collaborators.archives,
                handoff: Arc::clone(&collaborators.handoff),
                space: FreeSpacePolicy::from(&config.download),
            },
            assembly_tx,
        );

        let meter = match meter {
            Some(state) => BpsMeter::restore(config.quota.clone(), state, Utc::now()),
            None => BpsMeter::new(config.quota.clone(), Utc::now()),
        };

        let (fetch_tx, fetches) = mpsc::unbounded_channel();
        let (postproc_tx, postproc) = mpsc::unbounded_channel();

        let mut queue = Queue::new(config.download.top_only);
        for job in restored {
            queue.restore(job);
        }

        let mut engine = Self {
            fetch_cancel: cancel.child_token(),
            config,
            store,
            cache,
            events,
            warnings,
            handoff: collaborators.handoff,
            queue,
            servers,
            limiter,
            decoder,
            assembler,
            meter,
            state: EngineState::Running,
            pause_reason: None,
            cancel,
            fetches: JoinSet::new(),
            in_flight: 0,
            fetch_tx,
            postproc_tx,
            postproc: HashMap::new(),
            ended: HashSet::new(),
            assembled: HashSet::new(),
            reinspecting: HashMap::new(),
            retiring: HashMap::new(),
            dirty: HashSet::new(),
            queue_dirty: false,
            ticks: 0,
        };
        engine.resume_assembly();

        let inbox = Inbox {
            commands,
            fetches,
            decoded,
            assembly,
            postproc,
            config: config_rx,
            delayed,
        };
        Ok((engine, inbox))
    }

    /// Run until cancelled, then tear down
    pub(in crate::downloader) async fn run(mut self, mut inbox: Inbox) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            jobs = self.queue.len(),
            servers = self.servers.iter().count(),
            "download engine started"
        );

        loop {
            self.dispatch().await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = inbox.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(done) = inbox.fetches.recv() => self.on_fetch(done).await,
                Some(outcome) = inbox.decoded.recv() => self.on_decode(outcome).await,
                Some(report) = inbox.assembly.recv() => self.on_assembly(report).await,
                Some(done) = inbox.postproc.recv() => self.on_postproc(done).await,
                Ok(change) = inbox.config.recv() => self.on_config(change).await,
                Ok(()) = inbox.delayed.changed() => {
                    debug!(delayed = *inbox.delayed.borrow(), "decoder back-pressure changed");
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.stop().await;
    }

    /// Hand articles to idle connections until nothing more can run
    async fn dispatch(&mut self) {
        let Some(mut scope) = self.dispatch_scope() else {
            return;
        };
        let now = Instant::now();
        let mut exhausted = Vec::new();

        while !self.decoder.is_delayed() {
            scope.cursor_only = self.assembler.backlog() >= self.cache.write_trigger();
            let Some(dispatch) = self
                .queue
                .next_article(&self.servers, now, scope, &mut exhausted)
            else {
                break;
            };
            let lease = self
                .servers
                .get_mut(&dispatch.server)
                .and_then(|pool| pool.acquire_connection(now));
            let Some(lease) = lease else {
                self.clear_fetcher(&dispatch.id);
                break;
            };
            debug!(
                article = %dispatch.id,
                server = %dispatch.server,
                precheck = dispatch.precheck,
                "dispatching article"
            );
            self.in_flight += 1;
            self.fetches.spawn(fetch::run(
                lease,
                dispatch,
                self.fetch_tx.clone(),
                self.fetch_cancel.clone(),
            ));
        }

        for id in exhausted {
            self.on_exhausted(id).await;
        }
    }

    /// What the current engine state lets run; `None` when nothing may
    fn dispatch_scope(&self) -> Option<DispatchScope> {
        let force_only = match (self.state, self.pause_reason) {
            (EngineState::Running, _) => false,
            (EngineState::PostprocPaused, _) => true,
            (EngineState::Paused, Some(PauseReason::Operator | PauseReason::Quota)) => true,
            (EngineState::Paused, _) => return None,
        };
        let minutes = self.config.download.propagation_delay.min(MAX_PROPAGATION_MINUTES);
        Some(DispatchScope {
            force_only,
            propagation_delay: chrono::Duration::minutes(minutes as i64),
            cursor_only: false,
        })
    }

    async fn on_tick(&mut self) {
        self.ticks += 1;
        let now = Instant::now();

        while self.fetches.try_join_next().is_some() {}

        if self.servers.check_timers(now) {
            debug!("server backoff elapsed");
        }
        if let Some(signal) = self.meter.tick(now, Utc::now()) {
            self.on_quota(signal);
        }
        if self.ticks % PERSIST_EVERY == 0 {
            self.persist(false).await;
        }
        if self.ticks % METER_EVERY == 0 {
            self.save_meter().await;
        }
    }

    fn on_quota(&mut self, signal: QuotaSignal) {
        match signal {
            QuotaSignal::Exceeded => {
                warn!("download quota reached, pausing");
                self.warnings.warn("Download quota reached, downloader paused");
                self.emit(Event::QuotaExceeded);
                self.pause(PauseReason::Quota);
            }
            QuotaSignal::Reset { resume } => {
                info!("new quota period started");
                if resume && self.pause_reason == Some(PauseReason::Quota) {
                    self.resume();
                }
            }
        }
    }

    async fn on_config(&mut self, change: ConfigChange) {
        match change {
            ConfigChange::CacheLimit(raw) => {
                let limit = CacheConfig::resolve(raw);
                match self.cache.set_limit(limit).await {
                    Ok(()) => info!(limit, "cache limit changed"),
                    Err(e) => error!(error = %e, "failed to spill cache after limit change"),
                }
            }
            ConfigChange::TopOnly(top_only) => {
                info!(top_only, "top-only changed");
                self.queue.set_top_only(top_only);
            }
            ConfigChange::Server(server) => {
                let name = server.id();
                if let Err(e) = self.apply_server(*server) {
                    warn!(server = %name, error = %e, "server update rejected");
                    self.warnings.warn(format!("Server {name} update rejected: {e}"));
                }
            }
            ConfigChange::ServerRemoved(server) => {
                if self.servers.remove(&server) {
                    info!(server = %server, "server removed");
                }
            }
            ConfigChange::BandwidthLimit(limit) => {
                info!(limit = ?limit, "bandwidth limit changed");
                self.limiter.set_limit(limit);
            }
        }
    }

    /// Add or reconfigure a server. A server that starts taking work again
    /// resets every try-list so articles it never saw get another chance.
    fn apply_server(&mut self, server: ServerConfig) -> Result<()> {
        let id = server.id();
        let enabled = server.enabled;
        let was_enabled = self.servers.get(&id).is_some_and(|pool| pool.is_enabled());
        let added = self.servers.update(server, Some(self.limiter.clone()))?;
        info!(server = %id, added, enabled, "server configuration applied");
        if enabled && (added || !was_enabled) {
            self.queue.reset_try_lists();
        }
        Ok(())
    }

    fn pause(&mut self, reason: PauseReason) {
        if self.state == EngineState::Paused && self.pause_reason == Some(reason) {
            return;
        }
        info!(reason = ?reason, "downloader paused");
        self.state = EngineState::Paused;
        self.pause_reason = Some(reason);
        self.emit(Event::StateChanged { state: self.state });
    }

    fn resume(&mut self) {
        self.pause_reason = None;
        let state = if !self.postproc.is_empty() && self.config.download.pause_on_post_processing {
            EngineState::PostprocPaused
        } else {
            EngineState::Running
        };
        if state != self.state {
            info!(state = ?state, "downloader resumed");
            self.state = state;
            self.emit(Event::StateChanged { state });
        }
    }

    fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }

    fn is_live(&self, job: &JobId) -> bool {
        !self.retiring.contains_key(job) && self.queue.get(job).is_some()
    }

    fn article_mut(&mut self, id: &ArticleId) -> Option<&mut Article> {
        self.queue.get_mut(&id.job)?.article_mut(id)
    }

    fn clear_fetcher(&mut self, id: &ArticleId) {
        if let Some(article) = self.article_mut(id) {
            article.fetcher = None;
        }
    }

    /// Reset an article so it is fetched again from the top of its try-list
    fn refetch(&mut self, id: &ArticleId) {
        if let Some(job) = self.queue.get_mut(&id.job)
            && job.reset_article(id)
        {
            self.dirty.insert(id.job.clone());
        }
    }

    fn queue_rows(&self) -> Vec<QueueRow> {
        self.queue
            .iter()
            .filter(|job| !job.is_deleted() && !self.retiring.contains_key(&job.id))
            .enumerate()
            .map(|(position, job)| QueueRow {
                job_id: job.id.clone(),
                position: position as i64,
                priority: job.priority.to_i32(),
                paused: job.paused,
            })
            .collect()
    }

    /// Write changed job snapshots and the queue order.
    ///
    /// Skipped while paused for a full disk unless `force`d.
    async fn persist(&mut self, force: bool) {
        if !force && self.pause_reason == Some(PauseReason::DiskFull) {
            return;
        }
        for id in std::mem::take(&mut self.dirty) {
            let Some(job) = self.queue.get(&id) else {
                continue;
            };
            if job.is_deleted() || self.retiring.contains_key(&id) {
                continue;
            }
            if let Err(e) = self.store.save_job(job).await {
                error!(job_id = %id, error = %e, "failed to save job snapshot");
                self.dirty.insert(id);
            }
        }
        if self.queue_dirty {
            let rows = self.queue_rows();
            match self.store.save_queue(&rows).await {
                Ok(()) => self.queue_dirty = false,
                Err(e) => error!(error = %e, "failed to save queue order"),
            }
        }
    }

    async fn save_meter(&self) {
        if let Err(e) = self.store.set_kv(METER_KEY, self.meter.state()).await {
            warn!(error = %e, "failed to save traffic counters");
        }
    }

    /// Feed the assembler everything restored jobs had settled before the halt
    fn resume_assembly(&mut self) {
        let mut complete = Vec::new();
        let mut pending = Vec::new();
        for job in self.queue.iter() {
            if job.is_assembled() {
                complete.push(job.id.clone());
                continue;
            }
            for (index, file) in job.files.iter().enumerate() {
                if file.filename_checked && !file.assembled {
                    pending.push((job.id.clone(), index));
                }
            }
        }
        for (job, file) in pending {
            self.sync_file(&job, file, None);
        }
        for job in complete {
            self.end_of_job(&job);
        }
    }

    /// Graceful teardown, each stage bounded by the shutdown timeout
    async fn stop(&mut self) {
        let timeout = self.config.download.shutdown_timeout;
        info!("download engine stopping");

        // Step 1: stop fetches
        self.fetch_cancel.cancel();
        let mut fetches = std::mem::take(&mut self.fetches);
        let drained = tokio::time::timeout(timeout, async {
            while fetches.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("fetches did not stop in time, abandoning them");
        }

        // Step 2: stop decoders and the assembler
        self.decoder.shutdown(timeout).await;
        self.assembler.shutdown(timeout).await;

        // Step 3: articles still marked in flight are fetched again next run
        for job in self.queue.iter_mut() {
            for file in &mut job.files {
                for article in &mut file.articles {
                    article.fetcher = None;
                }
            }
        }

        // Step 4: spill the cache and write the admin state
        match self.cache.flush_all().await {
            Ok(spilled) => debug!(spilled, "article cache flushed"),
            Err(e) => error!(error = %e, "failed to flush article cache"),
        }
        let all: Vec<JobId> = self.queue.iter().map(|job| job.id.clone()).collect();
        self.dirty.extend(all);
        self.queue_dirty = true;
        self.persist(true).await;
        self.save_meter().await;

        // Step 5: close server connections
        self.servers.shutdown();

        self.emit(Event::Shutdown);
        info!("download engine stopped");
    }
}
