//! Download engine, split into focused submodules.
//!
//! [`UsenetDownloader`] is a cheap handle. The queue, the server pools, the
//! decoder pool and the assembler all belong to one scheduling task; handles
//! talk to it over a command channel and get an answer per command.
//! - [`nzb`] - manifest parsing and job intake
//! - [`control`] - operator commands and queries
//! - [`lifecycle`] - startup restore and shutdown
//! - [`engine`] - the scheduling loop and its event handlers

mod command;
mod control;
mod engine;
mod lifecycle;
mod nzb;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use nzb::{AddOptions, Manifest, parse_manifest};

use crate::archive::{ArchiveInspector, LocalArchiveInspector};
use crate::assembler::{FileStore, LocalFileStore};
use crate::cache::ArticleCache;
use crate::config::{Config, ConfigBus};
use crate::db::AdminStore;
use crate::error::{Error, Result};
use crate::postproc::{NoopHandoff, PostProcessorHandoff};
use crate::types::Event;
use crate::warnings::Warnings;
use command::{Command, Reply};
use engine::{Engine, EngineParts};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the engine talks to outside the download path
#[derive(Clone)]
pub struct Collaborators {
    /// Receives recovery sets and finished jobs
    pub handoff: Arc<dyn PostProcessorHandoff>,
    /// Target file access for the assembler
    pub files: Arc<dyn FileStore>,
    /// Archive listing for encryption and banned-content checks
    pub archives: Arc<dyn ArchiveInspector>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            handoff: Arc::new(NoopHandoff),
            files: Arc::new(LocalFileStore),
            archives: Arc::new(LocalArchiveInspector),
        }
    }
}

/// Main entry point for the download engine
#[derive(Clone)]
pub struct UsenetDownloader {
    /// Admin store: queue order, job snapshots, history, counters
    pub(crate) store: Arc<AdminStore>,
    /// Decoded article cache (shared with the decoder and assembler)
    pub(crate) cache: Arc<ArticleCache>,
    /// Configuration the engine was started with
    pub(crate) config: Arc<Config>,
    /// Event broadcast channel
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Operator-visible warnings
    pub(crate) warnings: Arc<Warnings>,
    /// Runtime configuration changes
    pub(crate) bus: ConfigBus,
    commands: mpsc::UnboundedSender<Command>,
    /// Cleared once shutdown starts
    accepting: Arc<AtomicBool>,
    cancel: CancellationToken,
    engine: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl UsenetDownloader {
    /// Create a downloader with the default collaborators.
    ///
    /// Creates the storage areas, opens the admin store, restores the queue
    /// left by the previous run and starts the scheduling task.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use usenet_engine::{Config, ServerConfig, UsenetDownloader};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut config = Config::default();
    /// config.servers.push(ServerConfig::new("news.example.com", 119));
    /// let downloader = UsenetDownloader::new(config).await?;
    /// downloader.shutdown().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::default()).await
    }

    /// Create a downloader with custom collaborators
    pub async fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let download = &config.download;
        for dir in [&download.incomplete_dir, &download.complete_dir, &download.admin_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create directory {}: {}", dir.display(), e),
                ))
            })?;
        }

        let store = Arc::new(
            AdminStore::open(&config.persistence.database_path, &download.admin_dir).await?,
        );
        let cache = Arc::new(ArticleCache::new(
            config.cache.effective_limit(),
            download.admin_dir.clone(),
        ));
        let warnings = Arc::new(Warnings::new());
        let (event_tx, _rx) = broadcast::channel(1000);
        let bus = ConfigBus::new();
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let restored = lifecycle::restore_jobs(&store, &cache, &warnings).await?;
        let meter = lifecycle::restore_meter(&store).await;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (engine, inbox) = Engine::new(EngineParts {
            config: Arc::clone(&config),
            store: Arc::clone(&store),
            cache: Arc::clone(&cache),
            events: event_tx.clone(),
            warnings: Arc::clone(&warnings),
            config_rx: bus.on_change(),
            commands: command_rx,
            collaborators,
            cancel: cancel.clone(),
            restored,
            meter,
        })?;
        let handle = tokio::spawn(engine.run(inbox));

        Ok(Self {
            store,
            cache,
            config,
            event_tx,
            warnings,
            bus,
            commands,
            accepting: Arc::new(AtomicBool::new(true)),
            cancel,
            engine: Arc::new(std::sync::Mutex::new(Some(handle))),
        })
    }

    /// Subscribe to engine events.
    ///
    /// Each subscriber gets its own copy of every event sent after it
    /// subscribed. A subscriber that falls more than 1000 events behind loses
    /// the oldest ones (`RecvError::Lagged`).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use usenet_engine::{Config, Event, UsenetDownloader};
    /// # async fn example(downloader: UsenetDownloader) {
    /// let mut events = downloader.subscribe();
    /// while let Ok(event) = events.recv().await {
    ///     if let Event::JobFinished { name, .. } = event {
    ///         println!("{name} is ready");
    ///     }
    /// }
    /// # }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Configuration the engine was started with
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Runtime configuration bus; changes published here reach the engine
    pub fn config_bus(&self) -> &ConfigBus {
        &self.bus
    }

    /// Token cancelled when shutdown starts
    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send a command to the engine and wait for its answer
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::ShuttingDown)?;
        answer.await.map_err(|_| Error::ShuttingDown)?
    }
}
