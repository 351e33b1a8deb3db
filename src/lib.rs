//! # usenet-engine
//!
//! Download and assembly engine for Usenet binaries.
//!
//! The engine takes NZB manifests, fetches their articles from one or more
//! NNTP servers over many concurrent connections, decodes them (yEnc and
//! uuencode), buffers them in a bounded cache and writes them into the
//! target files. Finished jobs are handed to a post-processing collaborator.
//!
//! - **Multi-server** - priority tiers, backup servers, per-article failover
//! - **Bounded** - memory cache with spill to disk and back-pressure to the network
//! - **Restartable** - queue and per-job state survive a restart
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_engine::{AddOptions, Config, ServerConfig, UsenetDownloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     let mut server = ServerConfig::new("news.example.com", 563);
//!     server.tls = true;
//!     server.username = Some("user".to_string());
//!     server.password = Some("pass".to_string());
//!     config.servers.push(server);
//!
//!     let downloader = UsenetDownloader::new(config).await?;
//!
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     downloader
//!         .add_nzb(std::path::Path::new("ubuntu.nzb"), AddOptions::default())
//!         .await?;
//!
//!     downloader.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// JSON control plane
pub mod api;
/// Archive inspection: encryption, cloaked archives, banned content
pub mod archive;
/// Writes decoded articles into target files
pub mod assembler;
/// Throughput meter and download quota
pub mod bpsmeter;
/// Bounded decoded-article cache
pub mod cache;
/// Configuration types and the runtime config bus
pub mod config;
/// Admin store: queue order, history, counters and job snapshots
pub mod db;
/// yEnc and uuencode decoding, decoder pool
pub mod decoder;
/// Engine root (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Jobs, files and articles
pub mod model;
/// NNTP sessions and error classification
pub mod nntp;
/// Hand-off to post-processing
pub mod postproc;
/// Job queue ordering
pub mod queue;
/// Exponential backoff with jitter
pub mod retry;
/// Server pools and selection
pub mod servers;
/// Bandwidth limiting with a token bucket
pub mod speed_limiter;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Operator-visible warnings
pub mod warnings;

// Re-export commonly used types
pub use archive::{ArchiveInspector, LocalArchiveInspector};
pub use assembler::{FileStore, LocalFileStore};
pub use config::{Config, ConfigBus, ConfigChange, ServerConfig};
pub use db::AdminStore;
pub use downloader::{AddOptions, Collaborators, UsenetDownloader};
pub use error::{
    ApiError, DatabaseError, DecodeError, Error, ErrorDetail, FetchError, JobError, Result,
    ToHttpStatus,
};
pub use model::PreQueueResult;
pub use postproc::{ChannelHandoff, FinishedJob, NoopHandoff, PostProcMessage, PostProcessorHandoff};
pub use queue::{PurgeSelector, SortDirection, SortKey};
pub use types::{
    EngineState, EngineStatus, Event, HistoryEntry, JobId, JobInfo, JobStatus, PauseReason,
    Priority, ServerStatus,
};
