//! Configuration types for usenet-engine
//!
//! Configuration is a plain value struct. Runtime changes go through
//! [`ConfigBus`], which broadcasts typed [`ConfigChange`] events to whoever
//! registered with [`ConfigBus::on_change`].

use crate::error::{Error, Result};
use crate::types::{Priority, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

/// Download engine behavior: directories, retry policy, back-pressure
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Where files are assembled (default: "./incomplete")
    #[serde(default = "default_incomplete_dir")]
    pub incomplete_dir: PathBuf,

    /// Where post-processing moves finished output (default: "./complete")
    #[serde(default = "default_complete_dir")]
    pub complete_dir: PathBuf,

    /// Root for per-job admin directories (default: "./admin")
    #[serde(default = "default_admin_dir")]
    pub admin_dir: PathBuf,

    /// Tries of one article on one server before that server goes on the try-list
    #[serde(default = "default_max_art_tries")]
    pub max_art_tries: u32,

    /// Abort a job once the unfetchable bytes make completion impossible
    #[serde(default = "default_true")]
    pub fail_hopeless_jobs: bool,

    /// Fraction of the job size that may be unfetchable before the job is hopeless
    #[serde(default = "default_hopeless_fraction")]
    pub hopeless_fraction: f64,

    /// Re-queue an article on another server when its CRC does not match
    #[serde(default = "default_true")]
    pub fail_on_crc: bool,

    /// Run an availability pass before downloading
    #[serde(default)]
    pub pre_check: bool,

    /// Minimum free bytes in the incomplete area (0 = no check)
    #[serde(default)]
    pub download_free: u64,

    /// Minimum free bytes in the complete area (0 = no check)
    #[serde(default)]
    pub complete_free: u64,

    /// Only the head job is eligible for dispatch
    #[serde(default)]
    pub top_only: bool,

    /// Do not start jobs posted less than this many minutes ago
    #[serde(default)]
    pub propagation_delay: u64,

    /// Pause downloading while post-processing runs
    #[serde(default)]
    pub pause_on_post_processing: bool,

    /// Post-processing extracts archives while the job is still downloading
    #[serde(default)]
    pub direct_unpack: bool,

    /// Bandwidth limit in bytes per second (None = unlimited)
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,

    /// Decoder worker count (default: CPU count, at least 2)
    #[serde(default = "default_decoder_workers")]
    pub decoder_workers: usize,

    /// Decoder queue length at which dispatch is suspended
    #[serde(default = "default_decoder_high_water")]
    pub decoder_high_water: usize,

    /// Decoder queue length at which dispatch resumes
    #[serde(default = "default_decoder_low_water")]
    pub decoder_low_water: usize,

    /// Bound on each worker join during shutdown (default: 3 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            incomplete_dir: default_incomplete_dir(),
            complete_dir: default_complete_dir(),
            admin_dir: default_admin_dir(),
            max_art_tries: default_max_art_tries(),
            fail_hopeless_jobs: true,
            hopeless_fraction: default_hopeless_fraction(),
            fail_on_crc: true,
            pre_check: false,
            download_free: 0,
            complete_free: 0,
            top_only: false,
            propagation_delay: 0,
            pause_on_post_processing: false,
            direct_unpack: false,
            bandwidth_limit: None,
            decoder_workers: default_decoder_workers(),
            decoder_high_water: default_decoder_high_water(),
            decoder_low_water: default_decoder_low_water(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Article cache budget
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for decoded articles held in memory; negative means platform max
    #[serde(default = "default_cache_limit")]
    pub cache_limit: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_limit: default_cache_limit(),
        }
    }
}

impl CacheConfig {
    /// Largest cache this platform allows
    pub const PLATFORM_MAX: u64 = if cfg!(target_pointer_width = "64") {
        4 * 1024 * 1024 * 1024
    } else {
        1024 * 1024 * 1024
    };

    /// Resolve the configured value into a byte limit
    pub fn effective_limit(&self) -> u64 {
        Self::resolve(self.cache_limit)
    }

    /// Resolve a raw `cache_limit` value
    pub fn resolve(raw: i64) -> u64 {
        if raw < 0 {
            Self::PLATFORM_MAX
        } else {
            (raw as u64).min(Self::PLATFORM_MAX)
        }
    }
}

/// What to do when an archive check trips
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveAction {
    /// Ignore (`0`)
    #[default]
    Off,
    /// Pause the job and wait for the operator (`1`)
    Pause,
    /// Abort the job to history (`2`)
    Abort,
}

impl ArchiveAction {
    /// Decode the numeric option value (`0`, `1`, `2`)
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ArchiveAction::Pause,
            2 => ArchiveAction::Abort,
            _ => ArchiveAction::Off,
        }
    }
}

/// Encrypted and banned-content detection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Policy for archives no known password opens
    #[serde(default)]
    pub pause_on_pwrar: ArchiveAction,

    /// Policy for archives containing a banned extension
    #[serde(default)]
    pub action_on_unwanted_extensions: ArchiveAction,

    /// Banned extensions, without the dot (case-insensitive)
    #[serde(default = "default_unwanted_extensions")]
    pub unwanted_extensions: Vec<String>,

    /// Passwords tried on every encrypted archive, after the job's own
    #[serde(default)]
    pub passwords: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            pause_on_pwrar: ArchiveAction::default(),
            action_on_unwanted_extensions: ArchiveAction::default(),
            unwanted_extensions: default_unwanted_extensions(),
            passwords: Vec::new(),
        }
    }
}

/// Quota accounting period
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    /// Resets every day at midnight (UTC)
    Day,
    /// Resets on `reset_day` of the week (1 = Monday)
    Week,
    /// Resets on `reset_day` of the month
    #[default]
    Month,
}

/// Download quota
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Bytes allowed per period (None = no quota)
    #[serde(default)]
    pub size: Option<u64>,

    /// Accounting period
    #[serde(default)]
    pub period: QuotaPeriod,

    /// Reset day within the period (weekday 1-7 or day of month 1-28)
    #[serde(default = "default_reset_day")]
    pub reset_day: u32,

    /// Resume automatically when a new period starts
    #[serde(default = "default_true")]
    pub resume: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            size: None,
            period: QuotaPeriod::default(),
            reset_day: default_reset_day(),
            resume: true,
        }
    }
}

/// Certificate verification mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslVerify {
    /// Accept any certificate
    Off,
    /// Accept any certificate; the NNTP client has no chain-only mode
    Minimal,
    /// Verify chain and hostname
    #[default]
    Strict,
}

/// Reconnect backoff for a server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay after a connection dies (default: 5 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Cap (default: 300 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier per consecutive failure (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// News server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique name (default: "host:port")
    #[serde(default)]
    pub name: String,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for plain, 563 for TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use implicit TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Certificate verification
    #[serde(default)]
    pub ssl_verify: SslVerify,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Max concurrent connections
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Priority rank (lower = preferred)
    #[serde(default)]
    pub priority: i32,

    /// Only used once every primary lacks the article
    #[serde(default)]
    pub backup: bool,

    /// Article retention in days (0 = unlimited)
    #[serde(default)]
    pub retention_days: u32,

    /// Enabled flag
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Socket timeout (default: 60 seconds)
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl ServerConfig {
    /// Plain server with defaults, handy for tests and examples
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            name: String::new(),
            host: host.into(),
            port,
            tls: false,
            ssl_verify: SslVerify::default(),
            username: None,
            password: None,
            connections: default_connections(),
            priority: 0,
            backup: false,
            retention_days: 0,
            enabled: true,
            timeout: default_timeout(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Name used as the server identity
    pub fn id(&self) -> ServerId {
        if self.name.is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            self.name.clone()
        }
    }
}

// Conversion from our ServerConfig to nntp-rs's ServerConfig
impl From<&ServerConfig> for nntp_rs::ServerConfig {
    fn from(config: &ServerConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: config.ssl_verify != SslVerify::Strict,
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
        }
    }
}

/// Category configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Default priority for jobs of this category
    #[serde(default = "default_category_priority")]
    pub priority: Priority,

    /// Override of the complete directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Admin database path (default: "./admin.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Category configurations
    #[serde(default)]
    pub categories: HashMap<String, CategoryConfig>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            categories: HashMap::new(),
        }
    }
}

/// Control plane configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:6790)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
        }
    }
}

/// Main configuration
///
/// `download`, `cache` and `archive` are flattened so their options sit at the
/// top level of the serialized form (`cache_limit`, `pre_check`, `pause_on_pwrar`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// News servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Download engine behavior
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Article cache budget
    #[serde(flatten)]
    pub cache: CacheConfig,

    /// Encrypted and banned-content detection
    #[serde(flatten)]
    pub archive: ArchiveConfig,

    /// Download quota
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Admin store and categories
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Control plane
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for server in &self.servers {
            if server.host.is_empty() {
                return Err(Error::Config {
                    message: "server host must not be empty".into(),
                    key: Some("servers.host".into()),
                });
            }
            if server.connections == 0 {
                return Err(Error::Config {
                    message: format!("server {} needs at least one connection", server.id()),
                    key: Some("servers.connections".into()),
                });
            }
            if !names.insert(server.id()) {
                return Err(Error::Config {
                    message: format!("duplicate server name {}", server.id()),
                    key: Some("servers.name".into()),
                });
            }
        }
        if self.download.decoder_workers < 2 {
            return Err(Error::Config {
                message: "decoder pool needs at least two workers".into(),
                key: Some("decoder_workers".into()),
            });
        }
        if self.download.decoder_low_water >= self.download.decoder_high_water {
            return Err(Error::Config {
                message: "decoder_low_water must be below decoder_high_water".into(),
                key: Some("decoder_low_water".into()),
            });
        }
        if !(0.0..=1.0).contains(&self.download.hopeless_fraction) {
            return Err(Error::Config {
                message: "hopeless_fraction must be within 0.0..=1.0".into(),
                key: Some("hopeless_fraction".into()),
            });
        }
        Ok(())
    }

    /// Default priority of a category (`Priority::Default` when unset or unknown)
    pub fn category_priority(&self, category: Option<&str>) -> Priority {
        category
            .and_then(|c| self.persistence.categories.get(c))
            .map(|c| c.priority)
            .unwrap_or(Priority::Default)
    }
}

/// Runtime configuration change
#[derive(Clone, Debug)]
pub enum ConfigChange {
    /// New cache limit (raw option value)
    CacheLimit(i64),
    /// Top-only toggled
    TopOnly(bool),
    /// Server added or reconfigured
    Server(Box<ServerConfig>),
    /// Server removed
    ServerRemoved(ServerId),
    /// Bandwidth limit changed
    BandwidthLimit(Option<u64>),
}

/// Typed change bus for configuration items
#[derive(Clone, Debug)]
pub struct ConfigBus {
    tx: broadcast::Sender<ConfigChange>,
}

impl Default for ConfigBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBus {
    /// Create a bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Register for changes
    pub fn on_change(&self) -> broadcast::Receiver<ConfigChange> {
        self.tx.subscribe()
    }

    /// Publish a change; returns how many listeners saw it
    pub fn publish(&self, change: ConfigChange) -> usize {
        self.tx.send(change).unwrap_or(0)
    }
}

fn default_incomplete_dir() -> PathBuf {
    PathBuf::from("incomplete")
}

fn default_complete_dir() -> PathBuf {
    PathBuf::from("complete")
}

fn default_admin_dir() -> PathBuf {
    PathBuf::from("admin")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("admin.db")
}

fn default_true() -> bool {
    true
}

fn default_max_art_tries() -> u32 {
    3
}

fn default_hopeless_fraction() -> f64 {
    0.2
}

fn default_decoder_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 16)
}

fn default_decoder_high_water() -> usize {
    32
}

fn default_decoder_low_water() -> usize {
    8
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_cache_limit() -> i64 {
    512 * 1024 * 1024
}

fn default_unwanted_extensions() -> Vec<String> {
    ["exe", "com", "scr", "bat", "cmd", "vbs", "lnk"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_reset_day() -> u32 {
    1
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_port() -> u16 {
    563
}

fn default_connections() -> usize {
    8
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_category_priority() -> Priority {
    Priority::Default
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6790))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
