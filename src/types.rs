//! Core types for usenet-engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque, stable job identifier
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(format!("job_{:016x}", rand::random::<u64>()))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Arena address of an article: `(job, file index, article index)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleId {
    /// Owning job
    pub job: JobId,
    /// Index of the file within the job
    pub file: usize,
    /// Index of the article within the file (declared order)
    pub article: usize,
}

impl ArticleId {
    /// Build an id from its parts
    pub fn new(job: JobId, file: usize, article: usize) -> Self {
        Self { job, file, article }
    }

    /// Stable per-job key used to name spill files in the admin directory
    pub fn spill_key(&self) -> String {
        format!("art_{:05}_{:06}", self.file, self.article)
    }
}

impl std::fmt::Display for ArticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.job, self.file, self.article)
    }
}

/// Server identity (the configured server name)
pub type ServerId = String;

/// Job priority
///
/// Scheduling levels run from [`Priority::Force`] down to [`Priority::Stop`].
/// [`Priority::Default`], [`Priority::Paused`] and [`Priority::Duplicate`] are
/// pseudo-levels: they are resolved at insertion time and never used as a rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Download ahead of everything, even when the engine is paused
    Force,
    /// Re-download for repair
    Repair,
    /// High priority
    High,
    /// Normal priority
    #[default]
    Normal,
    /// Low priority
    Low,
    /// Stays in the queue but is never dispatched
    Stop,
    /// Use the category default
    Default,
    /// Add the job paused
    Paused,
    /// Add the job flagged as duplicate (paused)
    Duplicate,
}

impl Priority {
    /// Scheduling rank (0 = most urgent). Pseudo-levels sort as Normal.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Force => 0,
            Priority::Repair => 1,
            Priority::High => 2,
            Priority::Normal | Priority::Default | Priority::Paused | Priority::Duplicate => 3,
            Priority::Low => 4,
            Priority::Stop => 5,
        }
    }

    /// True for the pseudo-levels that set job state instead of rank
    pub fn sets_state(self) -> bool {
        matches!(self, Priority::Paused | Priority::Duplicate)
    }

    /// True for the six real scheduling levels
    pub fn is_regular(self) -> bool {
        !matches!(
            self,
            Priority::Default | Priority::Paused | Priority::Duplicate
        )
    }

    /// Integer encoding used by the admin store
    pub fn to_i32(self) -> i32 {
        match self {
            Priority::Force => 2,
            Priority::Repair => 3,
            Priority::High => 1,
            Priority::Normal => 0,
            Priority::Low => -1,
            Priority::Paused => -2,
            Priority::Duplicate => -3,
            Priority::Stop => -4,
            Priority::Default => -100,
        }
    }

    /// Decode the admin store integer; unknown values fall back to Normal
    pub fn from_i32(value: i32) -> Self {
        match value {
            2 => Priority::Force,
            3 => Priority::Repair,
            1 => Priority::High,
            -1 => Priority::Low,
            -2 => Priority::Paused,
            -3 => Priority::Duplicate,
            -4 => Priority::Stop,
            -100 => Priority::Default,
            _ => Priority::Normal,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "force" => Ok(Priority::Force),
            "repair" => Ok(Priority::Repair),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "stop" => Ok(Priority::Stop),
            "default" => Ok(Priority::Default),
            "paused" => Ok(Priority::Paused),
            "duplicate" => Ok(Priority::Duplicate),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Downloader run state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Dispatching articles
    #[default]
    Running,
    /// Paused by the operator or an internal event (disk full, quota)
    Paused,
    /// Paused while post-processing runs (`pause_on_post_processing`)
    PostprocPaused,
}

/// Why the engine was paused internally
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Operator command
    Operator,
    /// Free space below the configured floor, or `ENOSPC` during assembly
    DiskFull,
    /// Download quota reached
    Quota,
    /// Decoder could not allocate
    OutOfMemory,
    /// Assembler hit a disk error other than `ENOSPC`
    DiskError,
}

/// Job status as seen by the control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a connection
    Queued,
    /// Articles in flight
    Downloading,
    /// Pre-check pass in progress
    Checking,
    /// Paused by the operator, by priority, or by policy
    Paused,
    /// All files assembled, handed to post-processing
    Finished,
    /// Aborted (hopeless, encryption, banned extension, disk error)
    Failed,
    /// Deleted by the operator
    Deleted,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Checking => "checking",
            JobStatus::Paused => "paused",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "downloading" => Ok(JobStatus::Downloading),
            "checking" => Ok(JobStatus::Checking),
            "paused" => Ok(JobStatus::Paused),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "deleted" => Ok(JobStatus::Deleted),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Storage area named in disk-space events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageArea {
    /// Where files are assembled
    Incomplete,
    /// Where post-processing moves finished output
    Complete,
}

/// Events published to collaborators
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job accepted into the queue
    JobAdded {
        /// Job ID
        id: JobId,
        /// Display name
        name: String,
    },

    /// A file of the job has been fully assembled
    FileAssembled {
        /// Job ID
        id: JobId,
        /// Final file name
        filename: String,
        /// Articles of this file that could not be fetched
        bad_articles: u32,
    },

    /// Every file assembled; the job goes to post-processing
    JobFinished {
        /// Job ID
        id: JobId,
        /// Display name
        name: String,
        /// Working directory handed to post-processing
        workdir: PathBuf,
        /// Articles that could not be fetched from any server
        bad_articles: u32,
    },

    /// Job moved to history as failed
    JobFailed {
        /// Job ID
        id: JobId,
        /// Reason recorded in history
        reason: String,
    },

    /// Job removed by the operator
    JobDeleted {
        /// Job ID
        id: JobId,
    },

    /// Job paused
    JobPaused {
        /// Job ID
        id: JobId,
        /// Why (operator, encrypted, unwanted extension)
        reason: String,
    },

    /// Job resumed
    JobResumed {
        /// Job ID
        id: JobId,
    },

    /// An archive needs a password that none of the known ones open
    Encrypted {
        /// Job ID
        id: JobId,
        /// Archive file name
        archive: String,
    },

    /// A banned extension was found inside an archive
    UnwantedExtension {
        /// Job ID
        id: JobId,
        /// Archive file name
        archive: String,
        /// Offending member
        member: String,
    },

    /// Server reported the article as removed (DMCA, cancel)
    ArticleRemoved {
        /// Article address
        article: ArticleId,
        /// Server that reported it
        server: ServerId,
    },

    /// Download quota reached; the engine pauses
    QuotaExceeded,

    /// Free space fell below the floor; the engine pauses
    DiskFull {
        /// Which area ran short
        area: StorageArea,
        /// Bytes required by the configured floor
        required_bytes: u64,
    },

    /// Server disabled (authentication rejected or operator)
    ServerDisabled {
        /// Server name
        server: ServerId,
        /// Why
        reason: String,
    },

    /// Engine state changed
    StateChanged {
        /// New state
        state: EngineState,
    },

    /// Engine is shutting down
    Shutdown,
}

/// Snapshot of one job for the control plane
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID
    pub id: JobId,
    /// Display name
    pub name: String,
    /// Category tag
    pub category: Option<String>,
    /// Scheduling priority
    pub priority: Priority,
    /// Status
    pub status: JobStatus,
    /// Position in the queue (0 = head)
    pub position: usize,
    /// Declared size in bytes
    pub size_bytes: u64,
    /// Bytes fetched so far
    pub downloaded_bytes: u64,
    /// Articles that could not be fetched from any server
    pub bad_articles: u32,
    /// Number of files
    pub files: usize,
    /// Files fully assembled
    pub files_done: usize,
    /// Encryption state: 0 = none, 1 = encrypted
    pub encrypted: u8,
    /// Flagged as duplicate at insertion
    pub duplicate: bool,
    /// Password confirmed against an archive of this job
    pub correct_password: Option<String>,
    /// When the job was added
    pub added_at: DateTime<Utc>,
}

/// Engine-wide status
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Run state
    pub state: EngineState,
    /// Reason for the current pause, when internally paused
    pub pause_reason: Option<PauseReason>,
    /// Decoder back-pressure active
    pub delayed: bool,
    /// Smoothed throughput
    pub speed_bps: u64,
    /// Bytes held in the article cache
    pub cache_used: u64,
    /// Article cache byte limit
    pub cache_limit: u64,
    /// Jobs in the queue
    pub jobs: usize,
    /// Articles currently dispatched
    pub in_flight: usize,
    /// Quota bytes left in the current period, when a quota is set
    pub quota_left: Option<u64>,
    /// Only the head job is eligible for dispatch
    pub top_only: bool,
}

/// Per-server status
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Server name
    pub name: ServerId,
    /// Enabled flag
    pub enabled: bool,
    /// Why the server is disabled, if it is
    pub disabled_reason: Option<String>,
    /// Open connections (idle + busy)
    pub open_connections: usize,
    /// Configured maximum
    pub max_connections: usize,
    /// Seconds until reconnects are allowed again
    pub backoff_secs: Option<u64>,
    /// Bytes received from this server
    pub bytes_total: u64,
}

/// One history record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Job ID
    pub id: JobId,
    /// Display name
    pub name: String,
    /// Category tag
    pub category: Option<String>,
    /// Final status (finished, failed, deleted)
    pub status: JobStatus,
    /// Failure reason
    pub fail_message: Option<String>,
    /// Bytes fetched
    pub downloaded_bytes: u64,
    /// Articles that could not be fetched
    pub bad_articles: u32,
    /// Working directory at completion
    pub workdir: PathBuf,
    /// When the record was written
    pub completed_at: DateTime<Utc>,
}
