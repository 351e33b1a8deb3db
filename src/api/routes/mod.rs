//! Route handlers for the control plane
//!
//! Handlers are organized by domain:
//! - [`queue`] - the queue and individual jobs
//! - [`system`] - engine state, servers, warnings and health
//! - [`history`] - finished and failed jobs

use crate::queue::{SortDirection, SortKey};
use crate::types::{JobId, JobStatus, Priority};
use serde::{Deserialize, Serialize};

mod history;
mod queue;
mod system;

pub use history::*;
pub use queue::*;
pub use system::*;

/// Query parameters for POST /queue
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AddJobQuery {
    /// Job name when the manifest has no title
    pub name: Option<String>,
    /// Category tag
    pub category: Option<String>,
    /// Priority (default: category default)
    pub priority: Option<Priority>,
    /// Archive password
    pub password: Option<String>,
    /// Add the job paused
    #[serde(default)]
    pub paused: bool,
    /// Run the availability pass first
    pub pre_check: Option<bool>,
}

/// Response for POST /queue
#[derive(Debug, Deserialize, Serialize)]
pub struct AddJobResponse {
    /// New job's id
    pub id: JobId,
}

/// Query parameters for DELETE /queue/:id
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DeleteJobQuery {
    /// Also delete the partially assembled files (default: false)
    #[serde(default)]
    pub del_files: bool,
}

/// Request body for PATCH /queue/:id/priority
#[derive(Debug, Deserialize, Serialize)]
pub struct SetPriorityRequest {
    /// New priority
    pub priority: Priority,
}

/// Request body for POST /queue/:id/move; exactly one of the fields
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MoveJobRequest {
    /// Target index in the queue
    pub index: Option<usize>,
    /// Job to move behind
    pub after: Option<JobId>,
}

/// New position of a moved job
#[derive(Debug, Deserialize, Serialize)]
pub struct PositionResponse {
    /// Index in the queue after the change
    pub position: usize,
}

/// Request body for POST /queue/:id/rename
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RenameJobRequest {
    /// New display name; blank is ignored
    pub name: Option<String>,
    /// Password to try on the job's archives
    pub password: Option<String>,
}

/// Request body for POST /queue/sort
#[derive(Debug, Deserialize, Serialize)]
pub struct SortQueueRequest {
    /// Sort key
    pub key: SortKey,
    /// Ascending unless given
    #[serde(default)]
    pub direction: SortDirection,
}

/// Request body for POST /queue/top-only
#[derive(Debug, Deserialize, Serialize)]
pub struct TopOnlyRequest {
    /// Restrict dispatch to the head job
    pub enabled: bool,
}

/// Request body for POST /queue/purge; no filter purges everything
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PurgeRequest {
    /// Case-insensitive name fragment
    pub name: Option<String>,
    /// Exact category
    pub category: Option<String>,
    /// Exact status
    pub status: Option<JobStatus>,
    /// Also delete partially assembled files
    #[serde(default)]
    pub del_files: bool,
}

/// Response for POST /queue/purge
#[derive(Debug, Deserialize, Serialize)]
pub struct PurgeResponse {
    /// Jobs that were deleted
    pub removed: Vec<JobId>,
}

/// Request body for PUT /speed-limit
#[derive(Debug, Deserialize, Serialize)]
pub struct SetSpeedLimitRequest {
    /// Bytes per second; null for unlimited
    pub limit_bps: Option<u64>,
}

/// Query parameters for GET /history
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HistoryQuery {
    /// Maximum number of items to return (default: 50)
    pub limit: Option<usize>,
    /// Number of items to skip (default: 0)
    pub offset: Option<usize>,
}
