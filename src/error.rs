//! Error types for usenet-engine
//!
//! Two families live here:
//! - the crate-wide [`Error`] returned by public operations, with HTTP status mapping
//!   for the control plane
//! - tagged stage results ([`FetchError`], [`DecodeError`]) that travel between the
//!   fetcher, decoder, and scheduling loop instead of being raised across tasks

use crate::decoder::Decoded;
use crate::types::JobId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for usenet-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "cache_limit")
        key: Option<String>,
    },

    /// Admin store operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Job-related error
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Invalid or empty manifest
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Named resource (server, history entry) not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress, the engine no longer accepts commands
    #[error("shutdown in progress: not accepting commands")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Not enough free space in a storage area
    #[error("insufficient disk space in {dir}: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Directory that ran short
        dir: PathBuf,
        /// Number of bytes required
        required: u64,
        /// Number of bytes currently available
        available: u64,
    },

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Admin store errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Snapshot file could not be read or written
    #[error("snapshot error for {path}: {reason}")]
    Snapshot {
        /// Snapshot path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },
}

/// Job-related errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found in the queue
    #[error("job {id} not found")]
    NotFound {
        /// The job that was not found
        id: JobId,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} job {id} in state {current_state}")]
    InvalidState {
        /// The job in an invalid state for the operation
        id: JobId,
        /// The operation that was attempted (e.g., "pause", "move")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Target index or anchor job for a move is invalid
    #[error("invalid move target for job {id}: {reason}")]
    InvalidMove {
        /// The job being moved
        id: JobId,
        /// Why the move target was rejected
        reason: String,
    },
}

/// Outcome of a failed fetch on one connection
///
/// The scheduling loop interprets these: only [`FetchError::TransportFailure`] kills
/// the connection, only [`FetchError::AuthRejected`] disables the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// `430`/`423`/`411`: the article is not on this server
    #[error("article not found on server")]
    NotFoundHere,

    /// Removal text (DMCA, cancel) in the response
    #[error("article removed: {0}")]
    Removed(String),

    /// Socket error, timeout, or protocol desync
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// `481`/`482` on authentication
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
}

/// Outcome of a failed decode
#[derive(Debug, Error)]
pub enum DecodeError {
    /// CRC absent or mismatched; bytes are kept for external repair
    #[error("CRC mismatch (expected {expected:?}, computed {computed:08x})")]
    BadData {
        /// Decoded payload despite the bad CRC
        decoded: Box<Decoded>,
        /// Declared CRC, if the trailer carried one
        expected: Option<u32>,
        /// CRC of the decoded bytes
        computed: u32,
    },

    /// Neither encoding could frame the body
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Allocation for the decoded payload failed
    #[error("out of memory while decoding")]
    OutOfMemory,

    /// Headers indicate the article is gone (pre-check inspection)
    #[error("article not available: {0}")]
    NotAvailable(String),
}

/// API error response format
///
/// ```json
/// {
///   "error": {
///     "code": "job_not_found",
///     "message": "job error: job job_1 not found",
///     "details": { "job_id": "job_1" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::InvalidNzb(_) => 422,

            Error::NotFound(_) => 404,
            Error::Job(JobError::NotFound { .. }) => 404,

            Error::Job(JobError::InvalidState { .. }) => 409,
            Error::Job(JobError::InvalidMove { .. }) => 400,

            Error::InsufficientSpace { .. } => 507,

            Error::Database(_)
            | Error::Sqlx(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::ApiServerError(_)
            | Error::Other(_) => 500,


            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Job(e) => match e {
                JobError::NotFound { .. } => "job_not_found",
                JobError::InvalidState { .. } => "invalid_state",
                JobError::InvalidMove { .. } => "invalid_move",
            },
            Error::InvalidNzb(_) => "invalid_nzb",
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Serialization(_) => "serialization_error",
            Error::InsufficientSpace { .. } => "insufficient_space",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Job(JobError::NotFound { id }) => Some(serde_json::json!({ "job_id": id })),
            Error::Job(JobError::InvalidState {
                id,
                operation,
                current_state,
            }) => Some(serde_json::json!({
                "job_id": id,
                "operation": operation,
                "current_state": current_state,
            })),
            Error::InsufficientSpace {
                dir,
                required,
                available,
            } => Some(serde_json::json!({
                "dir": dir,
                "required_bytes": required,
                "available_bytes": available,
            })),
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({ "key": key })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}

impl Error {
    /// Shorthand for a missing job
    pub fn job_not_found(id: &JobId) -> Self {
        Error::Job(JobError::NotFound { id: id.clone() })
    }

    /// True when the underlying cause is a full disk (`ENOSPC`)
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Error::Io(e) if crate::utils::is_disk_full(e))
    }
}
