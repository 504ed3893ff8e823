//! Error types used throughout the daemon
//!
//! The remote-facing kinds carry the retry policy the executor applies: a
//! kind is either retryable with backoff, retryable once (auth), or terminal
//! for the job (BLOCKED).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the sync daemon
#[derive(Error, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    NetworkTransient(String),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Name conflict: {0}")]
    NameConflict(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Decryption failure: {0}")]
    DecryptionFailure(String),

    #[error("Local I/O error: {0}")]
    LocalIo(String),

    #[error("Change source unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Categories driving the executor's retry decision for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry with exponential backoff until the attempt cap.
    Backoff,
    /// One retry is allowed (credential refresh happens inside the drive
    /// client); a second failure blocks the job.
    OnceAfterReauth,
    /// No automatic retry; the job becomes BLOCKED and waits for an operator.
    Terminal,
}

impl SyncError {
    /// Retry policy for this error when it fails a sync job.
    ///
    /// `NotFound` is terminal here; the executor special-cases it for DELETE
    /// jobs (a vanished target means the delete already happened).
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::NetworkTransient(_)
            | Self::LocalIo(_)
            | Self::ServiceUnavailable(_)
            | Self::Database(_)
            | Self::UploadFailed(_)
            | Self::Internal(_) => RetryPolicy::Backoff,
            Self::AuthExpired(_) => RetryPolicy::OnceAfterReauth,
            Self::NotFound(_)
            | Self::NameConflict(_)
            | Self::QuotaExceeded(_)
            | Self::DecryptionFailure(_)
            | Self::Config(_)
            | Self::InvalidInput(_) => RetryPolicy::Terminal,
        }
    }

    /// Stable label suitable for metrics and the `last_error` column.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Database(_) => "Database",
            Self::Config(_) => "Config",
            Self::NetworkTransient(_) => "NetworkTransient",
            Self::AuthExpired(_) => "AuthExpired",
            Self::NotFound(_) => "NotFound",
            Self::NameConflict(_) => "NameConflict",
            Self::QuotaExceeded(_) => "QuotaExceeded",
            Self::DecryptionFailure(_) => "DecryptionFailure",
            Self::LocalIo(_) => "LocalIo",
            Self::ServiceUnavailable(_) => "ServiceUnavailable",
            Self::UploadFailed(_) => "UploadFailed",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Internal(_) => "Internal",
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::LocalIo(err.to_string())
    }
}
