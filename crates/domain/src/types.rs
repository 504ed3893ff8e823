//! Common data types used throughout the daemon

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of remote mutation a sync job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Create,
    Update,
    Delete,
    Move,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Move => "MOVE",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "MOVE" => Ok(Self::Move),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// Lifecycle state of a persisted sync job.
///
/// `PENDING → PROCESSING → {SYNCED | PENDING (retry) | BLOCKED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Processing,
    Synced,
    Blocked,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Synced => "SYNCED",
            Self::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SYNCED" => Ok(Self::Synced),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted unit of intended remote mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub event_type: EventType,
    /// Absolute local path the event was observed on.
    pub local_path: String,
    /// Slash-delimited path rooted at the configured remote-root prefix.
    pub remote_path: String,
    /// Source path of a MOVE; None for every other event type.
    pub old_remote_path: Option<String>,
    pub status: JobStatus,
    /// Millisecond epoch at or after which the job is eligible to run.
    pub retry_at: i64,
    pub n_retries: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Fields the enqueue path needs; the store assigns the rest.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub event_type: EventType,
    pub local_path: String,
    pub remote_path: String,
    pub old_remote_path: Option<String>,
}

impl NewJob {
    pub fn new(event_type: EventType, local_path: String, remote_path: String) -> Self {
        Self { event_type, local_path, remote_path, old_remote_path: None }
    }
}

/// Aggregate job counts for the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: i64,
    pub processing: i64,
    pub synced: i64,
    pub blocked: i64,
}

/// Whether a changed path is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    File,
    Dir,
}

/// A normalized record from the change source.
#[derive(Debug, Clone)]
pub struct FileChange {
    /// Path relative to the watch root, slash-delimited.
    pub relative_path: String,
    pub size: u64,
    pub mtime_ms: i64,
    pub exists: bool,
    pub kind: ChangeKind,
    pub is_new: bool,
    pub inode: u64,
    /// SHA-1 of the content when the change source computed it; absent for
    /// directories.
    pub content_hash: Option<String>,
    /// The canonicalized watch root the change belongs to.
    pub watch_root: PathBuf,
}

/// Cross-process control signals, stored as rows in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    PauseSync,
    ResumeSync,
    Stop,
    RefreshDashboard,
}

impl Signal {
    pub const ALL: [Signal; 4] =
        [Self::PauseSync, Self::ResumeSync, Self::Stop, Self::RefreshDashboard];
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PauseSync => "pause-sync",
            Self::ResumeSync => "resume-sync",
            Self::Stop => "stop",
            Self::RefreshDashboard => "refresh-dashboard",
        };
        f.write_str(s)
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause-sync" => Ok(Self::PauseSync),
            "resume-sync" => Ok(Self::ResumeSync),
            "stop" => Ok(Self::Stop),
            "refresh-dashboard" => Ok(Self::RefreshDashboard),
            other => Err(format!("unknown signal: {other}")),
        }
    }
}

/// Process-wide status flags visible to sibling processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Running,
    Paused,
    ServiceInstalled,
    WatchmanRunning,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::ServiceInstalled => "SERVICE_INSTALLED",
            Self::WatchmanRunning => "WATCHMAN_RUNNING",
        };
        f.write_str(s)
    }
}

/// Variant recorded with the WATCHMAN_RUNNING flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchmanLifecycle {
    /// The daemon started the service and owns its shutdown.
    Spawned,
    /// The service predated the daemon and is left alone on exit.
    Existing,
}

impl fmt::Display for WatchmanLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawned => "SPAWNED",
            Self::Existing => "EXISTING",
        };
        f.write_str(s)
    }
}

impl FromStr for WatchmanLifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SPAWNED" => Ok(Self::Spawned),
            "EXISTING" => Ok(Self::Existing),
            other => Err(format!("unknown watchman lifecycle: {other}")),
        }
    }
}
