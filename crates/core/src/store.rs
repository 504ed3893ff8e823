//! Port interfaces for the shared state store.
//!
//! Every durable structure lives in one SQLite file shared with sibling
//! processes (CLI control commands, the dashboard). Implementations keep
//! transactions short; callers never hold a connection across an await.
//!
//! Mutators accept a `dry_run` flag; when set they validate and return
//! without writing, so a dry run performs no durable mutation anywhere in
//! the engine.

use std::path::Path;

use async_trait::async_trait;
use pdsync_domain::{Flag, JobCounts, NewJob, Result, Signal, SyncJob};

/// Durable queue of sync jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a PENDING job, collapsing against an existing PENDING job on
    /// the same local path (supersedure).
    async fn enqueue(&self, job: &NewJob, dry_run: bool) -> Result<()>;

    /// Claim the eligible PENDING job with the smallest `retry_at` (ties by
    /// id) by flipping it to PROCESSING. At most one caller wins a given row.
    async fn claim_next_pending(&self) -> Result<Option<SyncJob>>;

    /// PROCESSING → SYNCED; clears `last_error`.
    async fn mark_synced(&self, id: i64, dry_run: bool) -> Result<()>;

    /// PROCESSING → PENDING with backoff; increments `n_retries` and stores
    /// the error.
    async fn schedule_retry(&self, id: i64, n_retries: i64, error: &str, dry_run: bool)
        -> Result<()>;

    /// PROCESSING → BLOCKED; the job waits for operator action.
    async fn mark_blocked(&self, id: i64, error: &str, dry_run: bool) -> Result<()>;

    async fn get_counts(&self) -> Result<JobCounts>;

    async fn list_recent_synced(&self, limit: usize) -> Result<Vec<SyncJob>>;
    async fn list_blocked(&self) -> Result<Vec<SyncJob>>;
    async fn list_processing(&self) -> Result<Vec<SyncJob>>;

    /// Crash recovery: every PROCESSING row becomes PENDING with
    /// `retry_at = now`. Returns the number of rows reset.
    async fn reset_processing_jobs(&self) -> Result<u64>;

    /// Smallest `retry_at` among PENDING rows, for the executor's sleep.
    async fn next_retry_at(&self) -> Result<Option<i64>>;
}

/// Per-watch-root resumption tokens from the change source.
#[async_trait]
pub trait ClockStore: Send + Sync {
    async fn get(&self, watch_root: &Path) -> Result<Option<String>>;

    /// Last-writer-wins upsert.
    async fn set(&self, watch_root: &Path, clock: &str, dry_run: bool) -> Result<()>;
}

/// Process-wide flags observable by sibling processes.
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn set_flag(&self, flag: Flag, variant: Option<&str>) -> Result<()>;

    /// Clear the flag. When `variants` is given, only clear if the stored
    /// variant is one of them.
    async fn clear_flag(&self, flag: Flag, variants: Option<&[&str]>) -> Result<()>;

    async fn has_flag(&self, flag: Flag) -> Result<bool>;

    async fn get_flag_data(&self, flag: Flag) -> Result<Option<String>>;
}

/// Cross-process signal queue with exactly-one-consumer delivery.
#[async_trait]
pub trait SignalBus: Send + Sync {
    async fn send_signal(&self, signal: Signal) -> Result<()>;

    /// Non-destructive check.
    async fn peek_signal(&self, signal: Signal) -> Result<bool>;

    /// Atomically take one queued signal; returns false when none was
    /// present or a sibling consumed it first.
    async fn consume_signal(&self, signal: Signal) -> Result<bool>;
}
