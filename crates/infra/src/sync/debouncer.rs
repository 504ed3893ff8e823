//! Event normalizer and debouncer.
//!
//! Batches from the change source land in a per-path buffer where later
//! events overwrite earlier ones, so a burst on one path collapses to its
//! final state. A quiet timer, restarted on every batch, flushes the buffer
//! into the job store; the store's supersedure rules absorb whatever is
//! already pending there.
//!
//! A (removed, added) pair with a matching inode inside one batch is folded
//! into a single MOVE carrying both remote paths. Unpaired halves stay a
//! DELETE and a CREATE/UPDATE.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pdsync_core::JobQueue;
use pdsync_domain::{ChangeKind, EventType, FileChange, NewJob, Result};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One buffered entry, keyed by absolute local path.
#[derive(Debug, Clone)]
enum Buffered {
    Change(FileChange),
    Move { change: FileChange, old_remote_path: String },
}

/// Collapses change bursts and feeds the job store.
pub struct Debouncer {
    jobs: Arc<dyn JobQueue>,
    remote_root: String,
    buffer: Mutex<HashMap<PathBuf, Buffered>>,
    activity: Notify,
    executor_wake: Arc<Notify>,
    debounce: Duration,
    dry_run: bool,
}

impl Debouncer {
    pub fn new(
        jobs: Arc<dyn JobQueue>,
        remote_root: String,
        executor_wake: Arc<Notify>,
        debounce: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            jobs,
            remote_root,
            buffer: Mutex::new(HashMap::new()),
            activity: Notify::new(),
            executor_wake,
            debounce,
            dry_run,
        }
    }

    /// Absorb one batch from the change source and restart the quiet timer.
    pub async fn ingest(&self, batch: Vec<FileChange>) {
        if batch.is_empty() {
            return;
        }

        let (moves, singles) = pair_moves(batch);

        let mut buffer = self.buffer.lock().await;
        for change in singles {
            let local = local_path(&change);
            buffer.insert(local, Buffered::Change(change));
        }
        for (removed, added) in moves {
            // The old path's buffered state is subsumed by the move.
            buffer.remove(&local_path(&removed));
            let old_remote_path = remote_path(&self.remote_root, &removed);
            buffer.insert(local_path(&added), Buffered::Move { change: added, old_remote_path });
        }
        drop(buffer);

        self.activity.notify_one();
    }

    /// Timer task: flush after a quiet period, drain on cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Graceful stop drains whatever is still buffered.
                    if let Err(err) = self.flush_now().await {
                        warn!(error = %err, "final debouncer flush failed");
                    }
                    debug!("debouncer stopped");
                    return;
                }
                _ = self.activity.notified() => {}
            }

            // A batch arrived; wait for the window to go quiet, restarting
            // on every further batch.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(err) = self.flush_now().await {
                            warn!(error = %err, "final debouncer flush failed");
                        }
                        debug!("debouncer stopped");
                        return;
                    }
                    _ = self.activity.notified() => continue,
                    _ = tokio::time::sleep(self.debounce) => {
                        if let Err(err) = self.flush_now().await {
                            warn!(error = %err, "debouncer flush failed");
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Flush the buffer into the job store. One-shot mode calls this
    /// directly instead of waiting for the timer.
    pub async fn flush_now(&self) -> Result<()> {
        let drained: Vec<(PathBuf, Buffered)> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain().collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut enqueued = 0_usize;
        for (local, buffered) in drained {
            let job = match buffered {
                Buffered::Change(change) => NewJob::new(
                    derive_event(&change),
                    local.to_string_lossy().into_owned(),
                    remote_path(&self.remote_root, &change),
                ),
                Buffered::Move { change, old_remote_path } => {
                    let mut job = NewJob::new(
                        EventType::Move,
                        local.to_string_lossy().into_owned(),
                        remote_path(&self.remote_root, &change),
                    );
                    job.old_remote_path = Some(old_remote_path);
                    job
                }
            };
            self.jobs.enqueue(&job, self.dry_run).await?;
            enqueued += 1;
        }

        info!(jobs = enqueued, "debouncer flushed");
        self.executor_wake.notify_one();
        Ok(())
    }
}

/// Fold (removed, added) pairs with matching inodes into moves.
fn pair_moves(batch: Vec<FileChange>) -> (Vec<(FileChange, FileChange)>, Vec<FileChange>) {
    let mut removed_by_inode: HashMap<u64, FileChange> = HashMap::new();
    let mut added: Vec<FileChange> = Vec::new();
    let mut singles: Vec<FileChange> = Vec::new();

    for change in batch {
        if !change.exists && change.inode != 0 {
            // Keep the first removal per inode; duplicates stay singles.
            match removed_by_inode.entry(change.inode) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(change);
                }
                std::collections::hash_map::Entry::Occupied(_) => singles.push(change),
            }
        } else if change.exists && change.inode != 0 {
            added.push(change);
        } else {
            singles.push(change);
        }
    }

    let mut moves = Vec::new();
    for change in added {
        match removed_by_inode.remove(&change.inode) {
            Some(removed) => moves.push((removed, change)),
            None => singles.push(change),
        }
    }
    // Unpaired removals remain plain deletes.
    singles.extend(removed_by_inode.into_values());

    (moves, singles)
}

fn derive_event(change: &FileChange) -> EventType {
    if !change.exists {
        EventType::Delete
    } else if change.kind == ChangeKind::Dir {
        EventType::Create
    } else {
        // Files normalize to UPDATE; upload handles the not-yet-exists case.
        EventType::Update
    }
}

fn local_path(change: &FileChange) -> PathBuf {
    change.watch_root.join(&change.relative_path)
}

/// `remote_root/base_name(watch_root)/relative_path`, slash-delimited with
/// no doubled slashes; an empty remote root is allowed.
fn remote_path(remote_root: &str, change: &FileChange) -> String {
    let base = change
        .watch_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_owned());

    let mut parts: Vec<&str> = Vec::new();
    let trimmed_root = remote_root.trim_matches('/');
    if !trimmed_root.is_empty() {
        parts.push(trimmed_root);
    }
    parts.push(&base);
    let trimmed_rel = change.relative_path.trim_matches('/');
    if !trimmed_rel.is_empty() {
        parts.push(trimmed_rel);
    }
    parts.join("/")
}
