//! The executor loop.
//!
//! A single cooperative loop that claims eligible jobs and dispatches them
//! to the remote operations. Fairness is the store's `retry_at` + id
//! ordering; there is no per-path locking because the queue keeps at most
//! one PENDING job per path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pdsync_core::{FlagStore, JobQueue};
use pdsync_domain::constants::{EXECUTOR_MAX_SLEEP_MS, MAX_RETRIES, PAUSED_POLL_MS};
use pdsync_domain::{EventType, Flag, Result, RetryPolicy, SyncError, SyncJob};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::remote_ops::RemoteOps;
use crate::database::manager::now_ms;

/// Configuration for the executor loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempt cap before a job is blocked.
    pub max_retries: i64,
    /// Upper bound on an idle sleep.
    pub max_sleep: Duration,
    /// Re-check interval while paused.
    pub paused_poll: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            max_sleep: Duration::from_millis(EXECUTOR_MAX_SLEEP_MS),
            paused_poll: Duration::from_millis(PAUSED_POLL_MS),
        }
    }
}

/// Pulls ready jobs and reconciles the remote tree.
pub struct Executor {
    jobs: Arc<dyn JobQueue>,
    flags: Arc<dyn FlagStore>,
    ops: Arc<RemoteOps>,
    wake: Arc<Notify>,
    config: ExecutorConfig,
    dry_run: bool,
    /// Fired past the graceful-stop deadline; abandons in-flight uploads.
    upload_abort: CancellationToken,
}

impl Executor {
    pub fn new(
        jobs: Arc<dyn JobQueue>,
        flags: Arc<dyn FlagStore>,
        ops: Arc<RemoteOps>,
        wake: Arc<Notify>,
        config: ExecutorConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            jobs,
            flags,
            ops,
            wake,
            config,
            dry_run,
            upload_abort: CancellationToken::new(),
        }
    }

    /// Token that abandons the in-flight upload when cancelled. The current
    /// job otherwise runs to completion even during shutdown.
    pub fn upload_abort_token(&self) -> CancellationToken {
        self.upload_abort.clone()
    }

    /// Run until cancelled. On cancellation the current job is finished
    /// first; the caller bounds that wait with the graceful-stop deadline.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        info!("executor started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.paused().await {
                Ok(true) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.paused_poll) => continue,
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    error!(error = %err, "cannot read PAUSED flag");
                }
            }

            match self.jobs.claim_next_pending().await {
                Ok(Some(job)) => {
                    self.handle_job(job).await;
                    // Re-run immediately; more work may be eligible.
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "claim failed");
                }
            }

            let sleep = self.idle_sleep().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("executor stopped");
    }

    /// Drain the queue: return once no PENDING or PROCESSING rows remain.
    /// Retried jobs are waited for, blocked jobs are not.
    pub async fn process_all_pending(&self) -> Result<()> {
        loop {
            if let Some(job) = self.jobs.claim_next_pending().await? {
                self.handle_job(job).await;
                continue;
            }
            let counts = self.jobs.get_counts().await?;
            if counts.pending == 0 && counts.processing == 0 {
                return Ok(());
            }
            tokio::time::sleep(self.idle_sleep().await).await;
        }
    }

    async fn paused(&self) -> Result<bool> {
        self.flags.has_flag(Flag::Paused).await
    }

    async fn idle_sleep(&self) -> Duration {
        let max = self.config.max_sleep;
        match self.jobs.next_retry_at().await {
            Ok(Some(retry_at)) => {
                let wait_ms = retry_at.saturating_sub(now_ms()).max(0) as u64;
                Duration::from_millis(wait_ms).min(max)
            }
            Ok(None) => max,
            Err(err) => {
                warn!(error = %err, "cannot read next retry time");
                max
            }
        }
    }

    async fn handle_job(&self, job: SyncJob) {
        debug!(
            job_id = job.id,
            event = %job.event_type,
            remote_path = %job.remote_path,
            attempt = job.n_retries,
            "dispatching job"
        );

        match self.dispatch(&job).await {
            Ok(()) => {
                if let Err(err) = self.jobs.mark_synced(job.id, self.dry_run).await {
                    error!(job_id = job.id, error = %err, "mark_synced failed");
                }
            }
            Err(err) => self.handle_failure(&job, err).await,
        }
    }

    async fn dispatch(&self, job: &SyncJob) -> Result<()> {
        if self.dry_run {
            info!(job_id = job.id, event = %job.event_type, "dry-run: remote call skipped");
            return Ok(());
        }

        match job.event_type {
            EventType::Delete => {
                let existed = self.ops.remove(&job.remote_path, false).await?;
                if !existed {
                    debug!(job_id = job.id, "delete target already absent");
                }
                Ok(())
            }
            EventType::Create => {
                self.ops.create_folder_path(&job.remote_path).await?;
                Ok(())
            }
            EventType::Update => {
                // A directory can surface as UPDATE after supersedure; folder
                // creation is the idempotent equivalent.
                if Path::new(&job.local_path).is_dir() {
                    self.ops.create_folder_path(&job.remote_path).await?;
                } else {
                    self.ops
                        .upload_file(
                            Path::new(&job.local_path),
                            &job.remote_path,
                            Some(self.upload_abort.child_token()),
                        )
                        .await?;
                }
                Ok(())
            }
            EventType::Move => {
                let old = job.old_remote_path.as_deref().ok_or_else(|| {
                    SyncError::InvalidInput(format!("MOVE job {} lacks a source path", job.id))
                })?;
                self.ops.move_node(old, &job.remote_path).await
            }
        }
    }

    async fn handle_failure(&self, job: &SyncJob, err: SyncError) {
        let reason = format!("{}: {err}", err.label());
        let block = match err.retry_policy() {
            RetryPolicy::Terminal => true,
            RetryPolicy::OnceAfterReauth => job.n_retries >= 1,
            RetryPolicy::Backoff => job.n_retries >= self.config.max_retries,
        };

        if block {
            warn!(job_id = job.id, attempts = job.n_retries, error = %reason, "job blocked");
            if let Err(mark_err) = self.jobs.mark_blocked(job.id, &reason, self.dry_run).await {
                error!(job_id = job.id, error = %mark_err, "mark_blocked failed");
            }
        } else {
            debug!(job_id = job.id, attempt = job.n_retries, error = %reason, "scheduling retry");
            if let Err(mark_err) =
                self.jobs.schedule_retry(job.id, job.n_retries, &reason, self.dry_run).await
            {
                error!(job_id = job.id, error = %mark_err, "schedule_retry failed");
            }
        }
    }
}
