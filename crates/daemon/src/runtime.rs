//! Daemon wiring and lifecycle.
//!
//! Everything is cooperatively scheduled on the tokio runtime: one task for
//! the change-source reader, one for the debounce timer, one for the
//! executor loop, one for the control-plane poller. Cross-task state flows
//! through the shared store, never through shared memory.

use std::sync::Arc;
use std::time::Duration;

use pdsync_core::{ClockStore, DriveClient, FlagStore, JobQueue};
use pdsync_domain::constants::{GRACEFUL_STOP_TIMEOUT_SECS, STATE_DB_FILE};
use pdsync_domain::{state_dir, Config, Flag, Result, SyncError, WatchmanLifecycle};
use pdsync_infra::config as config_loader;
use pdsync_infra::database::{
    DbManager, SqliteClockRepository, SqliteFlagRepository, SqliteJobRepository,
};
use pdsync_infra::drive::MemoryDrive;
use pdsync_infra::sync::{ControlPlane, Debouncer, Executor, ExecutorConfig, RemoteOps};
use pdsync_infra::watchman::{discover_socket, ChangeSourceAdapter, WatchmanClient};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the daemon until a stop signal, SIGINT, or (with `once`) queue drain.
pub async fn run(dry_run: bool, once: bool) -> Result<()> {
    let config = config_loader::load()?;
    info!(
        sync_dirs = config.sync_dirs.len(),
        remote_root = %config.remote_root,
        dry_run,
        once,
        "daemon starting"
    );

    let state = state_dir();
    std::fs::create_dir_all(&state)
        .map_err(|err| SyncError::Config(format!("cannot create {}: {err}", state.display())))?;

    let db = Arc::new(DbManager::open(state.join(STATE_DB_FILE))?);
    db.run_migrations()?;

    let flags = Arc::new(SqliteFlagRepository::new(Arc::clone(&db)));
    let jobs = Arc::new(SqliteJobRepository::new(Arc::clone(&db)));
    let clocks = Arc::new(SqliteClockRepository::new(Arc::clone(&db)));

    let control = Arc::new(ControlPlane::new(Arc::clone(&flags), CancellationToken::new()));
    control.startup().await?;

    // Crash recovery: jobs stranded mid-flight by a previous run become
    // eligible again.
    let recovered = jobs.reset_processing_jobs().await?;
    if recovered > 0 {
        info!(jobs = recovered, "recovered in-flight jobs from previous run");
    }

    let result = run_engine(&config, dry_run, once, &flags, &jobs, &clocks, &control).await;

    control.shutdown_cleanup().await;
    match &result {
        Ok(()) => info!("daemon exited cleanly"),
        Err(err) => warn!(error = %err, "daemon exiting after failure"),
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_engine(
    config: &Config,
    dry_run: bool,
    once: bool,
    flags: &Arc<SqliteFlagRepository>,
    jobs: &Arc<SqliteJobRepository>,
    clocks: &Arc<SqliteClockRepository>,
    control: &Arc<ControlPlane>,
) -> Result<()> {
    // The drive client is a per-process capability; the in-memory backend
    // stands in until a vendor client is wired by the embedder.
    let drive: Arc<dyn DriveClient> = Arc::new(MemoryDrive::new());
    let ops = Arc::new(RemoteOps::new(drive));

    let wake = Arc::new(Notify::new());
    let debouncer = Arc::new(Debouncer::new(
        Arc::clone(jobs) as Arc<dyn JobQueue>,
        config.remote_root.clone(),
        Arc::clone(&wake),
        Duration::from_millis(config.sync.debounce_ms),
        dry_run,
    ));
    let executor = Arc::new(Executor::new(
        Arc::clone(jobs) as Arc<dyn JobQueue>,
        Arc::clone(flags) as Arc<dyn FlagStore>,
        ops,
        wake,
        ExecutorConfig { max_retries: config.sync.max_retries, ..ExecutorConfig::default() },
        dry_run,
    ));

    // Change source: connect, record how we found the service.
    let (socket, lifecycle) = discover_socket().await?;
    flags.set_flag(Flag::WatchmanRunning, Some(&lifecycle.to_string())).await?;

    let (event_tx, event_rx) = mpsc::channel(64);
    let client = Arc::new(WatchmanClient::connect(&socket, event_tx).await?);
    let version = client.version().await?;
    info!(version = %version, "change source connected");

    let adapter = Arc::new(ChangeSourceAdapter::new(
        client,
        Arc::clone(clocks) as Arc<dyn ClockStore>,
        Arc::clone(&debouncer),
        dry_run,
    ));

    let roots: Vec<_> = config.sync_dirs.iter().map(|d| d.source_path.clone()).collect();

    if once {
        adapter.run_once(&roots).await?;
        executor.process_all_pending().await?;
        adapter.teardown(lifecycle).await;
        cleanup_watchman_flag(flags, lifecycle).await;
        return Ok(());
    }

    for root in &roots {
        adapter.subscribe_root(root).await?;
    }

    let shutdown = control.shutdown_token();

    let mut event_task = {
        let adapter = Arc::clone(&adapter);
        let cancel = shutdown.clone();
        tokio::spawn(async move { adapter.handle_events(event_rx, cancel).await })
    };
    let debounce_task = {
        let debouncer = Arc::clone(&debouncer);
        let cancel = shutdown.clone();
        tokio::spawn(async move { debouncer.run(cancel).await })
    };
    let executor_task = {
        let executor = Arc::clone(&executor);
        let cancel = shutdown.clone();
        tokio::spawn(async move { executor.run(cancel).await })
    };
    let control_task = {
        let control = Arc::clone(control);
        let cancel = shutdown.clone();
        tokio::spawn(async move { control.run(cancel).await })
    };

    // SIGINT behaves like a stop signal.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, beginning graceful shutdown");
                shutdown.cancel();
            }
        });
    }

    // A dead change-source stream is fatal: exit non-zero so the service
    // manager restarts the daemon with a fresh connection.
    let mut stream_died = false;
    let mut event_task_done = false;
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = &mut event_task => {
            event_task_done = true;
            if !shutdown.is_cancelled() {
                warn!("change-source stream ended unexpectedly");
                stream_died = true;
                shutdown.cancel();
            }
        }
    }
    if !event_task_done {
        let _ = event_task.await;
    }

    // Graceful stop: intake stops first, the debouncer drains into the
    // store on cancellation, and the executor gets a bounded window to
    // finish its current job. Jobs still PROCESSING past the deadline are
    // reset to PENDING by crash recovery on the next start.
    let _ = debounce_task.await;
    let deadline = Duration::from_secs(GRACEFUL_STOP_TIMEOUT_SECS);
    let mut executor_task = executor_task;
    if tokio::time::timeout(deadline, &mut executor_task).await.is_err() {
        warn!(timeout_secs = GRACEFUL_STOP_TIMEOUT_SECS, "abandoning in-flight upload");
        executor.upload_abort_token().cancel();
        let _ = executor_task.await;
    }
    let _ = control_task.await;

    adapter.teardown(lifecycle).await;
    cleanup_watchman_flag(flags, lifecycle).await;

    if stream_died {
        return Err(SyncError::ServiceUnavailable("change source connection lost".into()));
    }
    Ok(())
}

async fn cleanup_watchman_flag(flags: &Arc<SqliteFlagRepository>, lifecycle: WatchmanLifecycle) {
    // Clear only the record this daemon made; a variant written by a newer
    // sibling stays.
    let variant = lifecycle.to_string();
    if let Err(err) = flags.clear_flag(Flag::WatchmanRunning, Some(&[variant.as_str()])).await {
        warn!(error = %err, "could not clear WATCHMAN_RUNNING flag");
    }
}
