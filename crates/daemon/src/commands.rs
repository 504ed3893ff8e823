//! Control subcommands: sibling processes of the daemon.
//!
//! Each command opens its own connection to the shared store, writes a
//! signal or reads state, and exits. The daemon observes signals on its
//! next poll tick.

use std::sync::Arc;

use pdsync_core::{FlagStore, JobQueue, SignalBus};
use pdsync_domain::{constants::STATE_DB_FILE, state_dir, Flag, Result, Signal, SyncError};
use pdsync_infra::database::{DbManager, SqliteFlagRepository, SqliteJobRepository};

fn open_store() -> Result<Arc<DbManager>> {
    let db_path = state_dir().join(STATE_DB_FILE);
    if !db_path.exists() {
        return Err(SyncError::Config(format!(
            "no state database at {}; has the daemon ever run?",
            db_path.display()
        )));
    }
    let db = DbManager::open(&db_path)?;
    db.run_migrations()?;
    Ok(Arc::new(db))
}

async fn send(signal: Signal) -> Result<()> {
    let bus = SqliteFlagRepository::new(open_store()?);
    bus.send_signal(signal).await?;
    println!("sent {signal}");
    Ok(())
}

pub async fn pause() -> Result<()> {
    send(Signal::PauseSync).await
}

pub async fn resume() -> Result<()> {
    send(Signal::ResumeSync).await
}

pub async fn stop() -> Result<()> {
    send(Signal::Stop).await
}

pub async fn status() -> Result<()> {
    let db = open_store()?;
    let flags = SqliteFlagRepository::new(Arc::clone(&db));
    let jobs = SqliteJobRepository::new(db);

    let running = match flags.get_flag_data(Flag::Running).await? {
        Some(pid) => format!("running (pid {pid})"),
        None => "stopped".to_owned(),
    };
    let paused = flags.has_flag(Flag::Paused).await?;
    let counts = jobs.get_counts().await?;

    println!("daemon:     {running}{}", if paused { ", paused" } else { "" });
    println!("pending:    {}", counts.pending);
    println!("processing: {}", counts.processing);
    println!("synced:     {}", counts.synced);
    println!("blocked:    {}", counts.blocked);

    let blocked = jobs.list_blocked().await?;
    for job in blocked {
        println!(
            "  blocked #{} {} {} ({})",
            job.id,
            job.event_type,
            job.remote_path,
            job.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
