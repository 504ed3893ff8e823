//! SQLite-backed clock store.
//!
//! One row per watch root holding the change source's opaque resumption
//! token. Writes are last-writer-wins; the adapter persists a clock only
//! after the whole batch it tags has been enqueued.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use pdsync_core::ClockStore;
use pdsync_domain::Result;
use rusqlite::params;
use tokio::task;
use tracing::debug;

use super::manager::{map_join_error, map_sql_error, DbManager};

/// SQLite-backed clock repository.
pub struct SqliteClockRepository {
    db: Arc<DbManager>,
}

impl SqliteClockRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ClockStore for SqliteClockRepository {
    async fn get(&self, watch_root: &Path) -> Result<Option<String>> {
        let db = Arc::clone(&self.db);
        let directory = directory_key(watch_root);

        task::spawn_blocking(move || {
            db.with_conn(|conn| {
                conn.query_row(
                    "SELECT clock FROM clocks WHERE directory = ?1",
                    params![directory],
                    |row| row.get::<_, String>(0),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(map_sql_error(other)),
                })
            })
        })
        .await
        .map_err(map_join_error)?
    }

    async fn set(&self, watch_root: &Path, clock: &str, dry_run: bool) -> Result<()> {
        if dry_run {
            debug!(directory = %watch_root.display(), clock, "dry-run clock write skipped");
            return Ok(());
        }

        let db = Arc::clone(&self.db);
        let directory = directory_key(watch_root);
        let clock = clock.to_owned();

        task::spawn_blocking(move || {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO clocks (directory, clock) VALUES (?1, ?2)
                     ON CONFLICT(directory) DO UPDATE SET clock = excluded.clock",
                    params![directory, clock],
                )
                .map_err(map_sql_error)?;
                Ok(())
            })
        })
        .await
        .map_err(map_join_error)?
    }
}

fn directory_key(watch_root: &Path) -> String {
    PathBuf::from(watch_root).to_string_lossy().into_owned()
}
