//! Connection manager for the shared state database.
//!
//! One cleartext SQLite file (`state.db`) is shared by the daemon, the CLI
//! control commands, and the dashboard. Cross-process serialization comes
//! from SQLite itself (WAL journal plus a busy timeout); within the process
//! a mutex keeps the single connection to one user at a time. Callers run
//! their SQL inside `spawn_blocking` and never hold the connection across an
//! await.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pdsync_domain::{Result, SyncError};
use rusqlite::{params, Connection};
use tracing::info;

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Database manager owning the process's connection to `state.db`.
pub struct DbManager {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DbManager {
    /// Open (creating if needed) the state database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(map_sql_error)?;

        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(map_sql_error)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(map_sql_error)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(map_sql_error)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_sql_error)?;

        info!(db_path = %path.display(), "state database opened");

        Ok(Self { conn: Mutex::new(conn), path })
    }

    /// Ensure the full schema exists on the current database.
    pub fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA_SQL).map_err(map_sql_error)?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version, applied_at)
                 VALUES (?1, CAST(strftime('%s','now') AS INTEGER) * 1000)",
                params![SCHEMA_VERSION],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard =
            self.conn.lock().map_err(|_| SyncError::Internal("db mutex poisoned".into()))?;
        f(&mut guard)
    }

    /// Return the configured database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify the database is accessible and responding.
    pub fn health_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", params![], |row| row.get::<_, i32>(0))
                .map_err(map_sql_error)?;
            Ok(())
        })
    }
}

/// Millisecond Unix epoch, the timestamp unit of every stored row.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn map_sql_error(err: rusqlite::Error) -> SyncError {
    SyncError::Database(err.to_string())
}

pub(crate) fn map_join_error(err: tokio::task::JoinError) -> SyncError {
    if err.is_cancelled() {
        SyncError::Internal("blocking task cancelled".into())
    } else {
        SyncError::Internal(format!("blocking task panic: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn migrations_create_schema_version() {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db_path = temp_dir.path().join("state.db");

        let manager = DbManager::open(&db_path).expect("manager created");
        manager.run_migrations().expect("migrations run");

        let version: i32 = manager
            .with_conn(|conn| {
                conn.query_row("SELECT version FROM schema_version", params![], |row| row.get(0))
                    .map_err(map_sql_error)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn migrations_are_idempotent() {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db_path = temp_dir.path().join("state.db");

        let manager = DbManager::open(&db_path).expect("manager created");
        manager.run_migrations().expect("first run");
        manager.run_migrations().expect("second run");
        manager.health_check().expect("health check passed");
    }

    #[test]
    fn sibling_connection_sees_same_schema() {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db_path = temp_dir.path().join("state.db");

        let manager = DbManager::open(&db_path).expect("manager created");
        manager.run_migrations().expect("migrations run");

        // A second manager over the same file models a sibling process.
        let sibling = DbManager::open(&db_path).expect("sibling opened");
        sibling.health_check().expect("sibling healthy");
        let n: i64 = sibling
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sync_jobs", params![], |row| row.get(0))
                    .map_err(map_sql_error)
            })
            .unwrap();
        assert_eq!(n, 0);
    }
}
