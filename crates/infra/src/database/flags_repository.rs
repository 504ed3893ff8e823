//! SQLite-backed flag store and cross-process signal bus.
//!
//! Flags are upserted rows keyed by name with an optional enumerated
//! variant. Signals are an append-only queue; consumption deletes exactly
//! one row inside a single statement, so at most one sibling process
//! observes a given signal.

use std::sync::Arc;

use async_trait::async_trait;
use pdsync_core::{FlagStore, SignalBus};
use pdsync_domain::{Flag, Result, Signal};
use rusqlite::{params, Connection};
use tokio::task;
use tracing::{info, warn};

use super::manager::{map_join_error, map_sql_error, now_ms, DbManager};

/// SQLite-backed flag and signal repository.
pub struct SqliteFlagRepository {
    db: Arc<DbManager>,
}

impl SqliteFlagRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || db.with_conn(f)).await.map_err(map_join_error)?
    }

    /// Claim the RUNNING flag for `pid`.
    ///
    /// Returns false when another live process already holds it. A RUNNING
    /// row whose recorded PID is dead is stale and gets reclaimed.
    pub async fn acquire_running(&self, pid: u32) -> Result<bool> {
        let holder = self.get_flag_data(Flag::Running).await?;
        if let Some(raw) = holder {
            match raw.parse::<u32>() {
                Ok(existing) if is_process_alive(existing) => {
                    warn!(existing_pid = existing, "RUNNING flag held by a live process");
                    return Ok(false);
                }
                Ok(existing) => {
                    warn!(stale_pid = existing, "reclaiming stale RUNNING flag");
                }
                Err(_) => {
                    warn!(raw_variant = %raw, "RUNNING flag holds a malformed pid, reclaiming");
                }
            }
        }

        self.set_flag(Flag::Running, Some(&pid.to_string())).await?;
        info!(pid, "RUNNING flag acquired");
        Ok(true)
    }

    /// Drop the RUNNING flag on clean shutdown.
    pub async fn release_running(&self) -> Result<()> {
        self.clear_flag(Flag::Running, None).await?;
        info!("RUNNING flag released");
        Ok(())
    }
}

#[async_trait]
impl FlagStore for SqliteFlagRepository {
    async fn set_flag(&self, flag: Flag, variant: Option<&str>) -> Result<()> {
        let name = flag.to_string();
        let variant = variant.map(str::to_owned);
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO flags (name, variant, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET variant = excluded.variant",
                params![name, variant, now_ms()],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
    }

    async fn clear_flag(&self, flag: Flag, variants: Option<&[&str]>) -> Result<()> {
        let name = flag.to_string();
        let variants: Option<Vec<String>> =
            variants.map(|vs| vs.iter().map(|v| (*v).to_owned()).collect());
        self.run_blocking(move |conn| {
            match variants {
                Some(allowed) => {
                    // Clear only when the stored variant is one of the given
                    // values; build the placeholder list by hand since the
                    // set is tiny.
                    let placeholders =
                        (0..allowed.len()).map(|i| format!("?{}", i + 2)).collect::<Vec<_>>();
                    let sql = format!(
                        "DELETE FROM flags WHERE name = ?1 AND variant IN ({})",
                        placeholders.join(", ")
                    );
                    let mut args: Vec<&dyn rusqlite::ToSql> = vec![&name];
                    for v in &allowed {
                        args.push(v);
                    }
                    conn.execute(&sql, args.as_slice()).map_err(map_sql_error)?;
                }
                None => {
                    conn.execute("DELETE FROM flags WHERE name = ?1", params![name])
                        .map_err(map_sql_error)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn has_flag(&self, flag: Flag) -> Result<bool> {
        let name = flag.to_string();
        self.run_blocking(move |conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM flags WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })
                .map_err(map_sql_error)?;
            Ok(n > 0)
        })
        .await
    }

    async fn get_flag_data(&self, flag: Flag) -> Result<Option<String>> {
        let name = flag.to_string();
        self.run_blocking(move |conn| {
            conn.query_row("SELECT variant FROM flags WHERE name = ?1", params![name], |row| {
                row.get::<_, Option<String>>(0)
            })
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(map_sql_error(other)),
            })
        })
        .await
    }
}

#[async_trait]
impl SignalBus for SqliteFlagRepository {
    async fn send_signal(&self, signal: Signal) -> Result<()> {
        let name = signal.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO signals (signal, created_at) VALUES (?1, ?2)",
                params![name, now_ms()],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
    }

    async fn peek_signal(&self, signal: Signal) -> Result<bool> {
        let name = signal.to_string();
        self.run_blocking(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM signals WHERE signal = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .map_err(map_sql_error)?;
            Ok(n > 0)
        })
        .await
    }

    async fn consume_signal(&self, signal: Signal) -> Result<bool> {
        let name = signal.to_string();
        self.run_blocking(move |conn| {
            // Single-statement delete of the oldest row: atomic across
            // sibling processes, so exactly one consumer wins.
            let changed = conn
                .execute(
                    "DELETE FROM signals WHERE id =
                         (SELECT id FROM signals WHERE signal = ?1 ORDER BY id LIMIT 1)",
                    params![name],
                )
                .map_err(map_sql_error)?;
            Ok(changed > 0)
        })
        .await
    }
}

/// Liveness probe for the PID recorded in the RUNNING flag.
#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    std::path::Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(target_os = "macos")]
pub fn is_process_alive(pid: u32) -> bool {
    use std::process::Command;

    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn is_process_alive(pid: u32) -> bool {
    warn!(pid, "process liveness check unsupported on this platform");
    false
}
