//! SQLite-backed implementation of the job queue port.
//!
//! The queue owns sync-job rows for their whole lifecycle. Enqueue collapses
//! against an existing PENDING row on the same path (supersedure), the claim
//! path elects exactly one winner per row via a conditional status flip, and
//! the retry path computes the exponential backoff with jitter.

use std::sync::Arc;

use async_trait::async_trait;
use pdsync_core::JobQueue;
use pdsync_domain::constants::{RETRY_BASE_DELAY_MS, RETRY_JITTER_FACTOR, RETRY_MAX_DELAY_MS};
use pdsync_domain::{EventType, JobCounts, JobStatus, NewJob, Result, SyncError, SyncJob};
use rand::Rng;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use tokio::task;
use tracing::{debug, warn};

use super::manager::{map_join_error, map_sql_error, now_ms, DbManager};

/// SQLite-backed job repository.
pub struct SqliteJobRepository {
    db: Arc<DbManager>,
}

impl SqliteJobRepository {
    /// Construct a repository backed by the shared state database.
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
}

#[async_trait]
impl JobQueue for SqliteJobRepository {
    async fn enqueue(&self, job: &NewJob, dry_run: bool) -> Result<()> {
        if dry_run {
            debug!(local_path = %job.local_path, event = %job.event_type, "dry-run enqueue skipped");
            return Ok(());
        }
        let job = job.clone();
        self.run_blocking(move |conn| enqueue_job(conn, &job)).await
    }

    async fn claim_next_pending(&self) -> Result<Option<SyncJob>> {
        self.run_blocking(claim_next).await
    }

    async fn mark_synced(&self, id: i64, dry_run: bool) -> Result<()> {
        if dry_run {
            return Ok(());
        }
        self.run_blocking(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sync_jobs SET status = 'SYNCED', last_error = NULL
                     WHERE id = ?1 AND status = 'PROCESSING'",
                    params![id],
                )
                .map_err(map_sql_error)?;
            if changed == 0 {
                warn!(job_id = id, "mark_synced on a job that was not PROCESSING");
            }
            Ok(())
        })
        .await
    }

    async fn schedule_retry(
        &self,
        id: i64,
        n_retries: i64,
        error: &str,
        dry_run: bool,
    ) -> Result<()> {
        if dry_run {
            return Ok(());
        }
        let error = truncate_error(error);
        self.run_blocking(move |conn| {
            let retry_at = now_ms() + retry_delay_ms(n_retries);
            let changed = conn
                .execute(
                    "UPDATE sync_jobs
                     SET status = 'PENDING', retry_at = ?2, n_retries = ?3, last_error = ?4
                     WHERE id = ?1 AND status = 'PROCESSING'",
                    params![id, retry_at, n_retries + 1, error],
                )
                .map_err(map_sql_error)?;
            if changed == 0 {
                warn!(job_id = id, "schedule_retry on a job that was not PROCESSING");
            }
            Ok(())
        })
        .await
    }

    async fn mark_blocked(&self, id: i64, error: &str, dry_run: bool) -> Result<()> {
        if dry_run {
            return Ok(());
        }
        let error = truncate_error(error);
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE sync_jobs SET status = 'BLOCKED', last_error = ?2
                 WHERE id = ?1 AND status = 'PROCESSING'",
                params![id, error],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
    }

    async fn get_counts(&self) -> Result<JobCounts> {
        self.run_blocking(|conn| {
            let mut counts = JobCounts::default();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM sync_jobs GROUP BY status")
                .map_err(map_sql_error)?;
            let rows = stmt
                .query_map(params![], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(map_sql_error)?;
            for row in rows {
                let (status, n) = row.map_err(map_sql_error)?;
                match status.parse::<JobStatus>() {
                    Ok(JobStatus::Pending) => counts.pending = n,
                    Ok(JobStatus::Processing) => counts.processing = n,
                    Ok(JobStatus::Synced) => counts.synced = n,
                    Ok(JobStatus::Blocked) => counts.blocked = n,
                    Err(err) => warn!(raw_status = %status, error = %err, "unknown status in counts"),
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn list_recent_synced(&self, limit: usize) -> Result<Vec<SyncJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run_blocking(move |conn| {
            query_jobs(
                conn,
                &format!("{JOB_SELECT} WHERE status = 'SYNCED' ORDER BY id DESC LIMIT ?1"),
                params![limit],
            )
        })
        .await
    }

    async fn list_blocked(&self) -> Result<Vec<SyncJob>> {
        self.run_blocking(|conn| {
            query_jobs(conn, &format!("{JOB_SELECT} WHERE status = 'BLOCKED' ORDER BY id"), params![])
        })
        .await
    }

    async fn list_processing(&self) -> Result<Vec<SyncJob>> {
        self.run_blocking(|conn| {
            query_jobs(
                conn,
                &format!("{JOB_SELECT} WHERE status = 'PROCESSING' ORDER BY id"),
                params![],
            )
        })
        .await
    }

    async fn reset_processing_jobs(&self) -> Result<u64> {
        self.run_blocking(|conn| {
            let changed = conn
                .execute(
                    "UPDATE sync_jobs SET status = 'PENDING', retry_at = ?1
                     WHERE status = 'PROCESSING'",
                    params![now_ms()],
                )
                .map_err(map_sql_error)?;
            Ok(changed as u64)
        })
        .await
    }

    async fn next_retry_at(&self) -> Result<Option<i64>> {
        self.run_blocking(|conn| {
            conn.query_row(
                "SELECT MIN(retry_at) FROM sync_jobs WHERE status = 'PENDING'",
                params![],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(map_sql_error)
        })
        .await
    }
}

const JOB_SELECT: &str = "SELECT
        id, event_type, local_path, remote_path, old_remote_path,
        status, retry_at, n_retries, last_error, created_at
    FROM sync_jobs";

// ============================================================================
// Synchronous SQL helpers (invoked inside spawn_blocking)
// ============================================================================

fn enqueue_job(conn: &mut Connection, job: &NewJob) -> Result<()> {
    let now = now_ms();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sql_error)?;

    // MOVE never coalesces with non-MOVE on the same path.
    let existing = if job.event_type == EventType::Move {
        None
    } else {
        tx.query_row(
            "SELECT id, event_type FROM sync_jobs
             WHERE local_path = ?1 AND status = 'PENDING' AND event_type != 'MOVE'
             ORDER BY id LIMIT 1",
            params![job.local_path],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(map_sql_error(other)),
        })?
    };

    match existing {
        Some((id, raw)) => {
            let prior = raw.parse::<EventType>().map_err(SyncError::Database)?;
            let collapsed = collapse_events(prior, job.event_type);
            tx.execute(
                "UPDATE sync_jobs
                 SET event_type = ?2, remote_path = ?3, retry_at = ?4,
                     n_retries = 0, last_error = NULL
                 WHERE id = ?1",
                params![id, collapsed.to_string(), job.remote_path, now],
            )
            .map_err(map_sql_error)?;
            debug!(
                job_id = id,
                prior = %prior,
                incoming = %job.event_type,
                collapsed = %collapsed,
                "superseded pending job"
            );
        }
        None => {
            tx.execute(
                "INSERT INTO sync_jobs
                     (event_type, local_path, remote_path, old_remote_path,
                      status, retry_at, n_retries, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, 0, ?5)",
                params![
                    job.event_type.to_string(),
                    job.local_path,
                    job.remote_path,
                    job.old_remote_path,
                    now
                ],
            )
            .map_err(map_sql_error)?;
        }
    }

    tx.commit().map_err(map_sql_error)
}

/// The supersedure table applied when a new event lands on a path that
/// already has a PENDING job.
fn collapse_events(existing: EventType, incoming: EventType) -> EventType {
    use EventType::*;
    match (existing, incoming) {
        (Delete, Create | Update) => Update,
        (Create | Update, Delete) => Delete,
        (Create | Update, Create | Update) => Update,
        (Delete, Delete) => Delete,
        // MOVE rows are filtered out before this point.
        (_, incoming) => incoming,
    }
}

fn claim_next(conn: &mut Connection) -> Result<Option<SyncJob>> {
    let now = now_ms();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sql_error)?;

    let candidate = tx
        .query_row(
            &format!(
                "{JOB_SELECT} WHERE status = 'PENDING' AND retry_at <= ?1
                 ORDER BY retry_at, id LIMIT 1"
            ),
            params![now],
            map_job_row,
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(map_sql_error(other)),
        })?;

    let Some(mut job) = candidate else {
        return Ok(None);
    };

    // Conditional flip: only the caller whose update touched one row wins.
    let changed = tx
        .execute(
            "UPDATE sync_jobs SET status = 'PROCESSING' WHERE id = ?1 AND status = 'PENDING'",
            params![job.id],
        )
        .map_err(map_sql_error)?;
    tx.commit().map_err(map_sql_error)?;

    if changed == 1 {
        job.status = JobStatus::Processing;
        Ok(Some(job))
    } else {
        Ok(None)
    }
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<SyncJob>> {
    let mut stmt = conn.prepare(sql).map_err(map_sql_error)?;
    let rows = stmt.query_map(params, map_job_row).map_err(map_sql_error)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row.map_err(map_sql_error)?);
    }
    Ok(jobs)
}

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
    let id: i64 = row.get(0)?;
    let event_raw: String = row.get(1)?;
    let status_raw: String = row.get(5)?;

    Ok(SyncJob {
        id,
        event_type: parse_event_type(id, &event_raw),
        local_path: row.get(2)?,
        remote_path: row.get(3)?,
        old_remote_path: row.get(4)?,
        status: parse_status(id, &status_raw),
        retry_at: row.get(6)?,
        n_retries: row.get(7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn parse_status(id: i64, raw: &str) -> JobStatus {
    match raw.parse::<JobStatus>() {
        Ok(status) => status,
        Err(err) => {
            warn!(job_id = id, raw_status = %raw, error = %err, "invalid job status, defaulting to BLOCKED");
            JobStatus::Blocked
        }
    }
}

fn parse_event_type(id: i64, raw: &str) -> EventType {
    match raw.parse::<EventType>() {
        Ok(ty) => ty,
        Err(err) => {
            warn!(job_id = id, raw_event = %raw, error = %err, "invalid event type, defaulting to UPDATE");
            EventType::Update
        }
    }
}

/// Backoff before retry `n_retries + 1`: `min(BASE * 2^n, MAX)` plus a
/// uniform jitter in `[0, 0.5 * delay]`.
fn retry_delay_ms(n_retries: i64) -> i64 {
    let exponent = u32::try_from(n_retries.max(0)).unwrap_or(u32::MAX).min(30);
    let base = RETRY_BASE_DELAY_MS
        .saturating_mul(2_i64.saturating_pow(exponent))
        .clamp(RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS);
    let jitter_cap = (base as f64 * RETRY_JITTER_FACTOR) as i64;
    let jitter = if jitter_cap > 0 { rand::thread_rng().gen_range(0..=jitter_cap) } else { 0 };
    base + jitter
}

fn truncate_error(error: &str) -> String {
    const MAX_LEN: usize = 512;
    if error.len() <= MAX_LEN {
        return error.to_string();
    }
    let mut truncated = error.chars().take(MAX_LEN.saturating_sub(3)).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use pdsync_domain::constants::MAX_RETRIES;
    use tempfile::TempDir;

    use super::*;

    async fn setup() -> (SqliteJobRepository, Arc<DbManager>, TempDir) {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db_path = temp_dir.path().join("state.db");

        let manager = Arc::new(DbManager::open(&db_path).expect("manager created"));
        manager.run_migrations().expect("migrations applied");
        let repo = SqliteJobRepository::new(Arc::clone(&manager));

        (repo, manager, temp_dir)
    }

    fn update_job(path: &str) -> NewJob {
        NewJob::new(EventType::Update, format!("/watch{path}"), format!("root{path}"))
    }

    fn delete_job(path: &str) -> NewJob {
        NewJob::new(EventType::Delete, format!("/watch{path}"), format!("root{path}"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_then_claim_returns_the_job() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.expect("enqueue succeeds");

        let job = repo.claim_next_pending().await.expect("claim succeeds").expect("job present");
        assert_eq!(job.event_type, EventType::Update);
        assert_eq!(job.local_path, "/watch/a.txt");
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_update_keeps_a_single_pending_row() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();
        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();

        let counts = repo.get_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_supersedes_pending_update() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();
        repo.enqueue(&delete_job("/a.txt"), false).await.unwrap();

        let job = repo.claim_next_pending().await.unwrap().expect("job present");
        assert_eq!(job.event_type, EventType::Delete);
        assert_eq!(repo.get_counts().await.unwrap().pending, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_after_pending_delete_becomes_update_on_same_row() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&delete_job("/a.txt"), false).await.unwrap();
        let original = repo.claim_next_pending().await.unwrap().unwrap();
        // Put it back so the supersedure path sees a PENDING row again.
        repo.schedule_retry(original.id, 0, "transient", false).await.unwrap();

        let mut create = update_job("/a.txt");
        create.event_type = EventType::Create;
        repo.enqueue(&create, false).await.unwrap();

        let jobs = repo
            .run_blocking(|conn| {
                query_jobs(conn, &format!("{JOB_SELECT} WHERE status = 'PENDING'"), params![])
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, original.id, "supersedure keeps the original row id");
        assert_eq!(jobs[0].event_type, EventType::Update);
        assert_eq!(jobs[0].n_retries, 0, "retry bookkeeping resets on supersedure");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn move_does_not_coalesce_with_pending_update() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();
        let mut mv = NewJob::new(
            EventType::Move,
            "/watch/a.txt".into(),
            "root/b/a.txt".into(),
        );
        mv.old_remote_path = Some("root/a.txt".into());
        repo.enqueue(&mv, false).await.unwrap();

        assert_eq!(repo.get_counts().await.unwrap().pending, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn claim_orders_by_retry_at_then_id() {
        let (repo, mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/b.txt"), false).await.unwrap();
        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();

        // Push the first row's retry_at into the future.
        mgr.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_jobs SET retry_at = ?1 WHERE local_path = '/watch/b.txt'",
                params![now_ms() + 60_000],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .unwrap();

        let job = repo.claim_next_pending().await.unwrap().expect("eligible job");
        assert_eq!(job.local_path, "/watch/a.txt");
        assert!(repo.claim_next_pending().await.unwrap().is_none(), "future retry_at not eligible");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn schedule_retry_backs_off_within_bounds() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();
        let job = repo.claim_next_pending().await.unwrap().unwrap();

        let before = now_ms();
        repo.schedule_retry(job.id, 3, "network error", false).await.unwrap();

        let retry_at = repo.next_retry_at().await.unwrap().expect("pending row");
        let delay = retry_at - before;
        // 1s * 2^3 = 8s base, jitter up to 50%.
        assert!(delay >= 8_000, "delay {delay} below base");
        assert!(delay <= 12_500, "delay {delay} above base + jitter + slack");

        let counts = repo.get_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_delay_clips_at_the_cap() {
        for n in [9, 20, MAX_RETRIES] {
            let delay = retry_delay_ms(n);
            assert!(delay >= RETRY_MAX_DELAY_MS, "attempt {n}: {delay}");
            assert!(delay <= RETRY_MAX_DELAY_MS * 3 / 2, "attempt {n}: {delay}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_blocked_is_terminal() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();
        let job = repo.claim_next_pending().await.unwrap().unwrap();
        repo.mark_blocked(job.id, "NameConflict: a.txt", false).await.unwrap();

        assert!(repo.claim_next_pending().await.unwrap().is_none());
        let blocked = repo.list_blocked().await.unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].last_error.as_deref(), Some("NameConflict: a.txt"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_processing_recovers_crashed_jobs() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();
        let job = repo.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(repo.get_counts().await.unwrap().processing, 1);

        // Simulated restart: nothing marked the job, recovery resets it.
        let reset = repo.reset_processing_jobs().await.unwrap();
        assert_eq!(reset, 1);

        let recovered = repo.claim_next_pending().await.unwrap().expect("job eligible again");
        assert_eq!(recovered.id, job.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dry_run_writes_nothing() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), true).await.unwrap();
        assert_eq!(repo.get_counts().await.unwrap(), JobCounts::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_synced_clears_error_and_counts() {
        let (repo, _mgr, _dir) = setup().await;

        repo.enqueue(&update_job("/a.txt"), false).await.unwrap();
        let job = repo.claim_next_pending().await.unwrap().unwrap();
        repo.schedule_retry(job.id, 0, "blip", false).await.unwrap();

        // Make it immediately claimable again regardless of jitter.
        let _ = repo
            .run_blocking(move |conn| {
                conn.execute(
                    "UPDATE sync_jobs SET retry_at = ?1 WHERE id = ?2",
                    params![now_ms(), job.id],
                )
                .map_err(map_sql_error)?;
                Ok(())
            })
            .await
            .unwrap();

        let again = repo.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(again.n_retries, 1);
        assert_eq!(again.last_error.as_deref(), Some("blip"));

        repo.mark_synced(again.id, false).await.unwrap();
        let synced = repo.list_recent_synced(10).await.unwrap();
        assert_eq!(synced.len(), 1);
        assert!(synced[0].last_error.is_none());
    }
}
