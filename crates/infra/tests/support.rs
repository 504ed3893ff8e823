#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pdsync_core::{DriveClient, FlagStore, JobQueue};
use pdsync_domain::{ChangeKind, FileChange};
use pdsync_infra::database::{DbManager, SqliteFlagRepository, SqliteJobRepository};
use pdsync_infra::drive::MemoryDrive;
use pdsync_infra::sync::{Debouncer, Executor, ExecutorConfig, RemoteOps};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Temporary state database that stays alive for the duration of a test.
pub struct TestDatabase {
    pub manager: Arc<DbManager>,
    _temp_dir: TempDir,
}

impl TestDatabase {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir should be created");
        let db_path = temp_dir.path().join("state.db");

        let manager = Arc::new(DbManager::open(&db_path).expect("db manager should open"));
        manager.run_migrations().expect("migrations should apply");

        Self { manager, _temp_dir: temp_dir }
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully wired engine over the in-memory drive and a fresh store.
pub struct TestEngine {
    pub db: TestDatabase,
    pub jobs: Arc<SqliteJobRepository>,
    pub flags: Arc<SqliteFlagRepository>,
    pub drive: Arc<MemoryDrive>,
    pub debouncer: Arc<Debouncer>,
    pub executor: Arc<Executor>,
    pub wake: Arc<Notify>,
    /// Local directory standing in for the watch root.
    pub watch_dir: TempDir,
}

impl TestEngine {
    pub fn new(remote_root: &str) -> Self {
        let db = TestDatabase::new();
        let jobs = Arc::new(SqliteJobRepository::new(Arc::clone(&db.manager)));
        let flags = Arc::new(SqliteFlagRepository::new(Arc::clone(&db.manager)));
        let drive = Arc::new(MemoryDrive::new());
        let ops = Arc::new(RemoteOps::new(Arc::clone(&drive) as Arc<dyn DriveClient>));

        let wake = Arc::new(Notify::new());
        let debouncer = Arc::new(Debouncer::new(
            Arc::clone(&jobs) as Arc<dyn JobQueue>,
            remote_root.to_owned(),
            Arc::clone(&wake),
            Duration::from_millis(30),
            false,
        ));
        let executor = Arc::new(Executor::new(
            Arc::clone(&jobs) as Arc<dyn JobQueue>,
            Arc::clone(&flags) as Arc<dyn FlagStore>,
            ops,
            Arc::clone(&wake),
            ExecutorConfig {
                // Short sleeps keep retry-heavy scenarios fast.
                max_sleep: Duration::from_millis(50),
                paused_poll: Duration::from_millis(20),
                ..ExecutorConfig::default()
            },
            false,
        ));

        let watch_dir = TempDir::new().expect("watch dir should be created");

        Self { db, jobs, flags, drive, debouncer, executor, wake, watch_dir }
    }

    pub fn watch_root(&self) -> PathBuf {
        self.watch_dir.path().to_path_buf()
    }

    /// Base name of the watch root, i.e. the remote mirror folder name.
    pub fn mirror_name(&self) -> String {
        self.watch_root().file_name().unwrap().to_string_lossy().into_owned()
    }

    /// Create a file under the watch root and return its change record.
    pub fn write_local_file(&self, relative: &str, content: &[u8]) -> FileChange {
        let path = self.watch_root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dirs should be created");
        }
        std::fs::write(&path, content).expect("file should be written");
        self.change(relative, true, ChangeKind::File)
    }

    /// Create a directory under the watch root and return its change record.
    pub fn make_local_dir(&self, relative: &str) -> FileChange {
        std::fs::create_dir_all(self.watch_root().join(relative))
            .expect("dir should be created");
        self.change(relative, true, ChangeKind::Dir)
    }

    /// A change record for the given path as the change source would
    /// normalize it.
    pub fn change(&self, relative: &str, exists: bool, kind: ChangeKind) -> FileChange {
        let path = self.watch_root().join(relative);
        let meta = std::fs::metadata(&path).ok();
        FileChange {
            relative_path: relative.to_owned(),
            size: meta.as_ref().map(std::fs::Metadata::len).unwrap_or_default(),
            mtime_ms: 1_700_000_000_000,
            exists,
            kind,
            is_new: exists,
            inode: inode_of(&path).unwrap_or_default(),
            content_hash: None,
            watch_root: self.watch_root(),
        }
    }
}

#[cfg(unix)]
fn inode_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.ino())
}

#[cfg(not(unix))]
fn inode_of(_path: &Path) -> Option<u64> {
    None
}
