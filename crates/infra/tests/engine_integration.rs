//! End-to-end engine scenarios: debouncer → job store → executor → drive.

#[path = "support.rs"]
mod support;

use pdsync_core::{JobQueue, NodeKind};
use pdsync_domain::{ChangeKind, EventType, JobStatus, SyncError};
use support::TestEngine;

#[tokio::test(flavor = "multi_thread")]
async fn fresh_first_run_mirrors_the_tree() {
    let engine = TestEngine::new("");
    let mirror = engine.mirror_name();

    let changes = vec![
        engine.write_local_file("a.txt", b"ten bytes."),
        engine.make_local_dir("dir"),
        engine.write_local_file("dir/b.txt", b"twenty bytes exactly"),
    ];
    engine.debouncer.ingest(changes).await;
    engine.debouncer.flush_now().await.unwrap();

    engine.executor.process_all_pending().await.unwrap();

    let counts = engine.jobs.get_counts().await.unwrap();
    assert_eq!(counts.synced, 3);
    assert_eq!(counts.pending + counts.processing + counts.blocked, 0);

    let dir = engine.drive.node_at_path(&format!("{mirror}/dir")).expect("dir mirrored");
    assert_eq!(dir.kind, NodeKind::Folder);

    let a = engine.drive.node_at_path(&format!("{mirror}/a.txt")).expect("a.txt mirrored");
    assert_eq!(a.size, Some(10));

    let b = engine.drive.node_at_path(&format!("{mirror}/dir/b.txt")).expect("b.txt mirrored");
    assert_eq!(b.size, Some(20));
}

#[tokio::test(flavor = "multi_thread")]
async fn modify_then_delete_in_one_window_never_uploads() {
    let engine = TestEngine::new("");

    // Write and delete inside the same debounce window.
    let write = engine.write_local_file("x.txt", b"five!");
    engine.debouncer.ingest(vec![write]).await;
    std::fs::remove_file(engine.watch_root().join("x.txt")).unwrap();
    engine.debouncer.ingest(vec![engine.change("x.txt", false, ChangeKind::File)]).await;
    engine.debouncer.flush_now().await.unwrap();

    let counts = engine.jobs.get_counts().await.unwrap();
    assert_eq!(counts.pending, 1, "one coalesced job");

    engine.executor.process_all_pending().await.unwrap();

    let synced = engine.jobs.list_recent_synced(10).await.unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].event_type, EventType::Delete);
    assert_eq!(synced[0].status, JobStatus::Synced);

    assert_eq!(engine.drive.node_count(), 0, "no upload was ever issued");
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_upload_failure_retries_then_succeeds() {
    let engine = TestEngine::new("");
    let mirror = engine.mirror_name();

    engine
        .drive
        .fail_next_upload("big.bin", SyncError::NetworkTransient("connection reset".into()));

    let change = engine.write_local_file("big.bin", &[7_u8; 1024]);
    engine.debouncer.ingest(vec![change]).await;
    engine.debouncer.flush_now().await.unwrap();

    engine.executor.process_all_pending().await.unwrap();

    let synced = engine.jobs.list_recent_synced(10).await.unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].n_retries, 1, "exactly one retry");
    assert_eq!(synced[0].status, JobStatus::Synced);

    let node = engine.drive.node_at_path(&format!("{mirror}/big.bin")).expect("uploaded");
    assert_eq!(node.size, Some(1024));
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_delay_waits_out_the_backoff() {
    let engine = TestEngine::new("");

    engine.drive.fail_next_upload("slow.txt", SyncError::NetworkTransient("timeout".into()));

    let change = engine.write_local_file("slow.txt", b"body");
    engine.debouncer.ingest(vec![change]).await;
    engine.debouncer.flush_now().await.unwrap();

    let started = std::time::Instant::now();
    engine.executor.process_all_pending().await.unwrap();
    let elapsed = started.elapsed();

    // First retry lands no earlier than the 1 s base delay.
    assert!(elapsed >= std::time::Duration::from_secs(1), "drained in {elapsed:?}");

    let synced = engine.jobs.list_recent_synced(10).await.unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].n_retries, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn name_conflict_blocks_with_operator_visible_reason() {
    let engine = TestEngine::new("");

    engine.drive.fail_next_upload("a.txt", SyncError::NameConflict("a.txt".into()));

    let change = engine.write_local_file("a.txt", b"body");
    engine.debouncer.ingest(vec![change]).await;
    engine.debouncer.flush_now().await.unwrap();

    engine.executor.process_all_pending().await.unwrap();

    let blocked = engine.jobs.list_blocked().await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert!(blocked[0].last_error.as_deref().unwrap().contains("NameConflict"));

    // Blocked rows are terminal: nothing is pending, nothing retries.
    let counts = engine.jobs.get_counts().await.unwrap();
    assert_eq!(counts.pending + counts.processing, 0);
    assert!(engine.jobs.claim_next_pending().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn move_pair_relocates_the_remote_node() {
    let engine = TestEngine::new("");
    let mirror = engine.mirror_name();

    // Establish old/a.txt and the target folder remotely.
    let changes = vec![
        engine.make_local_dir("old"),
        engine.make_local_dir("new"),
        engine.write_local_file("old/a.txt", b"payload"),
    ];
    engine.debouncer.ingest(changes).await;
    engine.debouncer.flush_now().await.unwrap();
    engine.executor.process_all_pending().await.unwrap();
    assert!(engine.drive.node_at_path(&format!("{mirror}/old/a.txt")).is_some());

    // Rename locally; the change source reports a paired remove/add with a
    // shared inode inside one batch.
    let inode_change = engine.change("old/a.txt", true, ChangeKind::File);
    let inode = inode_change.inode;
    std::fs::rename(
        engine.watch_root().join("old/a.txt"),
        engine.watch_root().join("new/renamed.txt"),
    )
    .unwrap();

    let mut removed = engine.change("old/a.txt", false, ChangeKind::File);
    removed.inode = inode;
    let mut added = engine.change("new/renamed.txt", true, ChangeKind::File);
    added.inode = inode;

    engine.debouncer.ingest(vec![removed, added]).await;
    engine.debouncer.flush_now().await.unwrap();
    engine.executor.process_all_pending().await.unwrap();

    assert!(engine.drive.node_at_path(&format!("{mirror}/old/a.txt")).is_none());
    let moved = engine
        .drive
        .node_at_path(&format!("{mirror}/new/renamed.txt"))
        .expect("node moved and renamed");
    assert_eq!(moved.kind, NodeKind::File);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_of_never_synced_path_succeeds_first_try() {
    let engine = TestEngine::new("");

    engine.debouncer.ingest(vec![engine.change("ghost.txt", false, ChangeKind::File)]).await;
    engine.debouncer.flush_now().await.unwrap();

    engine.executor.process_all_pending().await.unwrap();

    let synced = engine.jobs.list_recent_synced(10).await.unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].event_type, EventType::Delete);
    assert_eq!(synced[0].n_retries, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_folder_create_stays_idempotent() {
    let engine = TestEngine::new("");
    let mirror = engine.mirror_name();

    let dir = engine.make_local_dir("docs");
    engine.debouncer.ingest(vec![dir.clone()]).await;
    engine.debouncer.flush_now().await.unwrap();
    engine.executor.process_all_pending().await.unwrap();

    // Same directory reported again (e.g. after a service restart replay).
    engine.debouncer.ingest(vec![dir]).await;
    engine.debouncer.flush_now().await.unwrap();
    engine.executor.process_all_pending().await.unwrap();

    // Mirror folder plus docs, and nothing else.
    assert_eq!(engine.drive.node_count(), 2, "no duplicate folder");
    assert!(engine.drive.node_at_path(&format!("{mirror}/docs")).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn child_listings_are_always_drained_to_exhaustion() {
    let engine = TestEngine::new("");

    let changes = vec![
        engine.make_local_dir("dir"),
        engine.write_local_file("dir/a.txt", b"one"),
        engine.write_local_file("dir/b.txt", b"two"),
        engine.write_local_file("dir/c.txt", b"three"),
    ];
    engine.debouncer.ingest(changes).await;
    engine.debouncer.flush_now().await.unwrap();
    engine.executor.process_all_pending().await.unwrap();

    let stats = engine.drive.listing_stats();
    assert!(stats.started > 0, "resolution walked the tree");
    assert_eq!(
        stats.started, stats.completed,
        "every find-by-name consumed its child iterator to exhaustion"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_child_entries_are_skipped_not_fatal() {
    let engine = TestEngine::new("");
    let mirror = engine.mirror_name();

    // Mirror the root folder first so we can degrade its listing.
    engine.debouncer.ingest(vec![engine.make_local_dir("docs")]).await;
    engine.debouncer.flush_now().await.unwrap();
    engine.executor.process_all_pending().await.unwrap();

    let docs = engine.drive.node_at_path(&format!("{mirror}/docs")).unwrap();
    engine.drive.degrade_folder(&docs.uid, "stale share key");

    engine.debouncer.ingest(vec![engine.write_local_file("docs/new.txt", b"body")]).await;
    engine.debouncer.flush_now().await.unwrap();
    engine.executor.process_all_pending().await.unwrap();

    assert!(
        engine.drive.node_at_path(&format!("{mirror}/docs/new.txt")).is_some(),
        "upload proceeded past the undecryptable sibling"
    );
    assert_eq!(engine.jobs.get_counts().await.unwrap().blocked, 0);
}
