//! Change-source adapter: registrations, queries and subscriptions.
//!
//! Each configured watch root is registered with the service, queried from
//! its saved clock, and (in daemon mode) published as a named subscription.
//! The service may report a watch on an ancestor directory; the adapter
//! keeps a subscription-name → watch-root map and scopes queries with
//! `relative_root` so file names stay relative to the configured directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pdsync_core::ClockStore;
use pdsync_domain::constants::WATCHMAN_SETTLE_MS;
use pdsync_domain::{ChangeKind, FileChange, Result, SyncError, WatchmanLifecycle};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{build_query, RawFile, SubscriptionEvent, WatchmanClient};
use crate::sync::debouncer::Debouncer;

const SETTLE_CONFIG_FILE: &str = ".watchmanconfig";

/// One registered watch root.
#[derive(Debug, Clone)]
struct Registration {
    watch_root: PathBuf,
    /// Directory the service actually watches (may be an ancestor).
    watch: PathBuf,
    relative_root: Option<String>,
}

/// Adapter between the watchman service and the debouncer.
pub struct ChangeSourceAdapter {
    client: Arc<WatchmanClient>,
    clocks: Arc<dyn ClockStore>,
    debouncer: Arc<Debouncer>,
    subscriptions: Mutex<HashMap<String, Registration>>,
    dry_run: bool,
}

impl ChangeSourceAdapter {
    pub fn new(
        client: Arc<WatchmanClient>,
        clocks: Arc<dyn ClockStore>,
        debouncer: Arc<Debouncer>,
        dry_run: bool,
    ) -> Self {
        Self { client, clocks, debouncer, subscriptions: Mutex::new(HashMap::new()), dry_run }
    }

    /// One-shot mode: query every root from its saved clock and flush the
    /// debouncer synchronously. No cross-root ordering is required, so the
    /// roots are queried concurrently.
    pub async fn run_once(&self, roots: &[PathBuf]) -> Result<()> {
        let queries = roots.iter().map(|root| self.query_root(root));
        futures::future::try_join_all(queries).await?;
        self.debouncer.flush_now().await?;
        Ok(())
    }

    /// Register `root` and hand its pending changes to the debouncer,
    /// persisting the returned clock afterwards.
    pub async fn query_root(&self, root: &Path) -> Result<()> {
        let registration = self.register(root).await?;
        let since = self.clocks.get(&registration.watch_root).await?;

        let query = build_query(since.as_deref(), registration.relative_root.as_deref());
        let response = self.client.query(&registration.watch, query).await?;

        if response.is_fresh_instance {
            debug!(root = %registration.watch_root.display(), "fresh instance, full resync batch");
        }

        let changes = normalize_files(&registration.watch_root, &response.files);
        info!(
            root = %registration.watch_root.display(),
            files = changes.len(),
            clock = %response.clock,
            "change-source query completed"
        );
        self.debouncer.ingest(changes).await;

        self.clocks.set(&registration.watch_root, &response.clock, self.dry_run).await
    }

    /// Subscription mode: register `root` and publish a named subscription
    /// starting at its saved clock.
    pub async fn subscribe_root(&self, root: &Path) -> Result<String> {
        let registration = self.register(root).await?;
        let since = self.clocks.get(&registration.watch_root).await?;

        let name = subscription_name(&registration.watch_root);
        let query = build_query(since.as_deref(), registration.relative_root.as_deref());

        // Map the name before subscribing: the initial burst can arrive on
        // the event channel before `subscribe` even returns.
        self.subscriptions.lock().await.insert(name.clone(), registration.clone());
        if let Err(err) = self.client.subscribe(&registration.watch, &name, query).await {
            self.subscriptions.lock().await.remove(&name);
            return Err(err);
        }

        info!(
            root = %registration.watch_root.display(),
            subscription = %name,
            "subscription established"
        );
        Ok(name)
    }

    /// Consume subscription events until cancelled. Events for unknown or
    /// since-removed subscriptions are logged and discarded.
    pub async fn handle_events(
        &self,
        mut events: mpsc::Receiver<SubscriptionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("event handler cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!("watchman connection closed, event stream ended");
                        break;
                    }
                },
            };

            let registration = {
                let subs = self.subscriptions.lock().await;
                subs.get(&event.subscription).cloned()
            };
            let Some(registration) = registration else {
                warn!(subscription = %event.subscription, "event for unknown subscription discarded");
                continue;
            };

            if event.is_fresh_instance {
                debug!(
                    subscription = %event.subscription,
                    "service restarted, batch carries full state"
                );
            }

            let changes = normalize_files(&registration.watch_root, &event.files);
            debug!(
                subscription = %event.subscription,
                files = changes.len(),
                "subscription batch received"
            );
            self.debouncer.ingest(changes).await;

            // Clock write happens after the whole batch is buffered; a crash
            // in between replays the batch and supersedure absorbs it.
            if let Some(clock) = event.clock.as_deref() {
                if let Err(err) =
                    self.clocks.set(&registration.watch_root, clock, self.dry_run).await
                {
                    warn!(error = %err, "failed to persist clock");
                }
            }
        }
    }

    /// Remove every subscription; ask a daemon-spawned service to exit.
    pub async fn teardown(&self, lifecycle: WatchmanLifecycle) {
        let registrations: Vec<(String, Registration)> =
            self.subscriptions.lock().await.drain().collect();
        for (name, registration) in registrations {
            if let Err(err) = self.client.unsubscribe(&registration.watch, &name).await {
                warn!(subscription = %name, error = %err, "unsubscribe failed");
            }
        }

        if lifecycle == WatchmanLifecycle::Spawned {
            if let Err(err) = self.client.shutdown_server().await {
                warn!(error = %err, "could not stop spawned watchman instance");
            }
        }
    }

    async fn register(&self, root: &Path) -> Result<Registration> {
        let watch_root = root
            .canonicalize()
            .map_err(|err| SyncError::Config(format!("bad watch root {}: {err}", root.display())))?;

        ensure_settle_config(&watch_root)?;

        let project = self.client.watch_project(&watch_root).await?;
        Ok(Registration {
            watch_root,
            watch: project.watch,
            relative_root: project.relative_path,
        })
    }
}

/// Write a settle configuration into the watched directory on first
/// registration so the service coalesces rapid bursts before notifying.
/// A user-provided file is left untouched.
fn ensure_settle_config(watch_root: &Path) -> Result<()> {
    let config_path = watch_root.join(SETTLE_CONFIG_FILE);
    if config_path.exists() {
        return Ok(());
    }
    let body = serde_json::to_string_pretty(&json!({ "settle": WATCHMAN_SETTLE_MS }))
        .map_err(|err| SyncError::Internal(format!("cannot encode settle config: {err}")))?;
    std::fs::write(&config_path, body)
        .map_err(|err| SyncError::LocalIo(format!("cannot write settle config: {err}")))?;
    debug!(path = %config_path.display(), settle_ms = WATCHMAN_SETTLE_MS, "settle config written");
    Ok(())
}

fn subscription_name(watch_root: &Path) -> String {
    let base = watch_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_owned());
    format!("pdsync-{base}")
}

fn normalize_files(watch_root: &Path, files: &[RawFile]) -> Vec<FileChange> {
    files
        .iter()
        .map(|file| FileChange {
            relative_path: file.name.clone(),
            size: file.size,
            mtime_ms: file.mtime_ms.unwrap_or_default(),
            exists: file.exists,
            kind: match file.kind.as_deref() {
                Some("d") => ChangeKind::Dir,
                _ => ChangeKind::File,
            },
            is_new: file.new,
            inode: file.ino.unwrap_or_default(),
            content_hash: file.sha1(),
            watch_root: watch_root.to_path_buf(),
        })
        .collect()
}
