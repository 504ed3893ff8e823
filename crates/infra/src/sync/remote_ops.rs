//! Remote mutations against the drive client.
//!
//! Each operation reconciles one job's intent with the remote tree and
//! reports a typed error on failure. Whole files are uploaded; a file that
//! already exists by name receives a new revision instead of a duplicate
//! node.

use std::path::Path;
use std::sync::Arc;

use pdsync_core::{DriveClient, NodeId, NodeOpOutcome, UploadMetadata};
use pdsync_domain::{Result, SyncError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::resolver::{split_parent, PathResolver};

const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// The remote operation set the executor dispatches into.
pub struct RemoteOps {
    drive: Arc<dyn DriveClient>,
    resolver: PathResolver,
}

impl RemoteOps {
    pub fn new(drive: Arc<dyn DriveClient>) -> Self {
        let resolver = PathResolver::new(Arc::clone(&drive));
        Self { drive, resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Idempotently materialize a folder path.
    pub async fn create_folder_path(&self, remote_path: &str) -> Result<NodeId> {
        self.resolver.ensure_path(remote_path).await
    }

    /// Upload `local_path` to `remote_path`, as a new node or a new revision
    /// of the existing one.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<NodeId> {
        let (parent_path, name) = split_parent(remote_path);
        let parent = self.resolver.ensure_path(&parent_path).await?;

        let meta = tokio::fs::metadata(local_path)
            .await
            .map_err(|err| SyncError::LocalIo(format!("{}: {err}", local_path.display())))?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        let metadata = UploadMetadata {
            media_type: DEFAULT_MEDIA_TYPE.to_owned(),
            expected_size: meta.len(),
            modification_time: mtime_ms,
        };

        let uploader = match self.resolver.find_file_by_name(&parent, &name).await? {
            Some(existing) => {
                debug!(remote_path, node = %existing.uid, "uploading new revision");
                self.drive.get_file_revision_uploader(&existing.uid, metadata, cancel).await?
            }
            None => {
                debug!(remote_path, "uploading new file");
                self.drive.get_file_uploader(&parent, &name, metadata, cancel).await?
            }
        };

        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|err| SyncError::LocalIo(format!("{}: {err}", local_path.display())))?;
        let progress_path = remote_path.to_owned();
        let node_id = uploader
            .completion(
                Box::pin(file),
                Some(Arc::new(move |uploaded| {
                    trace!(remote_path = %progress_path, uploaded, "upload progress");
                })),
            )
            .await?;

        info!(remote_path, node = %node_id, bytes = meta.len(), "upload completed");
        Ok(node_id)
    }

    /// Remove the node at `remote_path`. Returns whether a node existed;
    /// a missing parent or target is success for a delete.
    pub async fn remove(&self, remote_path: &str, permanent: bool) -> Result<bool> {
        let (parent_path, name) = split_parent(remote_path);
        let Some(parent) = self.resolver.resolve_path(&parent_path).await? else {
            debug!(remote_path, "parent already gone");
            return Ok(false);
        };
        let Some(node) = self.resolver.find_child_by_name(&parent, &name).await? else {
            debug!(remote_path, "target already gone");
            return Ok(false);
        };

        let ids = vec![node.uid.clone()];
        let outcomes = if permanent {
            self.drive.delete_nodes(&ids).await?
        } else {
            self.drive.trash_nodes(&ids).await?
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => {}
                // The node vanished between lookup and removal.
                Err(SyncError::NotFound(_)) => return Ok(false),
                Err(other) => return Err(other),
            }
        }

        info!(remote_path, node = %node.uid, permanent, "remote node removed");
        Ok(true)
    }

    /// Re-parent (and if the base name changed, rename) the node at
    /// `old_remote_path` so it lives at `new_remote_path`.
    pub async fn move_node(&self, old_remote_path: &str, new_remote_path: &str) -> Result<()> {
        let (old_parent_path, old_name) = split_parent(old_remote_path);
        let (new_parent_path, new_name) = split_parent(new_remote_path);

        let old_parent = self
            .resolver
            .resolve_path(&old_parent_path)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("source parent {old_parent_path}")))?;
        let node = self
            .resolver
            .find_child_by_name(&old_parent, &old_name)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("source node {old_remote_path}")))?;

        let new_parent = self
            .resolver
            .resolve_path(&new_parent_path)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("target parent {new_parent_path}")))?;

        if old_parent != new_parent {
            let ids = vec![node.uid.clone()];
            let outcomes = self.drive.move_nodes(&ids, &new_parent).await?;
            for NodeOpOutcome { node_id, result } in outcomes {
                if let Err(err) = result {
                    debug!(node = %node_id, error = %err, "per-node move failed");
                    return Err(err);
                }
            }
        }

        if old_name != new_name {
            self.drive.rename_node(&node.uid, &new_name).await?;
        }

        info!(from = old_remote_path, to = new_remote_path, node = %node.uid, "remote node moved");
        Ok(())
    }
}
