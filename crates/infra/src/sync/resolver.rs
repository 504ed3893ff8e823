//! Path resolution against the remote tree.
//!
//! Logical paths are slash-delimited, optionally prefixed with `my_files/`
//! (an alias for the drive root that is stripped before walking).
//!
//! Every child enumeration drains the listing stream to exhaustion even
//! after a match: the drive client marks its children-complete cache only
//! when the iterator finishes, and an early exit would defeat caching for
//! every later call on the same folder.

use std::sync::Arc;

use futures::StreamExt;
use pdsync_core::{DriveClient, DriveNode, NodeId, NodeKind};
use pdsync_domain::constants::REMOTE_ROOT_ALIAS;
use pdsync_domain::{Result, SyncError};
use tracing::{debug, warn};

/// Walks logical paths to remote folder nodes.
pub struct PathResolver {
    drive: Arc<dyn DriveClient>,
}

impl PathResolver {
    pub fn new(drive: Arc<dyn DriveClient>) -> Self {
        Self { drive }
    }

    /// Walk `remote_path`, creating missing folders. After the first created
    /// component the walk switches to create-only: everything deeper is new
    /// by construction, so searching children would be wasted calls.
    pub async fn ensure_path(&self, remote_path: &str) -> Result<NodeId> {
        let mut current = self.drive.get_root_folder().await?;
        let mut create_only = false;

        for component in components(remote_path) {
            if create_only {
                current = self.drive.create_folder(&current, component, None).await?;
                continue;
            }
            match self.find_folder_by_name(&current, component).await? {
                Some(node) => current = node.uid,
                None => {
                    debug!(component, "creating missing remote folder");
                    current = self.drive.create_folder(&current, component, None).await?;
                    create_only = true;
                }
            }
        }
        Ok(current)
    }

    /// Walk `remote_path`; a missing component returns `None`.
    pub async fn resolve_path(&self, remote_path: &str) -> Result<Option<NodeId>> {
        let mut current = self.drive.get_root_folder().await?;

        for component in components(remote_path) {
            match self.find_folder_by_name(&current, component).await? {
                Some(node) => current = node.uid,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub async fn find_folder_by_name(
        &self,
        parent: &NodeId,
        name: &str,
    ) -> Result<Option<DriveNode>> {
        self.find_child(parent, name, Some(NodeKind::Folder)).await
    }

    pub async fn find_file_by_name(
        &self,
        parent: &NodeId,
        name: &str,
    ) -> Result<Option<DriveNode>> {
        self.find_child(parent, name, Some(NodeKind::File)).await
    }

    /// Find a child of any kind.
    pub async fn find_child_by_name(
        &self,
        parent: &NodeId,
        name: &str,
    ) -> Result<Option<DriveNode>> {
        self.find_child(parent, name, None).await
    }

    async fn find_child(
        &self,
        parent: &NodeId,
        name: &str,
        kind: Option<NodeKind>,
    ) -> Result<Option<DriveNode>> {
        let mut children = self.drive.iterate_folder_children(parent.clone());
        let mut found = None;

        // Full-iteration rule: keep consuming after the match.
        while let Some(entry) = children.next().await {
            match entry {
                Ok(node) => {
                    if found.is_none()
                        && node.name == name
                        && kind.map_or(true, |k| node.kind == k)
                    {
                        found = Some(node);
                    }
                }
                // A degraded entry does not abort the listing.
                Err(SyncError::DecryptionFailure(detail)) => {
                    warn!(parent = %parent, detail = %detail, "skipping undecryptable child entry");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(found)
    }
}

/// Split a logical path into components, stripping the root alias.
fn components(remote_path: &str) -> impl Iterator<Item = &str> {
    let trimmed = remote_path.trim_matches('/');
    let trimmed = trimmed
        .strip_prefix(&format!("{REMOTE_ROOT_ALIAS}/"))
        .or_else(|| (trimmed == REMOTE_ROOT_ALIAS).then_some(""))
        .unwrap_or(trimmed);
    trimmed.split('/').filter(|part| !part.is_empty())
}

/// Split `remote_path` into its parent path and base name.
pub fn split_parent(remote_path: &str) -> (String, String) {
    let trimmed = remote_path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent.to_owned(), name.to_owned()),
        None => (String::new(), trimmed.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_strip_alias_and_empty_parts() {
        let parts: Vec<&str> = components("my_files/backups//Documents/a").collect();
        assert_eq!(parts, vec!["backups", "Documents", "a"]);

        let parts: Vec<&str> = components("/Documents/a/").collect();
        assert_eq!(parts, vec!["Documents", "a"]);

        assert_eq!(components("my_files").count(), 0);
        assert_eq!(components("").count(), 0);
    }

    #[test]
    fn split_parent_handles_root_level_names() {
        assert_eq!(split_parent("backups/Documents/a.txt"), ("backups/Documents".into(), "a.txt".into()));
        assert_eq!(split_parent("a.txt"), (String::new(), "a.txt".into()));
    }
}
