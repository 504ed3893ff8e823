//! In-memory drive backend.
//!
//! A complete [`DriveClient`] over an in-process node tree. It honors the
//! listing contract the engine relies on: a folder is recorded as
//! "children-complete" only when a listing stream is drained to exhaustion,
//! and the counters exposing that are what the full-iteration tests
//! observe. Upload failures and degraded (undecryptable) child entries can
//! be injected per name to exercise the retry and skip paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use async_trait::async_trait;
use futures::stream;
use pdsync_core::{
    ChildStream, DriveClient, DriveNode, FileSource, NodeId, NodeKind, NodeOpOutcome, ProgressFn,
    UploadController, UploadMetadata,
};
use pdsync_domain::{Result, SyncError};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

const UPLOAD_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
struct NodeEntry {
    uid: NodeId,
    name: String,
    kind: NodeKind,
    parent: Option<NodeId>,
    content: Vec<u8>,
    mtime_ms: Option<i64>,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<NodeId, NodeEntry>,
    root: NodeId,
}

#[derive(Default)]
struct Faults {
    /// Errors returned by the next upload completions for a given name.
    upload_failures: HashMap<String, VecDeque<SyncError>>,
    /// Folders whose listing includes one undecryptable entry.
    degraded_folders: HashMap<NodeId, String>,
}

/// Listing counters for asserting the full-iteration contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingStats {
    pub started: u64,
    pub completed: u64,
}

/// In-memory drive with fault injection.
pub struct MemoryDrive {
    tree: Arc<Mutex<Tree>>,
    faults: Arc<Mutex<Faults>>,
    next_id: Arc<AtomicU64>,
    listings_started: Arc<AtomicU64>,
    listings_completed: Arc<AtomicU64>,
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDrive {
    pub fn new() -> Self {
        let root_id = "node-0".to_owned();
        let mut nodes = HashMap::new();
        nodes.insert(
            root_id.clone(),
            NodeEntry {
                uid: root_id.clone(),
                name: String::new(),
                kind: NodeKind::Folder,
                parent: None,
                content: Vec::new(),
                mtime_ms: None,
            },
        );

        Self {
            tree: Arc::new(Mutex::new(Tree { nodes, root: root_id })),
            faults: Arc::new(Mutex::new(Faults::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            listings_started: Arc::new(AtomicU64::new(0)),
            listings_completed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn alloc_id(&self) -> NodeId {
        format!("node-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Queue an error for the next upload of `name`.
    pub fn fail_next_upload(&self, name: &str, error: SyncError) {
        self.faults
            .lock()
            .expect("faults mutex")
            .upload_failures
            .entry(name.to_owned())
            .or_default()
            .push_back(error);
    }

    /// Make `folder`'s listing carry one undecryptable entry.
    pub fn degrade_folder(&self, folder: &NodeId, detail: &str) {
        self.faults
            .lock()
            .expect("faults mutex")
            .degraded_folders
            .insert(folder.clone(), detail.to_owned());
    }

    pub fn listing_stats(&self) -> ListingStats {
        ListingStats {
            started: self.listings_started.load(Ordering::SeqCst),
            completed: self.listings_completed.load(Ordering::SeqCst),
        }
    }

    /// Look up a node by slash-delimited path from the root.
    pub fn node_at_path(&self, path: &str) -> Option<DriveNode> {
        let tree = self.tree.lock().expect("tree mutex");
        let mut current = tree.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let child = tree
                .nodes
                .values()
                .find(|n| n.parent.as_ref() == Some(&current) && n.name == part)?;
            current = child.uid.clone();
        }
        tree.nodes.get(&current).map(to_drive_node)
    }

    /// Content bytes of the file at `path`.
    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        let node = self.node_at_path(path)?;
        let tree = self.tree.lock().expect("tree mutex");
        tree.nodes.get(&node.uid).map(|entry| entry.content.clone())
    }

    /// Total node count excluding the root.
    pub fn node_count(&self) -> usize {
        self.tree.lock().expect("tree mutex").nodes.len() - 1
    }

    fn batch_op(
        &self,
        node_ids: &[NodeId],
        mut op: impl FnMut(&mut Tree, &NodeId) -> Result<()>,
    ) -> Result<Vec<NodeOpOutcome>> {
        let mut tree = self.tree.lock().expect("tree mutex");
        Ok(node_ids
            .iter()
            .map(|id| NodeOpOutcome { node_id: id.clone(), result: op(&mut tree, id) })
            .collect())
    }
}

fn to_drive_node(entry: &NodeEntry) -> DriveNode {
    DriveNode {
        uid: entry.uid.clone(),
        name: entry.name.clone(),
        kind: entry.kind,
        size: match entry.kind {
            NodeKind::File => Some(entry.content.len() as u64),
            NodeKind::Folder => None,
        },
        mtime_ms: entry.mtime_ms,
    }
}

fn remove_subtree(tree: &mut Tree, node_id: &NodeId) -> Result<()> {
    if !tree.nodes.contains_key(node_id) {
        return Err(SyncError::NotFound(format!("node {node_id}")));
    }
    let mut pending = vec![node_id.clone()];
    while let Some(current) = pending.pop() {
        let children: Vec<NodeId> = tree
            .nodes
            .values()
            .filter(|n| n.parent.as_ref() == Some(&current))
            .map(|n| n.uid.clone())
            .collect();
        pending.extend(children);
        tree.nodes.remove(&current);
    }
    Ok(())
}

#[async_trait]
impl DriveClient for MemoryDrive {
    async fn get_root_folder(&self) -> Result<NodeId> {
        Ok(self.tree.lock().expect("tree mutex").root.clone())
    }

    fn iterate_folder_children(&self, folder_id: NodeId) -> ChildStream<'_> {
        self.listings_started.fetch_add(1, Ordering::SeqCst);

        let mut items: Vec<Result<DriveNode>> = {
            let tree = self.tree.lock().expect("tree mutex");
            tree.nodes
                .values()
                .filter(|n| n.parent.as_ref() == Some(&folder_id))
                .map(|n| Ok(to_drive_node(n)))
                .collect()
        };
        if let Some(detail) =
            self.faults.lock().expect("faults mutex").degraded_folders.get(&folder_id)
        {
            items.push(Err(SyncError::DecryptionFailure(detail.clone())));
        }

        let completed = Arc::clone(&self.listings_completed);
        let mut iter = items.into_iter();
        Box::pin(stream::poll_fn(move |_| match iter.next() {
            Some(item) => Poll::Ready(Some(item)),
            None => {
                // The children-complete cache is marked only here, on
                // exhaustion.
                completed.fetch_add(1, Ordering::SeqCst);
                Poll::Ready(None)
            }
        }))
    }

    async fn create_folder(
        &self,
        parent: &NodeId,
        name: &str,
        mtime_ms: Option<i64>,
    ) -> Result<NodeId> {
        let uid = self.alloc_id();
        let mut tree = self.tree.lock().expect("tree mutex");
        if !tree.nodes.contains_key(parent) {
            return Err(SyncError::NotFound(format!("parent {parent}")));
        }
        let duplicate = tree
            .nodes
            .values()
            .any(|n| n.parent.as_ref() == Some(parent) && n.name == name && n.kind == NodeKind::Folder);
        if duplicate {
            return Err(SyncError::NameConflict(name.to_owned()));
        }
        tree.nodes.insert(
            uid.clone(),
            NodeEntry {
                uid: uid.clone(),
                name: name.to_owned(),
                kind: NodeKind::Folder,
                parent: Some(parent.clone()),
                content: Vec::new(),
                mtime_ms,
            },
        );
        Ok(uid)
    }

    async fn get_file_uploader(
        &self,
        parent: &NodeId,
        name: &str,
        metadata: UploadMetadata,
        cancel: Option<CancellationToken>,
    ) -> Result<Box<dyn UploadController>> {
        Ok(Box::new(MemoryUploadController {
            drive: self.clone_handles(),
            target: UploadTarget::NewFile { parent: parent.clone(), name: name.to_owned() },
            metadata,
            cancel,
            paused: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn get_file_revision_uploader(
        &self,
        node_id: &NodeId,
        metadata: UploadMetadata,
        cancel: Option<CancellationToken>,
    ) -> Result<Box<dyn UploadController>> {
        let name = {
            let tree = self.tree.lock().expect("tree mutex");
            tree.nodes
                .get(node_id)
                .map(|n| n.name.clone())
                .ok_or_else(|| SyncError::NotFound(format!("node {node_id}")))?
        };
        Ok(Box::new(MemoryUploadController {
            drive: self.clone_handles(),
            target: UploadTarget::Revision { node: node_id.clone(), name },
            metadata,
            cancel,
            paused: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn trash_nodes(&self, node_ids: &[NodeId]) -> Result<Vec<NodeOpOutcome>> {
        // Trash and delete differ only in reversibility on the real drive;
        // the in-memory tree drops the subtree either way.
        self.batch_op(node_ids, remove_subtree)
    }

    async fn delete_nodes(&self, node_ids: &[NodeId]) -> Result<Vec<NodeOpOutcome>> {
        self.batch_op(node_ids, remove_subtree)
    }

    async fn move_nodes(
        &self,
        node_ids: &[NodeId],
        new_parent: &NodeId,
    ) -> Result<Vec<NodeOpOutcome>> {
        let new_parent = new_parent.clone();
        self.batch_op(node_ids, move |tree, id| {
            if !tree.nodes.contains_key(&new_parent) {
                return Err(SyncError::NotFound(format!("parent {new_parent}")));
            }
            match tree.nodes.get_mut(id) {
                Some(entry) => {
                    entry.parent = Some(new_parent.clone());
                    Ok(())
                }
                None => Err(SyncError::NotFound(format!("node {id}"))),
            }
        })
    }

    async fn rename_node(&self, node_id: &NodeId, new_name: &str) -> Result<()> {
        let mut tree = self.tree.lock().expect("tree mutex");
        let parent = match tree.nodes.get(node_id) {
            Some(entry) => entry.parent.clone(),
            None => return Err(SyncError::NotFound(format!("node {node_id}"))),
        };
        let conflict = tree.nodes.values().any(|n| {
            n.uid != *node_id && n.parent == parent && n.name == new_name
        });
        if conflict {
            return Err(SyncError::NameConflict(new_name.to_owned()));
        }
        if let Some(entry) = tree.nodes.get_mut(node_id) {
            entry.name = new_name.to_owned();
        }
        Ok(())
    }
}

/// Shared handles an upload controller needs after the drive call returns.
struct DriveHandles {
    tree: Arc<Mutex<Tree>>,
    faults: Arc<Mutex<Faults>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryDrive {
    fn clone_handles(&self) -> DriveHandles {
        DriveHandles {
            tree: Arc::clone(&self.tree),
            faults: Arc::clone(&self.faults),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

enum UploadTarget {
    NewFile { parent: NodeId, name: String },
    Revision { node: NodeId, name: String },
}

struct MemoryUploadController {
    drive: DriveHandles,
    target: UploadTarget,
    metadata: UploadMetadata,
    cancel: Option<CancellationToken>,
    paused: Arc<AtomicBool>,
}

#[async_trait]
impl UploadController for MemoryUploadController {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn completion(
        self: Box<Self>,
        mut source: FileSource,
        progress: Option<ProgressFn>,
    ) -> Result<NodeId> {
        let name = match &self.target {
            UploadTarget::NewFile { name, .. } | UploadTarget::Revision { name, .. } => {
                name.clone()
            }
        };

        if let Some(err) = self
            .drive
            .faults
            .lock()
            .expect("faults mutex")
            .upload_failures
            .get_mut(&name)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let mut content = Vec::with_capacity(self.metadata.expected_size as usize);
        let mut chunk = vec![0_u8; UPLOAD_CHUNK];
        loop {
            while self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            if let Some(cancel) = &self.cancel {
                if cancel.is_cancelled() {
                    return Err(SyncError::UploadFailed("upload cancelled".into()));
                }
            }

            let read = source
                .read(&mut chunk)
                .await
                .map_err(|err| SyncError::UploadFailed(format!("source read: {err}")))?;
            if read == 0 {
                break;
            }
            content.extend_from_slice(&chunk[..read]);
            if let Some(progress) = &progress {
                progress(content.len() as u64);
            }
        }

        let mtime = self.metadata.modification_time;
        match &self.target {
            UploadTarget::NewFile { parent, name } => {
                let mut tree = self.drive.tree.lock().expect("tree mutex");
                if !tree.nodes.contains_key(parent) {
                    return Err(SyncError::NotFound(format!("parent {parent}")));
                }
                let uid = format!("node-{}", self.drive.next_id.fetch_add(1, Ordering::SeqCst));
                tree.nodes.insert(
                    uid.clone(),
                    NodeEntry {
                        uid: uid.clone(),
                        name: name.clone(),
                        kind: NodeKind::File,
                        parent: Some(parent.clone()),
                        content,
                        mtime_ms: mtime,
                    },
                );
                Ok(uid)
            }
            UploadTarget::Revision { node, .. } => {
                let mut tree = self.drive.tree.lock().expect("tree mutex");
                match tree.nodes.get_mut(node) {
                    Some(entry) => {
                        entry.content = content;
                        if mtime.is_some() {
                            entry.mtime_ms = mtime;
                        }
                        Ok(node.clone())
                    }
                    None => Err(SyncError::NotFound(format!("node {node}"))),
                }
            }
        }
    }
}
