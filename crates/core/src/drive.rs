//! The drive-client capability consumed by the sync engine.
//!
//! The remote store is reached through an opaque, end-to-end-encrypted client
//! owned by the embedding application. The engine only sees this trait; tests
//! substitute an in-memory fake.
//!
//! Listing contract: [`DriveClient::iterate_folder_children`] yields one
//! result per child. A degraded entry (the client could not decrypt a name)
//! arrives as an `Err` item and the stream continues; callers skip it and
//! keep iterating. Consumers must drain the stream to exhaustion even after
//! finding what they were looking for, because the client marks its
//! children-complete cache only when the iterator finishes.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use pdsync_domain::Result;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Opaque identifier of a remote node.
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

/// One entry of a folder listing.
#[derive(Debug, Clone)]
pub struct DriveNode {
    pub uid: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub size: Option<u64>,
    pub mtime_ms: Option<i64>,
}

/// Stream of per-child results from a folder listing.
pub type ChildStream<'a> = BoxStream<'a, Result<DriveNode>>;

/// Metadata accompanying an upload.
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub media_type: String,
    pub expected_size: u64,
    pub modification_time: Option<i64>,
}

/// Callback invoked with the cumulative uploaded byte count.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Byte source for a streamed upload.
pub type FileSource = Pin<Box<dyn AsyncRead + Send>>;

/// Per-node outcome of a batch operation.
#[derive(Debug)]
pub struct NodeOpOutcome {
    pub node_id: NodeId,
    pub result: Result<()>,
}

/// Controller for one in-flight upload.
///
/// `pause` and `resume` take effect between chunks; `completion` streams the
/// source and resolves to the final node id, failing with `UploadFailed` on
/// network, quota, or crypto errors.
#[async_trait]
pub trait UploadController: Send {
    fn pause(&self);
    fn resume(&self);
    async fn completion(
        self: Box<Self>,
        source: FileSource,
        progress: Option<ProgressFn>,
    ) -> Result<NodeId>;
}

/// Remote tree operations required by the engine.
#[async_trait]
pub trait DriveClient: Send + Sync {
    /// Root folder of the user's drive.
    async fn get_root_folder(&self) -> Result<NodeId>;

    /// Lazily list a folder's children. See the module docs for the
    /// exhaustion contract.
    fn iterate_folder_children(&self, folder_id: NodeId) -> ChildStream<'_>;

    async fn create_folder(
        &self,
        parent: &NodeId,
        name: &str,
        mtime_ms: Option<i64>,
    ) -> Result<NodeId>;

    /// Uploader for a brand-new file node under `parent`.
    async fn get_file_uploader(
        &self,
        parent: &NodeId,
        name: &str,
        metadata: UploadMetadata,
        cancel: Option<CancellationToken>,
    ) -> Result<Box<dyn UploadController>>;

    /// Uploader for a new revision of an existing file node.
    async fn get_file_revision_uploader(
        &self,
        node_id: &NodeId,
        metadata: UploadMetadata,
        cancel: Option<CancellationToken>,
    ) -> Result<Box<dyn UploadController>>;

    /// Move nodes to the trash (reversible).
    async fn trash_nodes(&self, node_ids: &[NodeId]) -> Result<Vec<NodeOpOutcome>>;

    /// Permanently delete nodes.
    async fn delete_nodes(&self, node_ids: &[NodeId]) -> Result<Vec<NodeOpOutcome>>;

    /// Re-parent nodes; per-node outcomes surface partial failures.
    async fn move_nodes(&self, node_ids: &[NodeId], new_parent: &NodeId)
        -> Result<Vec<NodeOpOutcome>>;

    /// Rename a single node; duplicate names fail with `NameConflict`.
    async fn rename_node(&self, node_id: &NodeId, new_name: &str) -> Result<()>;
}
