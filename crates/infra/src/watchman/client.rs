//! Watchman socket client.
//!
//! The service speaks newline-delimited JSON over a unix socket. Requests
//! are arrays (`["watch-project", "/path"]`), responses are objects, and
//! subscription events arrive unilaterally as objects carrying a
//! `subscription` key. A single reader task routes unilateral PDUs to the
//! event channel and everything else to the oldest pending request, which
//! is sound because the service answers requests in order on one socket.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use pdsync_domain::{Result, SyncError, WatchmanLifecycle};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type PendingQueue = Arc<StdMutex<VecDeque<oneshot::Sender<Value>>>>;

/// A unilateral subscription PDU.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEvent {
    pub subscription: String,
    pub clock: Option<String>,
    #[serde(default)]
    pub files: Vec<RawFile>,
    #[serde(default)]
    pub is_fresh_instance: bool,
}

/// Response to a `query` request.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    pub clock: String,
    #[serde(default)]
    pub files: Vec<RawFile>,
    #[serde(default)]
    pub is_fresh_instance: bool,
}

/// Response to a `watch-project` request.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchProject {
    pub watch: PathBuf,
    /// Set when the service already watches an ancestor of the requested
    /// directory.
    pub relative_path: Option<String>,
}

/// One file record as the service reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub mtime_ms: Option<i64>,
    pub exists: bool,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub new: bool,
    pub ino: Option<u64>,
    /// String hash, or an error object when the service could not hash.
    #[serde(rename = "content.sha1hex", default)]
    pub content_sha1hex: Option<Value>,
}

impl RawFile {
    /// The content hash when the service produced one.
    pub fn sha1(&self) -> Option<String> {
        self.content_sha1hex.as_ref().and_then(Value::as_str).map(str::to_owned)
    }
}

/// The query every registration issues: files and directories, the full
/// field set, scoped below `relative_root` and after `since` when present.
pub fn build_query(since: Option<&str>, relative_root: Option<&str>) -> Value {
    let mut query = json!({
        "fields": ["name", "size", "mtime_ms", "exists", "type", "new", "ino", "content.sha1hex"],
        "expression": ["anyof", ["type", "f"], ["type", "d"]],
    });
    if let Some(clock) = since {
        query["since"] = Value::String(clock.to_owned());
    }
    if let Some(rel) = relative_root {
        if !rel.is_empty() {
            query["relative_root"] = Value::String(rel.to_owned());
        }
    }
    query
}

/// Long-lived connection to the watchman service.
pub struct WatchmanClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingQueue,
    reader_task: JoinHandle<()>,
}

impl WatchmanClient {
    /// Connect to the service socket. Subscription events are delivered on
    /// `event_tx` for as long as the connection lives.
    pub async fn connect(
        socket_path: &PathBuf,
        event_tx: mpsc::Sender<SubscriptionEvent>,
    ) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|err| {
            SyncError::ServiceUnavailable(format!(
                "cannot reach watchman at {}: {err}",
                socket_path.display()
            ))
        })?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingQueue = Arc::new(StdMutex::new(VecDeque::new()));
        let reader_task = tokio::spawn(read_loop(read_half, Arc::clone(&pending), event_tx));

        info!(socket = %socket_path.display(), "connected to watchman");

        Ok(Self { writer: Mutex::new(write_half), pending, reader_task })
    }

    /// Issue one request and await its response.
    pub async fn request(&self, command: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self
                .pending
                .lock()
                .map_err(|_| SyncError::Internal("watchman pending queue poisoned".into()))?;
            queue.push_back(tx);
        }

        let mut line = serde_json::to_string(&command)
            .map_err(|err| SyncError::Internal(format!("cannot encode request: {err}")))?;
        line.push('\n');

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await.map_err(|err| {
                SyncError::ServiceUnavailable(format!("watchman write failed: {err}"))
            })?;
        }

        let response = rx.await.map_err(|_| {
            SyncError::ServiceUnavailable("watchman connection closed mid-request".into())
        })?;

        if let Some(message) = response.get("error").and_then(Value::as_str) {
            return Err(SyncError::ServiceUnavailable(format!("watchman error: {message}")));
        }
        Ok(response)
    }

    pub async fn version(&self) -> Result<String> {
        let response = self.request(json!(["version"])).await?;
        response
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| SyncError::ServiceUnavailable("version reply missing field".into()))
    }

    pub async fn watch_project(&self, directory: &PathBuf) -> Result<WatchProject> {
        let response =
            self.request(json!(["watch-project", directory.to_string_lossy()])).await?;
        serde_json::from_value(response)
            .map_err(|err| SyncError::ServiceUnavailable(format!("bad watch-project reply: {err}")))
    }

    pub async fn query(&self, root: &PathBuf, query: Value) -> Result<QueryResponse> {
        let response = self.request(json!(["query", root.to_string_lossy(), query])).await?;
        serde_json::from_value(response)
            .map_err(|err| SyncError::ServiceUnavailable(format!("bad query reply: {err}")))
    }

    pub async fn subscribe(&self, root: &PathBuf, name: &str, query: Value) -> Result<String> {
        let response =
            self.request(json!(["subscribe", root.to_string_lossy(), name, query])).await?;
        response
            .get("clock")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| SyncError::ServiceUnavailable("subscribe reply missing clock".into()))
    }

    pub async fn unsubscribe(&self, root: &PathBuf, name: &str) -> Result<()> {
        self.request(json!(["unsubscribe", root.to_string_lossy(), name])).await?;
        Ok(())
    }

    /// Ask a daemon-spawned service to exit.
    pub async fn shutdown_server(&self) -> Result<()> {
        self.request(json!(["shutdown-server"])).await?;
        Ok(())
    }
}

impl Drop for WatchmanClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    pending: PendingQueue,
    event_tx: mpsc::Sender<SubscriptionEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("watchman socket closed");
                break;
            }
            Err(err) => {
                error!(error = %err, "watchman socket read failed");
                break;
            }
        };

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "discarding undecodable watchman PDU");
                continue;
            }
        };

        if value.get("subscription").is_some() {
            match serde_json::from_value::<SubscriptionEvent>(value) {
                Ok(event) => {
                    if event_tx.send(event).await.is_err() {
                        debug!("subscription consumer gone, stopping reader");
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "discarding malformed subscription PDU"),
            }
            continue;
        }

        let waiter = pending.lock().ok().and_then(|mut queue| queue.pop_front());
        match waiter {
            Some(tx) => {
                let _ = tx.send(value);
            }
            None => warn!("watchman response with no pending request"),
        }
    }

    // Fail any requests still waiting so callers see a closed connection.
    if let Ok(mut queue) = pending.lock() {
        queue.clear();
    }
}

/// Locate the service socket, noting whether the service was already alive.
///
/// `$WATCHMAN_SOCK` wins when set. Otherwise `watchman get-pid --no-spawn`
/// probes for a live instance, and `watchman get-sockname` resolves the
/// socket, starting the service when the probe found none; only a
/// daemon-spawned instance is asked to shut down on exit.
pub async fn discover_socket() -> Result<(PathBuf, WatchmanLifecycle)> {
    if let Some(sock) = std::env::var_os("WATCHMAN_SOCK") {
        return Ok((PathBuf::from(sock), WatchmanLifecycle::Existing));
    }

    let probe = Command::new("watchman")
        .args(["get-pid", "--no-spawn"])
        .output()
        .await
        .map_err(|err| SyncError::ServiceUnavailable(format!("cannot run watchman: {err}")))?;
    let lifecycle = if probe.status.success() {
        WatchmanLifecycle::Existing
    } else {
        WatchmanLifecycle::Spawned
    };

    let output = Command::new("watchman")
        .arg("get-sockname")
        .output()
        .await
        .map_err(|err| SyncError::ServiceUnavailable(format!("cannot run watchman: {err}")))?;
    if !output.status.success() {
        return Err(SyncError::ServiceUnavailable("watchman get-sockname failed".into()));
    }

    let reply: Value = serde_json::from_slice(&output.stdout)
        .map_err(|err| SyncError::ServiceUnavailable(format!("bad get-sockname reply: {err}")))?;
    let sockname = reply
        .get("sockname")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::ServiceUnavailable("get-sockname reply missing field".into()))?;

    info!(socket = sockname, lifecycle = %lifecycle, "watchman socket resolved");
    Ok((PathBuf::from(sockname), lifecycle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_includes_since_and_relative_root_when_present() {
        let query = build_query(Some("c:1:2"), Some("Documents"));
        assert_eq!(query["since"], "c:1:2");
        assert_eq!(query["relative_root"], "Documents");
        assert_eq!(query["fields"][0], "name");
    }

    #[test]
    fn query_omits_absent_clauses() {
        let query = build_query(None, None);
        assert!(query.get("since").is_none());
        assert!(query.get("relative_root").is_none());
    }

    #[test]
    fn raw_file_extracts_string_hash_and_skips_error_objects() {
        let with_hash: RawFile = serde_json::from_value(json!({
            "name": "a.txt", "size": 3, "mtime_ms": 1, "exists": true,
            "type": "f", "new": true, "ino": 42,
            "content.sha1hex": "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        }))
        .unwrap();
        assert_eq!(with_hash.sha1().unwrap().len(), 40);

        let degraded: RawFile = serde_json::from_value(json!({
            "name": "b.txt", "size": 0, "mtime_ms": 1, "exists": true,
            "type": "f", "new": false, "ino": 43,
            "content.sha1hex": {"error": "file vanished during hashing"}
        }))
        .unwrap();
        assert!(degraded.sha1().is_none());
    }

    #[tokio::test]
    async fn request_and_subscription_routing() {
        let temp = tempfile::tempdir().unwrap();
        let sock_path = temp.path().join("wm.sock");
        let listener = tokio::net::UnixListener::bind(&sock_path).unwrap();

        // Fake service: answer the first request, then push a unilateral
        // subscription PDU.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            let request = lines.next_line().await.unwrap().unwrap();
            assert!(request.contains("version"));
            write.write_all(b"{\"version\":\"2024.01.01.00\"}\n").await.unwrap();
            write
                .write_all(
                    b"{\"subscription\":\"pdsync-docs\",\"clock\":\"c:1:5\",\"files\":[],\"is_fresh_instance\":false}\n",
                )
                .await
                .unwrap();
            // Hold the socket open until the client is done.
            let _ = lines.next_line().await;
        });

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let client = WatchmanClient::connect(&sock_path, event_tx).await.unwrap();

        let version = client.version().await.unwrap();
        assert_eq!(version, "2024.01.01.00");

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.subscription, "pdsync-docs");
        assert_eq!(event.clock.as_deref(), Some("c:1:5"));

        drop(client);
        server.abort();
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_service_error() {
        let temp = tempfile::tempdir().unwrap();
        let sock_path = temp.path().join("wm.sock");
        let listener = tokio::net::UnixListener::bind(&sock_path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await.unwrap();
            write.write_all(b"{\"error\":\"unable to resolve root\"}\n").await.unwrap();
            let _ = lines.next_line().await;
        });

        let (event_tx, _event_rx) = mpsc::channel(8);
        let client = WatchmanClient::connect(&sock_path, event_tx).await.unwrap();

        let err = client.watch_project(&PathBuf::from("/nope")).await.unwrap_err();
        assert!(matches!(err, SyncError::ServiceUnavailable(_)));

        drop(client);
        server.abort();
    }
}
