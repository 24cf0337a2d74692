use crate::error::{Error, Result};
use crate::git::protocol::{Request, Response};
use crate::git::{GitOps, HeadInfo};
use crate::resource::CommitSha;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

type Conn = Framed<UnixStream, LengthDelimitedCodec>;

#[derive(Debug, Clone)]
pub struct GitClientConfig {
    pub socket_path: PathBuf,
    /// Collaborator command line. `None` means the process is managed
    /// externally and the client only connects.
    pub command: Option<Vec<String>>,
    pub request_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
}

impl GitClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        GitClientConfig {
            socket_path: socket_path.into(),
            command: None,
            request_timeout: Duration::from_secs(300),
            connect_attempts: 25,
            connect_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct Inner {
    conn: Option<Conn>,
    child: Option<Child>,
    next_id: u64,
}

/// Client for the co-located git collaborator. Requests are serialized:
/// the collaborator handles one operation at a time and callers queue on
/// the internal lock. A collaborator crash fails the in-flight request
/// with [`Error::CollaboratorCrashed`] and the process is respawned on the
/// next request.
pub struct GitClient {
    config: GitClientConfig,
    inner: Mutex<Inner>,
}

impl GitClient {
    pub fn new(config: GitClientConfig) -> Self {
        GitClient {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    async fn ensure_connected(&self, inner: &mut Inner) -> Result<()> {
        if let Some(child) = inner.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                warn!(%status, "git collaborator exited");
                inner.child = None;
                inner.conn = None;
            }
        }
        if inner.conn.is_some() {
            return Ok(());
        }

        if inner.child.is_none() {
            if let Some(argv) = &self.config.command {
                let program = argv.first().ok_or_else(|| {
                    Error::CollaboratorCrashed("empty collaborator command".into())
                })?;
                let child = Command::new(program)
                    .args(&argv[1..])
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        Error::CollaboratorCrashed(format!("spawn {program}: {e}"))
                    })?;
                info!(program, "started git collaborator");
                inner.child = Some(child);
            }
        }

        let mut last_error = String::new();
        for _ in 0..self.config.connect_attempts {
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => {
                    debug!(socket = %self.config.socket_path.display(), "connected to git collaborator");
                    inner.conn = Some(Framed::new(stream, LengthDelimitedCodec::new()));
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(self.config.connect_delay).await;
                }
            }
        }
        Err(Error::CollaboratorCrashed(format!(
            "cannot connect to {}: {last_error}",
            self.config.socket_path.display()
        )))
    }

    async fn round_trip(conn: &mut Conn, op: &'static str, id: u64, frame: Vec<u8>) -> Result<Value> {
        conn.send(Bytes::from(frame))
            .await
            .map_err(|e| Error::CollaboratorCrashed(format!("write failed: {e}")))?;
        let reply = match conn.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                return Err(Error::CollaboratorCrashed(format!("read failed: {e}")))
            }
            None => return Err(Error::CollaboratorCrashed("connection closed".into())),
        };
        let response: Response = serde_json::from_slice(&reply)
            .map_err(|e| Error::CollaboratorCrashed(format!("bad frame: {e}")))?;
        if response.id != id {
            return Err(Error::CollaboratorCrashed(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        response
            .into_result()
            .map_err(|reason| Error::GitRequestFailed { op, reason })
    }

    async fn request(&self, op: &'static str, args: Value) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        self.ensure_connected(&mut inner).await?;
        inner.next_id += 1;
        let id = inner.next_id;
        let frame = serde_json::to_vec(&Request { id, op, args })?;

        let Some(conn) = inner.conn.as_mut() else {
            return Err(Error::CollaboratorCrashed("not connected".into()));
        };
        let outcome =
            match tokio::time::timeout(self.config.request_timeout, Self::round_trip(conn, op, id, frame))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::CollaboratorCrashed(format!(
                    "request timed out after {:?}",
                    self.config.request_timeout
                ))),
            };
        if matches!(outcome, Err(Error::CollaboratorCrashed(_))) {
            // connection state is unknown, reconnect on the next request
            inner.conn = None;
        }
        outcome
    }
}

fn sha_of(value: Value) -> Result<CommitSha> {
    match value {
        Value::String(s) => CommitSha::new(s),
        other => Err(Error::InvalidResource(format!(
            "expected commit SHA, got {other}"
        ))),
    }
}

#[async_trait]
impl GitOps for GitClient {
    async fn sync(&self, url: &str, branch: &str, path: &Path, depth: u32) -> Result<CommitSha> {
        let value = self
            .request(
                "sync",
                json!({ "url": url, "branch": branch, "path": path, "depth": depth }),
            )
            .await?;
        sha_of(value)
    }

    async fn files(&self, path: &Path, subpath: Option<&str>) -> Result<Vec<String>> {
        let value = self
            .request("files", json!({ "path": path, "subpath": subpath }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn read(&self, path: &Path, file: &str) -> Result<Vec<u8>> {
        let value = self
            .request("read", json!({ "path": path, "file": file }))
            .await?;
        let encoded = value.as_str().ok_or_else(|| Error::GitRequestFailed {
            op: "read",
            reason: "file contents are not a string".into(),
        })?;
        BASE64.decode(encoded).map_err(|e| Error::GitRequestFailed {
            op: "read",
            reason: format!("invalid base64: {e}"),
        })
    }

    async fn head(&self, path: &Path) -> Result<HeadInfo> {
        let value = self.request("head", json!({ "path": path })).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn checkout(&self, path: &Path, sha: &CommitSha) -> Result<CommitSha> {
        let value = self
            .request("checkout", json!({ "path": path, "sha": sha }))
            .await?;
        sha_of(value)
    }

    async fn ls_remote(&self, url: &str, branch: &str) -> Result<CommitSha> {
        let value = self
            .request("lsremote", json!({ "url": url, "branch": branch }))
            .await?;
        sha_of(value)
    }
}
