//! Filesystem browsing and manipulation service.
//!
//! The envelope `id` is the target path for every action. Handlers fan out
//! into their own tasks: filesystem actions carry no ordering contract, and
//! a slow SFTP round-trip must not hold up the rest of the session.

mod local;
mod sftp;

pub use local::LocalFs;
pub use sftp::SftpFs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::Envelope;
use crate::service::Service;
use crate::ssh::SshError;
use crate::transport::{Outbox, TransportError};

const ACTION_ROOT: &str = "get_root";
const ACTION_LIST: &str = "list";
const ACTION_CREATE: &str = "create";
const ACTION_DELETE: &str = "delete";
const ACTION_RENAME: &str = "rename";
const ACTION_COPY: &str = "copy";
const ACTION_MOVE: &str = "move";

#[derive(Error, Debug)]
pub enum FsError {
    /// Localized: part of the wire contract with the existing client.
    #[error("目标路径已存在: {0}")]
    AlreadyExists(String),

    /// Localized: names must be bare (no path separator).
    #[error("文件名不合法: {0}")]
    InvalidName(String),

    #[error("复制文件失败: {0}")]
    CopyFailed(String),

    #[error("移动文件失败: {0}")]
    MoveFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("{0}")]
    Other(String),
}

/// One directory entry on the wire. `modTime` is Unix milliseconds on every
/// backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mode: u32,
    pub mod_time: i64,
}

/// Capability set shared by the local and SFTP backends.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// The synthetic root: a single entry named "/" pointing at the
    /// configured root directory. Clients treat it as a one-element listing.
    async fn get_root(&self) -> Result<Vec<FsEntry>, FsError>;

    async fn list(&self, path: &str, show_hidden: bool) -> Result<Vec<FsEntry>, FsError>;

    async fn create(&self, parent: &str, name: &str, is_dir: bool) -> Result<(), FsError>;

    async fn delete(&self, path: &str) -> Result<(), FsError>;

    /// Rename in place; `new_name` is a basename, never a path.
    async fn rename(&self, old_path: &str, new_name: &str) -> Result<(), FsError>;

    /// Copy `src` *into* `dest`; an existing `dest/basename(src)` gets
    /// `" copy"` appended once.
    async fn copy(&self, src: &str, dest: &str) -> Result<(), FsError>;

    /// Move `src` into `dest` with the same collision rule as `copy`.
    async fn move_entry(&self, src: &str, dest: &str) -> Result<(), FsError>;
}

#[derive(Serialize, Deserialize, Default)]
struct ListData {
    #[serde(rename = "showHidden", default, skip_serializing_if = "std::ops::Not::not")]
    show_hidden: bool,
    #[serde(default)]
    entries: Vec<FsEntry>,
}

#[derive(Deserialize)]
struct CreateData {
    name: String,
    #[serde(rename = "isDir", default)]
    is_dir: bool,
}

#[derive(Deserialize)]
struct RenameData {
    #[serde(rename = "newName")]
    new_name: String,
}

#[derive(Deserialize)]
struct DestData {
    dest: String,
}

pub struct FsService {
    outbox: Outbox,
    fs: Arc<dyn Filesystem>,
}

impl FsService {
    pub fn new(outbox: Outbox, fs: Arc<dyn Filesystem>) -> Self {
        Self { outbox, fs }
    }
}

#[async_trait]
impl Service for FsService {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn handle(&self, id: &str, action: &str, data: Option<Value>) {
        let fs = self.fs.clone();
        let outbox = self.outbox.clone();
        let id = id.to_string();
        let action = action.to_string();
        tokio::spawn(async move {
            run_action(fs, outbox, id, action, data).await;
        });
    }

    async fn cleanup(&self, _cause: &TransportError) {}
}

async fn run_action(
    fs: Arc<dyn Filesystem>,
    outbox: Outbox,
    id: String,
    action: String,
    data: Option<Value>,
) {
    let result = match action.as_str() {
        ACTION_ROOT => fs.get_root().await.map(|root| {
            Some(serde_json::to_value(root).unwrap_or_default())
        }),
        ACTION_LIST => match decode::<ListData>(data) {
            Some(req) => fs.list(&id, req.show_hidden).await.map(|entries| {
                let body = ListData {
                    show_hidden: req.show_hidden,
                    entries,
                };
                Some(serde_json::to_value(body).unwrap_or_default())
            }),
            None => return,
        },
        ACTION_CREATE => match decode::<CreateData>(data) {
            Some(req) => fs.create(&id, &req.name, req.is_dir).await.map(|_| None),
            None => return,
        },
        ACTION_DELETE => fs.delete(&id).await.map(|_| None),
        ACTION_RENAME => match decode::<RenameData>(data) {
            Some(req) => fs.rename(&id, &req.new_name).await.map(|_| None),
            None => return,
        },
        ACTION_COPY => match decode::<DestData>(data) {
            Some(req) => fs.copy(&id, &req.dest).await.map(|_| None),
            None => return,
        },
        ACTION_MOVE => match decode::<DestData>(data) {
            Some(req) => fs.move_entry(&id, &req.dest).await.map(|_| None),
            None => return,
        },
        _ => {
            tracing::warn!(%id, %action, "unknown fs action");
            return;
        }
    };

    let envelope = match result {
        Ok(Some(body)) => Envelope::with_data("fs", &id, &action, body),
        Ok(None) => Envelope::ack("fs", &id, &action),
        Err(e) => {
            tracing::warn!(%id, %action, "fs action failed: {e}");
            Envelope::error("fs", &id, &action, e.to_string())
        }
    };
    let _ = outbox.send_json(&envelope).await;
}

fn decode<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Option<T> {
    let value = data.unwrap_or(Value::Null);
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::warn!("error decoding fs payload: {e}");
            None
        }
    }
}

/// Unix millis from a `SystemTime`; remote backends convert from seconds.
pub(crate) fn unix_millis(time: std::time::SystemTime) -> i64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageSink;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.0.lock().push(text);
            Ok(())
        }
        async fn send_binary(&mut self, _data: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&mut self) {}
    }

    fn service(root: std::path::PathBuf) -> (FsService, Arc<Mutex<Vec<String>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let outbox = Outbox::new(
            Box::new(RecordingSink(frames.clone())),
            CancellationToken::new(),
        );
        (
            FsService::new(outbox, Arc::new(LocalFs::new(root))),
            frames,
        )
    }

    async fn wait_for_frame(frames: &Arc<Mutex<Vec<String>>>, count: usize) -> Vec<Envelope> {
        for _ in 0..100 {
            if frames.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        frames
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn list_hides_dot_entries_by_default() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("visible.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let (svc, frames) = service(dir.path().to_path_buf());
        let id = dir.path().to_str().unwrap();

        svc.handle(id, ACTION_LIST, Some(serde_json::json!({}))).await;
        let envelopes = wait_for_frame(&frames, 1).await;

        let data: ListData =
            serde_json::from_value(envelopes[0].data.clone().unwrap()).unwrap();
        assert_eq!(data.entries.len(), 1);
        assert_eq!(data.entries[0].name, "visible.txt");
        assert!(!data.entries[0].is_dir);
    }

    #[tokio::test]
    async fn list_shows_hidden_on_request() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let (svc, frames) = service(dir.path().to_path_buf());
        let id = dir.path().to_str().unwrap();

        svc.handle(id, ACTION_LIST, Some(serde_json::json!({"showHidden": true})))
            .await;
        let envelopes = wait_for_frame(&frames, 1).await;

        let data: ListData =
            serde_json::from_value(envelopes[0].data.clone().unwrap()).unwrap();
        assert_eq!(data.entries.len(), 1);
        assert_eq!(data.entries[0].name, ".hidden");
    }

    #[tokio::test]
    async fn get_root_returns_single_synthetic_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, frames) = service(dir.path().to_path_buf());

        svc.handle("", ACTION_ROOT, None).await;
        let envelopes = wait_for_frame(&frames, 1).await;

        let root: Vec<FsEntry> =
            serde_json::from_value(envelopes[0].data.clone().unwrap()).unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "/");
        assert!(root[0].is_dir);
        assert_eq!(root[0].path, dir.path().to_str().unwrap());
    }

    #[tokio::test]
    async fn create_rejects_existing_target() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("taken"), b"x").unwrap();

        let (svc, frames) = service(dir.path().to_path_buf());
        let id = dir.path().to_str().unwrap();

        svc.handle(id, ACTION_CREATE, Some(serde_json::json!({"name": "taken"})))
            .await;
        let envelopes = wait_for_frame(&frames, 1).await;

        let error = envelopes[0].error.as_deref().unwrap();
        assert!(error.starts_with("目标路径已存在"), "got: {error}");
    }

    #[tokio::test]
    async fn rename_rejects_slash_in_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("file");
        std::fs::write(&target, b"x").unwrap();

        let (svc, frames) = service(dir.path().to_path_buf());

        svc.handle(
            target.to_str().unwrap(),
            ACTION_RENAME,
            Some(serde_json::json!({"newName": "evil/name"})),
        )
        .await;
        let envelopes = wait_for_frame(&frames, 1).await;

        let error = envelopes[0].error.as_deref().unwrap();
        assert!(error.starts_with("文件名不合法"), "got: {error}");
        assert!(target.exists());
    }

    #[tokio::test]
    async fn delete_acks_and_removes_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let victim = dir.path().join("doomed");
        std::fs::create_dir(&victim).unwrap();
        std::fs::write(victim.join("inner"), b"x").unwrap();

        let (svc, frames) = service(dir.path().to_path_buf());

        svc.handle(victim.to_str().unwrap(), ACTION_DELETE, None).await;
        let envelopes = wait_for_frame(&frames, 1).await;

        assert!(envelopes[0].error.is_none());
        assert_eq!(envelopes[0].action, "delete");
        assert!(!victim.exists());
    }
}
