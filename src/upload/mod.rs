//! Resumable chunked uploads with integrity verification.
//!
//! Control flow rides the text channel; chunk bytes arrive as binary frames.
//! A `chunk` action posts a binary claim immediately (fixing its FIFO slot
//! relative to other services) and queues the pending slot; a single pairing
//! task awaits each slot in order and appends the bytes, so writes for one
//! session never race. Lifecycle actions are handled inline on the text
//! consumer to preserve their ordering.

mod backend;

pub use backend::{
    LocalUploadBackend, PathKind, SftpUploadBackend, UploadBackend, UploadError, UploadSink,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::BinaryClaims;
use crate::protocol::Envelope;
use crate::service::Service;
use crate::transport::{Outbox, TransportError};

const ACTION_START_SESSION: &str = "start_session";
const ACTION_COMPLETE_SESSION: &str = "complete_session";
const ACTION_CANCEL_SESSION: &str = "cancel_session";
const ACTION_START_FILE: &str = "start_file";
const ACTION_COMPLETE_FILE: &str = "complete_file";
const ACTION_CHUNK: &str = "chunk";
const ACTION_MKDIR: &str = "mkdir";

const POLICY_SKIP: &str = "skip";
const POLICY_RENAME: &str = "rename";

const SERVICE_NAME: &str = "upload";

#[derive(Deserialize, Default)]
struct StartSessionData {
    #[serde(default)]
    policy: String,
}

#[derive(Deserialize)]
struct StartFileData {
    path: String,
}

#[derive(Deserialize)]
struct ChunkData {
    progress: u64,
}

#[derive(Deserialize)]
struct CompleteFileData {
    #[serde(default)]
    digest: String,
}

struct FileState {
    file: Option<Box<dyn UploadSink>>,
    /// Path of the currently open file, kept for integrity-failure cleanup.
    current: Option<String>,
    hasher: Sha256,
}

impl FileState {
    fn new() -> Self {
        Self {
            file: None,
            current: None,
            hasher: Sha256::new(),
        }
    }
}

/// One client-driven multi-file transfer rooted at a destination path.
struct UploadSession {
    /// Effective destination; differs from the session id under `rename`.
    dest: String,
    policy: String,
    state: tokio::sync::Mutex<FileState>,
}

struct PendingChunk {
    id: String,
    progress: u64,
    slot: oneshot::Receiver<Bytes>,
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<UploadSession>>>>;

pub struct UploadService {
    outbox: Outbox,
    backend: Arc<dyn UploadBackend>,
    claims: BinaryClaims,
    sessions: SessionMap,
    meta_tx: mpsc::Sender<PendingChunk>,
}

impl UploadService {
    pub fn new(outbox: Outbox, backend: Arc<dyn UploadBackend>, claims: BinaryClaims) -> Self {
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let (meta_tx, meta_rx) = mpsc::channel(1);

        tokio::spawn(pair_chunks(
            meta_rx,
            sessions.clone(),
            backend.clone(),
            outbox.clone(),
        ));

        Self {
            outbox,
            backend,
            claims,
            sessions,
            meta_tx,
        }
    }

    fn session(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.read().get(id).cloned()
    }

    async fn ack(&self, id: &str, action: &str) {
        let _ = self
            .outbox
            .send_json(&Envelope::ack(SERVICE_NAME, id, action))
            .await;
    }

    async fn reply(&self, id: &str, action: &str, data: Value) {
        let _ = self
            .outbox
            .send_json(&Envelope::with_data(SERVICE_NAME, id, action, data))
            .await;
    }

    async fn fail(&self, id: &str, action: &str, message: String) {
        tracing::warn!(id, action, "{message}");
        let _ = self
            .outbox
            .send_json(&Envelope::error(SERVICE_NAME, id, action, message))
            .await;
    }

    async fn handle_start_session(&self, id: &str, data: Option<Value>) {
        let Some(req) = decode_or_default::<StartSessionData>(data) else {
            return;
        };

        let exists = self.backend.stat(id).await.is_some();
        if req.policy.is_empty() && exists {
            // Ask the client what to do before touching anything.
            self.reply(id, ACTION_START_SESSION, serde_json::json!({"needConfirm": true}))
                .await;
            return;
        }

        let dest = if req.policy == POLICY_RENAME {
            unique_filename(self.backend.as_ref(), id).await
        } else {
            id.to_string()
        };

        self.sessions.write().insert(
            id.to_string(),
            Arc::new(UploadSession {
                dest,
                policy: req.policy,
                state: tokio::sync::Mutex::new(FileState::new()),
            }),
        );

        self.reply(id, ACTION_START_SESSION, serde_json::json!({"needConfirm": false}))
            .await;
    }

    async fn handle_mkdir(&self, id: &str, data: Option<Value>) {
        let Some(Value::String(path)) = data else {
            tracing::warn!(id, "error decoding mkdir data");
            return;
        };
        if let Err(e) = self.backend.mkdir_all(&path).await {
            self.fail(id, ACTION_MKDIR, format!("上传失败: 创建文件夹失败: {e}"))
                .await;
            return;
        }
        self.ack(id, ACTION_MKDIR).await;
    }

    async fn handle_start_file(&self, id: &str, data: Option<Value>) {
        let Some(session) = self.session(id) else {
            tracing::warn!(id, "session not found, cannot start file");
            return;
        };

        let mut state = session.state.lock().await;
        if state.file.is_some() {
            tracing::warn!(id, "didn't finish previous file, cannot start new one");
            return;
        }

        let Some(req) = decode::<StartFileData>(data) else {
            return;
        };

        let relative = session_relative(id, &req.path);
        let mut dest = join_under(&session.dest, &relative);

        let existing = self.backend.stat(&dest).await;
        if existing.is_some() && session.policy == POLICY_SKIP {
            drop(state);
            self.reply(id, ACTION_START_FILE, serde_json::json!({"skip": true}))
                .await;
            return;
        }

        if let Err(e) = self.backend.mkdir_all(parent_of(&dest)).await {
            drop(state);
            self.fail(id, ACTION_START_FILE, e.to_string()).await;
            return;
        }

        // A directory at the destination means the client sent an empty or
        // bogus filename; park the content beside it instead of failing.
        if existing == Some(PathKind::Directory) {
            dest = join_under(&dest, &format!("_{}", unix_time()));
        }

        match self.backend.open_file(&dest).await {
            Ok(file) => {
                state.file = Some(file);
                state.current = Some(dest);
                state.hasher = Sha256::new();
                drop(state);
                self.reply(id, ACTION_START_FILE, serde_json::json!({"skip": false}))
                    .await;
            }
            Err(e) => {
                drop(state);
                self.fail(id, ACTION_START_FILE, e.to_string()).await;
            }
        }
    }

    async fn handle_chunk(&self, id: &str, data: Option<Value>) {
        let Some(req) = decode::<ChunkData>(data) else {
            return;
        };
        // Fix this chunk's position in the connection-wide binary FIFO now;
        // the pairing task consumes the slot later.
        let Some(slot) = self.claims.post() else {
            return;
        };
        let _ = self
            .meta_tx
            .send(PendingChunk {
                id: id.to_string(),
                progress: req.progress,
                slot,
            })
            .await;
    }

    async fn handle_complete_file(&self, id: &str, data: Option<Value>) {
        let Some(session) = self.session(id) else {
            tracing::warn!(id, "session not found, cannot complete file");
            return;
        };

        let mut state = session.state.lock().await;
        let Some(mut file) = state.file.take() else {
            return;
        };
        let _ = file.close().await;
        let local = hex::encode(std::mem::replace(&mut state.hasher, Sha256::new()).finalize());
        let written_path = state.current.take();
        drop(state);

        let Some(req) = decode::<CompleteFileData>(data) else {
            return;
        };

        if local != req.digest {
            tracing::warn!(id, %local, peer = %req.digest, "hash mismatch");
            self.fail(id, ACTION_COMPLETE_FILE, "上传失败: 文件完整性校验失败".to_string())
                .await;
            if let Some(path) = written_path {
                let backend = self.backend.clone();
                tokio::spawn(async move {
                    let _ = backend.delete_path(&path).await;
                });
            }
            return;
        }

        self.ack(id, ACTION_COMPLETE_FILE).await;
    }

    async fn handle_complete_session(&self, id: &str) {
        let Some(session) = self.session(id) else {
            tracing::warn!(id, "session not found, cannot complete session");
            return;
        };

        let mut state = session.state.lock().await;
        if let Some(mut file) = state.file.take() {
            let _ = file.close().await;
        }
        drop(state);

        self.sessions.write().remove(id);
        self.ack(id, ACTION_COMPLETE_SESSION).await;
    }

    async fn handle_cancel_session(&self, id: &str) {
        let Some(session) = self.session(id) else {
            tracing::warn!(id, "session not found, cannot cancel");
            return;
        };

        let mut state = session.state.lock().await;
        if let Some(mut file) = state.file.take() {
            let _ = file.close().await;
        }
        drop(state);

        let backend = self.backend.clone();
        let dest = session.dest.clone();
        tokio::spawn(async move {
            let _ = backend.delete_path(&dest).await;
        });

        self.sessions.write().remove(id);
        self.ack(id, ACTION_CANCEL_SESSION).await;
    }
}

#[async_trait]
impl Service for UploadService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn handle(&self, id: &str, action: &str, data: Option<Value>) {
        match action {
            ACTION_START_SESSION => self.handle_start_session(id, data).await,
            ACTION_COMPLETE_SESSION => self.handle_complete_session(id).await,
            ACTION_CANCEL_SESSION => self.handle_cancel_session(id).await,
            ACTION_START_FILE => self.handle_start_file(id, data).await,
            ACTION_COMPLETE_FILE => self.handle_complete_file(id, data).await,
            ACTION_MKDIR => self.handle_mkdir(id, data).await,
            ACTION_CHUNK => self.handle_chunk(id, data).await,
            _ => tracing::warn!(id, action, "unknown upload action"),
        }
    }

    async fn cleanup(&self, cause: &TransportError) {
        tracing::info!("upload teardown: {cause}");
        let sessions = std::mem::take(&mut *self.sessions.write());
        for (_, session) in sessions {
            let mut state = session.state.lock().await;
            if let Some(mut file) = state.file.take() {
                let _ = file.close().await;
                // Partial transfer; the destination is not worth keeping.
                let backend = self.backend.clone();
                let dest = session.dest.clone();
                tokio::spawn(async move {
                    let _ = backend.delete_path(&dest).await;
                });
            }
        }
    }
}

/// Pair queued chunk metadata with claimed binary frames, in order.
async fn pair_chunks(
    mut meta_rx: mpsc::Receiver<PendingChunk>,
    sessions: SessionMap,
    backend: Arc<dyn UploadBackend>,
    outbox: Outbox,
) {
    while let Some(pending) = meta_rx.recv().await {
        let Ok(data) = pending.slot.await else {
            // Connection torn down before the frame arrived; keep draining
            // so queued metas never back up the text consumer.
            continue;
        };
        write_chunk(&sessions, &backend, &outbox, pending.id, pending.progress, data).await;
    }
}

async fn write_chunk(
    sessions: &SessionMap,
    backend: &Arc<dyn UploadBackend>,
    outbox: &Outbox,
    id: String,
    mut progress: u64,
    data: Bytes,
) {
    let session = sessions.read().get(&id).cloned();
    let Some(session) = session else {
        tracing::warn!(%id, "chunk for unknown session");
        return;
    };

    let mut state = session.state.lock().await;
    let Some(file) = state.file.as_mut() else {
        tracing::warn!(%id, "chunk with no open file");
        return;
    };

    match file.write(data.clone()).await {
        Ok(written) => {
            state.hasher.update(&data);
            progress += written as u64;
            drop(state);
            let _ = outbox
                .send_json(&Envelope::with_data(
                    SERVICE_NAME,
                    &id,
                    ACTION_CHUNK,
                    serde_json::json!({"progress": progress}),
                ))
                .await;
        }
        Err(e) => {
            let mut message = e.to_string();
            if message.contains("quota exceeded") {
                message = "磁盘空间不足".to_string();
            }
            let message = format!("上传失败: {message}");
            tracing::warn!(%id, "{message}");

            if let Some(mut file) = state.file.take() {
                let _ = file.close().await;
            }
            state.current = None;
            drop(state);

            let _ = outbox
                .send_json(&Envelope::error(SERVICE_NAME, &id, ACTION_CHUNK, message))
                .await;

            let backend = backend.clone();
            let dest = session.dest.clone();
            tokio::spawn(async move {
                let _ = backend.delete_path(&dest).await;
            });
        }
    }
}

/// `base_N.ext` (or `base_N/` for directories) for the least free N ≥ 1.
async fn unique_filename(backend: &dyn UploadBackend, path: &str) -> String {
    let (base, suffix) = if let Some(stripped) = path.strip_suffix('/') {
        (stripped, "/")
    } else if let Some(idx) = path.rfind('.') {
        (&path[..idx], &path[idx..])
    } else {
        (path, "")
    };

    let mut n = 1u64;
    loop {
        let candidate = format!("{base}_{n}{suffix}");
        if backend.stat(&candidate).await.is_none() {
            return candidate;
        }
        n += 1;
    }
}

/// Strip the session id prefix from a client path and normalize it, so file
/// destinations stay rooted under the (possibly renamed) session dest.
fn session_relative(id: &str, path: &str) -> String {
    match path.strip_prefix(id) {
        Some(stripped) => clean_path(stripped).trim_start_matches('/').to_string(),
        None => path.to_string(),
    }
}

/// Lexical path cleanup: collapse separators, drop `.`, resolve `..`.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

fn join_under(dest: &str, relative: &str) -> String {
    if relative.is_empty() {
        dest.to_string()
    } else {
        format!("{}/{}", dest.trim_end_matches('/'), relative)
    }
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn decode<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Option<T> {
    match serde_json::from_value(data.unwrap_or(Value::Null)) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::warn!("error decoding upload payload: {e}");
            None
        }
    }
}

/// Like [`decode`], but an absent document means "all defaults".
fn decode_or_default<T: serde::de::DeserializeOwned + Default>(data: Option<Value>) -> Option<T> {
    match data {
        None => Some(T::default()),
        Some(value) => match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!("error decoding upload payload: {e}");
                None
            }
        },
    }
}
