//! Interactive shell service: multiple named terminals multiplexed onto one
//! connection.
//!
//! Each shell is keyed by the envelope `id`. Lifecycle: `start{cwd}` creates
//! it, `command` writes keystrokes, `resize` adjusts the window, `terminate`
//! (or stream EOF, or connection teardown) destroys it. Output is forwarded
//! to the client as `command` envelopes whose `data` is the JSON-encoded
//! string of the raw terminal bytes.

mod local;
mod ssh;

pub use local::LocalShellBackend;
pub use ssh::SshShellBackend;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Envelope;
use crate::pty::PtyError;
use crate::service::Service;
use crate::ssh::SshError;
use crate::transport::{Outbox, TransportError};

const ACTION_START: &str = "start";
const ACTION_COMMAND: &str = "command";
const ACTION_RESIZE: &str = "resize";
const ACTION_TERMINATE: &str = "terminate";

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("shell closed")]
    Closed,

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("shell i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct StartPayload {
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

/// One running terminal. Input and resize go through the handle; output
/// arrives on the channel returned at spawn time.
#[async_trait]
pub trait Shell: Send + Sync {
    async fn write(&self, data: Bytes) -> Result<(), ShellError>;
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), ShellError>;
    /// Terminate the underlying process/channel. Idempotent.
    fn close(&self);
}

/// A spawned shell plus its merged stdout/stderr stream.
pub struct SpawnedShell {
    pub shell: Arc<dyn Shell>,
    pub output: mpsc::Receiver<Bytes>,
}

/// Backend deciding what a shell *is*: a local PTY or an SSH channel.
#[async_trait]
pub trait ShellBackend: Send + Sync {
    async fn spawn(&self, cwd: Option<&str>) -> Result<SpawnedShell, ShellError>;
}

type ShellMap = Arc<RwLock<HashMap<String, Arc<dyn Shell>>>>;

pub struct ShellService {
    outbox: Outbox,
    backend: Box<dyn ShellBackend>,
    shells: ShellMap,
}

impl ShellService {
    pub fn new(outbox: Outbox, backend: Box<dyn ShellBackend>) -> Self {
        Self {
            outbox,
            backend,
            shells: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn handle_start(&self, id: &str, data: Option<Value>) {
        let cwd = match data {
            None => None,
            Some(value) => match serde_json::from_value::<StartPayload>(value) {
                Ok(payload) => payload.cwd.filter(|cwd| !cwd.is_empty()),
                Err(e) => {
                    tracing::warn!(id, "error decoding start payload: {e}");
                    return;
                }
            },
        };

        let spawned = match self.backend.spawn(cwd.as_deref()).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(id, "error starting shell: {e}");
                let _ = self
                    .outbox
                    .send_json(&Envelope::error(self.name(), id, ACTION_START, e.to_string()))
                    .await;
                return;
            }
        };

        self.shells
            .write()
            .insert(id.to_string(), spawned.shell.clone());

        let _ = self
            .outbox
            .send_json(&Envelope::ack(self.name(), id, ACTION_START))
            .await;

        tokio::spawn(forward_output(
            self.outbox.clone(),
            self.shells.clone(),
            id.to_string(),
            spawned.output,
        ));
    }

    async fn handle_command(&self, id: &str, shell: &Arc<dyn Shell>, data: Option<Value>) {
        let command = match data {
            Some(Value::String(text)) => text,
            other => {
                tracing::warn!(id, "error decoding command payload: {other:?}");
                return;
            }
        };
        if let Err(e) = shell.write(Bytes::from(command.into_bytes())).await {
            tracing::warn!(id, "error writing to shell: {e}");
            // A dead shell (the user typed `exit`) leaves the tab unusable;
            // dropping the whole connection triggers the client's reconnect.
            self.outbox.close();
        }
    }

    async fn handle_resize(&self, id: &str, shell: &Arc<dyn Shell>, data: Option<Value>) {
        let payload = match data.map(serde_json::from_value::<ResizePayload>) {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                tracing::warn!(id, "error decoding resize payload: {e}");
                return;
            }
            None => {
                tracing::warn!(id, "resize without dimensions");
                return;
            }
        };
        if let Err(e) = shell.resize(payload.rows, payload.cols).await {
            tracing::warn!(id, "error resizing shell: {e}");
        }
    }
}

/// Copy shell output to the transport until EOF, then drop the entry.
async fn forward_output(
    outbox: Outbox,
    shells: ShellMap,
    id: String,
    mut output: mpsc::Receiver<Bytes>,
) {
    while let Some(chunk) = output.recv().await {
        let data = Value::String(String::from_utf8_lossy(&chunk).into_owned());
        if outbox
            .send_json(&Envelope::with_data("shell", &id, ACTION_COMMAND, data))
            .await
            .is_err()
        {
            break;
        }
    }
    if let Some(shell) = shells.write().remove(&id) {
        shell.close();
    }
}

#[async_trait]
impl Service for ShellService {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn handle(&self, id: &str, action: &str, data: Option<Value>) {
        let existing = self.shells.read().get(id).cloned();

        match (action, existing) {
            (ACTION_START, Some(_)) => {
                tracing::warn!(id, "received start message after terminal started");
            }
            (ACTION_START, None) => self.handle_start(id, data).await,
            (_, None) => {
                tracing::warn!(id, action, "received message before terminal started");
            }
            (ACTION_COMMAND, Some(shell)) => self.handle_command(id, &shell, data).await,
            (ACTION_RESIZE, Some(shell)) => self.handle_resize(id, &shell, data).await,
            (ACTION_TERMINATE, Some(shell)) => {
                shell.close();
                self.shells.write().remove(id);
            }
            (_, Some(_)) => {
                tracing::warn!(id, action, "unknown shell action");
            }
        }
    }

    async fn cleanup(&self, _cause: &TransportError) {
        let shells = std::mem::take(&mut *self.shells.write());
        for (_, shell) in shells {
            shell.close();
        }
    }
}
