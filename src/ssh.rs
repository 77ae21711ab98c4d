//! SSH target registry and session plumbing.
//!
//! `POST /shell/ssh` authenticates once against the remote host and stores
//! the verified target here under a fresh UUID. Every attachment made later
//! (shell, filesystem, upload, downloader) dials its own `ssh2::Session`
//! from the stored target: libssh2 serializes all channel I/O on a session
//! behind one lock, so sharing a session between an interactive PTY read and
//! SFTP traffic would stall both. The registry is process-memory only and
//! owned by the HTTP layer; session teardown never closes it.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use ssh2::Session;
use thiserror::Error;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL_SECS: u32 = 30;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("invalid ssh address {0}")]
    Address(String),

    #[error("tcp connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("ssh i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh protocol error: {0}")]
    Proto(#[from] ssh2::Error),

    #[error("ssh authentication failed")]
    AuthFailed,

    #[error("remote command exited with status {status}")]
    CommandFailed { status: i32, output: String },

    #[error("ssh worker task failed")]
    Worker,
}

/// An authenticated SSH destination. Password auth only; host-key
/// verification is intentionally skipped here and left to the deployment
/// (see the HTTP layer's login handler).
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    password: String,
}

impl SshTarget {
    pub fn new(host: String, port: u16, username: String, password: String) -> Self {
        Self {
            host,
            port,
            username,
            password,
        }
    }

    /// Dial and authenticate a fresh session. Blocking; call from
    /// `spawn_blocking` in async contexts.
    pub fn connect(&self) -> Result<Session, SshError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| SshError::Address(format!("{}:{}", self.host, self.port)))?
            .next()
            .ok_or_else(|| SshError::Address(format!("{}:{}", self.host, self.port)))?;

        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(SshError::Connect)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_password(&self.username, &self.password)?;
        if !session.authenticated() {
            return Err(SshError::AuthFailed);
        }
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
        Ok(session)
    }

    /// `connect` on the blocking pool.
    pub async fn connect_async(self: &Arc<Self>) -> Result<Session, SshError> {
        let target = Arc::clone(self);
        tokio::task::spawn_blocking(move || target.connect())
            .await
            .map_err(|_| SshError::Worker)?
    }
}

/// Run a command over a fresh channel and collect its output. Blocking.
pub fn run_command(session: &Session, command: &str) -> Result<String, SshError> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;
    let mut output = String::new();
    channel.read_to_string(&mut output)?;
    channel.wait_close()?;
    let status = channel.exit_status()?;
    if status != 0 {
        return Err(SshError::CommandFailed { status, output });
    }
    Ok(output)
}

/// Process-wide `uuid → target` map. Owned by the HTTP layer; connections
/// only read it to attach services to an already-authenticated destination.
#[derive(Clone, Default)]
pub struct SshRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<SshTarget>>>>,
}

impl SshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, target: SshTarget) -> String {
        let id = Uuid::new_v4().to_string();
        self.inner.write().insert(id.clone(), Arc::new(target));
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<SshTarget>> {
        self.inner.read().get(id).cloned()
    }
}
