//! SSH shells: a PTY-backed login shell on a remote host.
//!
//! Each shell dials its own `ssh2::Session` (see `crate::ssh` for why) and
//! is driven by one dedicated thread. The channel is kept in non-blocking
//! mode for reads and flipped to blocking around writes and window-change
//! requests; the thread multiplexes terminal output against a control
//! channel carrying input, resizes, and the close signal.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::ssh::{SshError, SshTarget};

use super::{Shell, ShellBackend, ShellError, SpawnedShell};

impl From<ssh2::Error> for ShellError {
    fn from(e: ssh2::Error) -> Self {
        ShellError::Ssh(SshError::Proto(e))
    }
}

const OUTPUT_CHANNEL_DEPTH: usize = 64;
const READ_BUF_SIZE: usize = 4096;
/// Poll interval while the remote side is quiet.
const IDLE_POLL: Duration = Duration::from_millis(20);

enum ControlMsg {
    Input(Bytes),
    Resize { rows: u16, cols: u16 },
    Close,
}

pub struct SshShellBackend {
    target: Arc<SshTarget>,
}

impl SshShellBackend {
    pub fn new(target: Arc<SshTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ShellBackend for SshShellBackend {
    async fn spawn(&self, _cwd: Option<&str>) -> Result<SpawnedShell, ShellError> {
        let target = Arc::clone(&self.target);

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::task::spawn_blocking(move || {
            let session = target.connect()?;
            let mut channel = session.channel_session()?;
            channel.request_pty("xterm-256color", None, Some((80, 24, 0, 0)))?;
            channel.shell()?;

            thread::spawn(move || drive_channel(session, channel, output_tx, control_rx));
            Ok::<_, ShellError>(())
        })
        .await
        .map_err(|_| ShellError::Closed)??;

        Ok(SpawnedShell {
            shell: Arc::new(SshShell { control_tx }),
            output: output_rx,
        })
    }
}

struct SshShell {
    control_tx: mpsc::UnboundedSender<ControlMsg>,
}

#[async_trait]
impl Shell for SshShell {
    async fn write(&self, data: Bytes) -> Result<(), ShellError> {
        self.control_tx
            .send(ControlMsg::Input(data))
            .map_err(|_| ShellError::Closed)
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), ShellError> {
        self.control_tx
            .send(ControlMsg::Resize { rows, cols })
            .map_err(|_| ShellError::Closed)
    }

    fn close(&self) {
        let _ = self.control_tx.send(ControlMsg::Close);
    }
}

/// Owns the session for the lifetime of one shell. Exits on channel EOF,
/// I/O failure, or a close signal; dropping the control receiver afterwards
/// makes every later write fail, which the service reads as shell death.
fn drive_channel(
    session: ssh2::Session,
    mut channel: ssh2::Channel,
    output_tx: mpsc::Sender<Bytes>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    session.set_blocking(false);

    'outer: loop {
        loop {
            match control_rx.try_recv() {
                Ok(ControlMsg::Input(data)) => {
                    session.set_blocking(true);
                    let result = channel.write_all(&data).and_then(|_| channel.flush());
                    session.set_blocking(false);
                    if result.is_err() {
                        break 'outer;
                    }
                }
                Ok(ControlMsg::Resize { rows, cols }) => {
                    session.set_blocking(true);
                    let _ = channel.request_pty_size(u32::from(cols), u32::from(rows), None, None);
                    session.set_blocking(false);
                }
                Ok(ControlMsg::Close) => break 'outer,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'outer,
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx
                    .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if channel.eof() {
                    break;
                }
                thread::sleep(IDLE_POLL);
            }
            Err(_) => break,
        }
    }

    session.set_blocking(true);
    let _ = channel.close();
}
