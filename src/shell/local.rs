//! Local shells: a PTY running `bash -l`.
//!
//! portable-pty hands out blocking reader/writer handles, so each shell gets
//! two dedicated threads bridging them onto tokio channels: one copying PTY
//! output into the output channel, one draining the input channel into the
//! PTY. The async side only ever touches channels.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

use crate::pty::Pty;

use super::{Shell, ShellBackend, ShellError, SpawnedShell};

const OUTPUT_CHANNEL_DEPTH: usize = 64;
const INPUT_CHANNEL_DEPTH: usize = 64;
const READ_BUF_SIZE: usize = 4096;

pub struct LocalShellBackend {
    default_cwd: PathBuf,
}

impl LocalShellBackend {
    pub fn new(default_cwd: PathBuf) -> Self {
        Self { default_cwd }
    }
}

#[async_trait]
impl ShellBackend for LocalShellBackend {
    async fn spawn(&self, cwd: Option<&str>) -> Result<SpawnedShell, ShellError> {
        let cwd = match cwd {
            Some(cwd) => PathBuf::from(cwd),
            None => self.default_cwd.clone(),
        };

        let pty = tokio::task::spawn_blocking(move || Pty::spawn(24, 80, &cwd))
            .await
            .map_err(|_| ShellError::Closed)??;

        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;
        let pty = Arc::new(Mutex::new(pty));

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        thread::spawn(move || read_pty(reader, output_tx));

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);
        thread::spawn(move || write_pty(writer, input_rx));

        Ok(SpawnedShell {
            shell: Arc::new(LocalShell { pty, input_tx }),
            output: output_rx,
        })
    }
}

struct LocalShell {
    pty: Arc<Mutex<Pty>>,
    input_tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl Shell for LocalShell {
    async fn write(&self, data: Bytes) -> Result<(), ShellError> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| ShellError::Closed)
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), ShellError> {
        self.pty.lock().resize(rows, cols)?;
        Ok(())
    }

    fn close(&self) {
        self.pty.lock().kill();
    }
}

fn read_pty(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx
                    .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                    .is_err()
                {
                    break;
                }
            }
            // EIO is the normal way a Linux PTY reports child exit.
            Err(_) => break,
        }
    }
}

fn write_pty(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = input_rx.blocking_recv() {
        if writer.write_all(&data).is_err() || writer.flush().is_err() {
            break;
        }
    }
    // Dropping the receiver fails pending and future sends, which the
    // service treats as a dead shell.
}
