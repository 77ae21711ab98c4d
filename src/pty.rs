use portable_pty::{native_pty_system, Child, CommandBuilder, PtyPair, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// A login shell running inside a pseudo-terminal.
///
/// The interactive terminal contract is a `bash -l` with a 256-color TERM;
/// the browser-side emulator negotiates everything else in-band.
pub struct Pty {
    pair: PtyPair,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl Pty {
    /// Spawn `bash -l` in a fresh PTY rooted at `cwd`.
    pub fn spawn(rows: u16, cols: u16, cwd: &Path) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new("bash");
        cmd.arg("-l");
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;

        Ok(Self {
            pair,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.pair
            .master
            .try_clone_reader()
            .map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.pair.master.take_writer().map_err(PtyError::TakeWriter)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pair
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    /// Kill the child process. The reader unblocks with EOF/EIO shortly
    /// after.
    pub fn kill(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.kill();
        }
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Read from the PTY on a helper thread so a wedged shell cannot hang
    /// the test; returns whatever arrived before the timeout.
    fn read_with_timeout(mut reader: Box<dyn Read + Send>, timeout: Duration) -> Vec<u8> {
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            let mut collected = Vec::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        collected.extend_from_slice(&buf[..n]);
                        let _ = tx.send(collected.clone());
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(_) => break,
                }
            }
        });

        rx.recv_timeout(timeout).unwrap_or_default()
    }

    #[test]
    fn spawn_creates_login_shell() {
        let pty = Pty::spawn(24, 80, Path::new("/tmp"));
        assert!(pty.is_ok(), "failed to spawn PTY: {:?}", pty.err());
    }

    #[test]
    fn write_and_read_roundtrip() {
        let pty = Pty::spawn(24, 80, Path::new("/tmp")).expect("failed to spawn PTY");
        let mut writer = pty.take_writer().expect("failed to get writer");
        let reader = pty.take_reader().expect("failed to get reader");

        let marker = "WEBSHELL_TEST_12345";
        writer
            .write_all(format!("echo {}\n", marker).as_bytes())
            .expect("write failed");
        writer.flush().expect("flush failed");

        let output = read_with_timeout(reader, Duration::from_secs(5));
        let output_str = String::from_utf8_lossy(&output);
        assert!(
            output_str.contains(marker),
            "expected output to contain '{}', got: {}",
            marker,
            output_str
        );
    }

    #[test]
    fn spawn_honors_cwd() {
        let pty = Pty::spawn(24, 80, Path::new("/tmp")).expect("failed to spawn PTY");
        let mut writer = pty.take_writer().expect("failed to get writer");
        let reader = pty.take_reader().expect("failed to get reader");

        writer.write_all(b"pwd\n").expect("write failed");
        writer.flush().expect("flush failed");

        let output = read_with_timeout(reader, Duration::from_secs(5));
        let output_str = String::from_utf8_lossy(&output);
        assert!(
            output_str.contains("/tmp"),
            "expected cwd in output, got: {}",
            output_str
        );
    }

    #[test]
    fn resize_succeeds_repeatedly() {
        let pty = Pty::spawn(24, 80, Path::new("/tmp")).expect("failed to spawn PTY");
        assert!(pty.resize(40, 120).is_ok());
        assert!(pty.resize(25, 100).is_ok());
    }
}
