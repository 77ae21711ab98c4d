//! Storage backends for the upload service.
//!
//! The service only needs four capabilities: stat, recursive delete,
//! mkdir-all, and opening a destination for writing. Destination files are
//! opened create+write-only, never truncated; the overwrite policy relies on
//! the client re-sending the full content.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use ssh2::{OpenFlags, OpenType, Session, Sftp};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::ssh::{SshError, SshTarget};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("upload worker failed")]
    Worker,
}

impl From<ssh2::Error> for UploadError {
    fn from(e: ssh2::Error) -> Self {
        UploadError::Ssh(SshError::Proto(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
}

/// An open destination file.
#[async_trait]
pub trait UploadSink: Send {
    /// Append a chunk; returns the number of bytes written.
    async fn write(&mut self, data: Bytes) -> Result<usize, UploadError>;
    async fn close(&mut self) -> Result<(), UploadError>;
}

#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// `None` when the path does not exist.
    async fn stat(&self, path: &str) -> Option<PathKind>;

    /// Recursive delete; must clean partial directory uploads too.
    async fn delete_path(&self, path: &str) -> Result<(), UploadError>;

    async fn mkdir_all(&self, path: &str) -> Result<(), UploadError>;

    async fn open_file(&self, path: &str) -> Result<Box<dyn UploadSink>, UploadError>;
}

// ── Local ──────────────────────────────────────────────────────────

pub struct LocalUploadBackend;

#[async_trait]
impl UploadBackend for LocalUploadBackend {
    async fn stat(&self, path: &str) -> Option<PathKind> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => Some(PathKind::Directory),
            Ok(_) => Some(PathKind::File),
            Err(_) => None,
        }
    }

    async fn delete_path(&self, path: &str) -> Result<(), UploadError> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => Ok(tokio::fs::remove_dir_all(path).await?),
            Ok(_) => Ok(tokio::fs::remove_file(path).await?),
            Err(_) => Ok(()),
        }
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn UploadSink>, UploadError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .await?;
        Ok(Box::new(LocalSink(Some(file))))
    }
}

struct LocalSink(Option<tokio::fs::File>);

#[async_trait]
impl UploadSink for LocalSink {
    async fn write(&mut self, data: Bytes) -> Result<usize, UploadError> {
        let file = self
            .0
            .as_mut()
            .ok_or_else(|| std::io::Error::other("file closed"))?;
        file.write_all(&data).await?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), UploadError> {
        if let Some(mut file) = self.0.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

// ── SFTP ───────────────────────────────────────────────────────────

pub struct SftpUploadBackend {
    sftp: Arc<Mutex<Sftp>>,
}

impl SftpUploadBackend {
    pub async fn connect(target: Arc<SshTarget>) -> Result<Self, UploadError> {
        let sftp = tokio::task::spawn_blocking(move || {
            let session: Session = target.connect()?;
            Ok::<_, UploadError>(session.sftp()?)
        })
        .await
        .map_err(|_| UploadError::Worker)??;

        Ok(Self {
            sftp: Arc::new(Mutex::new(sftp)),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, UploadError>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T, UploadError> + Send + 'static,
    {
        let sftp = Arc::clone(&self.sftp);
        tokio::task::spawn_blocking(move || op(&sftp.lock()))
            .await
            .map_err(|_| UploadError::Worker)?
    }
}

fn sftp_delete_tree(sftp: &Sftp, path: &str) -> Result<(), UploadError> {
    let stat = sftp.stat(Path::new(path))?;
    if !stat.is_dir() {
        sftp.unlink(Path::new(path))?;
        return Ok(());
    }
    for (child, _) in sftp.readdir(Path::new(path))? {
        sftp_delete_tree(sftp, &child.to_string_lossy())?;
    }
    sftp.rmdir(Path::new(path))?;
    Ok(())
}

#[async_trait]
impl UploadBackend for SftpUploadBackend {
    async fn stat(&self, path: &str) -> Option<PathKind> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            Ok(sftp.stat(Path::new(&path)).ok().map(|stat| {
                if stat.is_dir() {
                    PathKind::Directory
                } else {
                    PathKind::File
                }
            }))
        })
        .await
        .ok()
        .flatten()
    }

    async fn delete_path(&self, path: &str) -> Result<(), UploadError> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            if sftp.stat(Path::new(&path)).is_err() {
                return Ok(());
            }
            sftp_delete_tree(sftp, &path)
        })
        .await
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), UploadError> {
        let path = path.to_string();
        self.blocking(move |sftp| {
            let mut current = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                current.push('/');
                current.push_str(segment);
                if sftp.stat(Path::new(&current)).is_ok() {
                    continue;
                }
                sftp.mkdir(Path::new(&current), 0o755)?;
            }
            Ok(())
        })
        .await
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn UploadSink>, UploadError> {
        let path = path.to_string();
        let file = self
            .blocking(move |sftp| {
                Ok(sftp.open_mode(
                    Path::new(&path),
                    OpenFlags::WRITE | OpenFlags::CREATE,
                    0o644,
                    OpenType::File,
                )?)
            })
            .await?;
        Ok(Box::new(SftpSink(Some(file))))
    }
}

struct SftpSink(Option<ssh2::File>);

#[async_trait]
impl UploadSink for SftpSink {
    async fn write(&mut self, data: Bytes) -> Result<usize, UploadError> {
        let mut file = self
            .0
            .take()
            .ok_or_else(|| std::io::Error::other("file closed"))?;
        let (file, result) = tokio::task::spawn_blocking(move || {
            let result = std::io::Write::write_all(&mut file, &data).map(|_| data.len());
            (file, result)
        })
        .await
        .map_err(|_| UploadError::Worker)?;
        self.0 = Some(file);
        Ok(result?)
    }

    async fn close(&mut self) -> Result<(), UploadError> {
        if let Some(file) = self.0.take() {
            tokio::task::spawn_blocking(move || drop(file))
                .await
                .map_err(|_| UploadError::Worker)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_stat_distinguishes_kinds() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let backend = LocalUploadBackend;
        assert_eq!(
            backend.stat(dir.path().to_str().unwrap()).await,
            Some(PathKind::Directory)
        );
        assert_eq!(
            backend.stat(file.to_str().unwrap()).await,
            Some(PathKind::File)
        );
        assert_eq!(
            backend.stat(dir.path().join("nope").to_str().unwrap()).await,
            None
        );
    }

    #[tokio::test]
    async fn local_delete_is_recursive() {
        let dir = tempfile::TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("deep")).unwrap();
        std::fs::write(tree.join("deep/file"), b"x").unwrap();

        let backend = LocalUploadBackend;
        backend.delete_path(tree.to_str().unwrap()).await.unwrap();
        assert!(!tree.exists());
        // Deleting a missing path is not an error.
        backend.delete_path(tree.to_str().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn local_sink_appends_and_reports_length() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out");

        let backend = LocalUploadBackend;
        let mut sink = backend.open_file(path.to_str().unwrap()).await.unwrap();
        assert_eq!(sink.write(Bytes::from_static(b"hello ")).await.unwrap(), 6);
        assert_eq!(sink.write(Bytes::from_static(b"world")).await.unwrap(), 5);
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }
}
