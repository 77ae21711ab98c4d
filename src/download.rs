//! Pull-style file and directory download.
//!
//! Unlike the frame services this sits outside the session protocol: the
//! HTTP layer calls it directly and streams the result as a response body.
//! Directories are delivered as a ZIP built on the blocking pool into an
//! anonymous spool file (the ZIP format needs to seek back over entry
//! headers) and then streamed out in 32 KiB chunks; entry paths are relative
//! to the requested root and carry the original mode bits.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use ssh2::{Session, Sftp};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::ssh::{SshError, SshTarget};

/// Copy-buffer and stream-chunk size for downloads.
pub const COPY_BUF_SIZE: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("path is a directory, use the directory download instead")]
    IsDirectory,

    #[error("path is not a directory")]
    NotDirectory,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("download worker failed")]
    Worker,
}

impl From<ssh2::Error> for DownloadError {
    fn from(e: ssh2::Error) -> Self {
        DownloadError::Ssh(SshError::Proto(e))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn stat(&self, path: &str) -> Result<DownloadInfo, DownloadError>;

    /// Stream a single file's bytes.
    async fn download(&self, path: &str) -> Result<(DownloadInfo, ByteStream), DownloadError>;

    /// Stream a directory as a ZIP archive.
    async fn download_dir(&self, path: &str) -> Result<(DownloadInfo, ByteStream), DownloadError>;
}

fn basename(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

fn spool_stream(mut spool: std::fs::File) -> Result<ByteStream, DownloadError> {
    spool.seek(SeekFrom::Start(0))?;
    let file = tokio::fs::File::from_std(spool);
    Ok(ReaderStream::with_capacity(file, COPY_BUF_SIZE).boxed())
}

// ── Local ──────────────────────────────────────────────────────────

pub struct LocalDownloader;

#[async_trait]
impl Downloader for LocalDownloader {
    async fn stat(&self, path: &str) -> Result<DownloadInfo, DownloadError> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(DownloadInfo {
            name: basename(path),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn download(&self, path: &str) -> Result<(DownloadInfo, ByteStream), DownloadError> {
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        if metadata.is_dir() {
            return Err(DownloadError::IsDirectory);
        }
        let info = DownloadInfo {
            name: basename(path),
            size: metadata.len(),
            is_dir: false,
        };
        let stream = ReaderStream::with_capacity(file, COPY_BUF_SIZE).boxed();
        Ok((info, stream))
    }

    async fn download_dir(&self, path: &str) -> Result<(DownloadInfo, ByteStream), DownloadError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_dir() {
            return Err(DownloadError::NotDirectory);
        }
        let info = DownloadInfo {
            name: basename(path),
            size: metadata.len(),
            is_dir: true,
        };

        let root = PathBuf::from(path);
        let spool = tokio::task::spawn_blocking(move || -> Result<std::fs::File, DownloadError> {
            let mut spool = tempfile::tempfile()?;
            {
                let mut zip = ZipWriter::new(&mut spool);
                zip_local_tree(&mut zip, &root, &root)?;
                zip.finish()?;
            }
            Ok(spool)
        })
        .await
        .map_err(|_| DownloadError::Worker)??;

        Ok((info, spool_stream(spool)?))
    }
}

fn entry_options(mode: u32) -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(mode)
}

fn zip_local_tree<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    dir: &Path,
) -> Result<(), DownloadError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let metadata = entry.metadata()?;
        let relative = path
            .strip_prefix(root)
            .map_err(|_| DownloadError::Worker)?
            .to_string_lossy()
            .into_owned();

        let mode = file_mode(&metadata);
        if metadata.is_dir() {
            zip.add_directory(format!("{relative}/"), entry_options(mode))?;
            zip_local_tree(zip, root, &path)?;
        } else {
            zip.start_file(relative, entry_options(mode))?;
            let mut file = std::fs::File::open(&path)?;
            let mut buf = [0u8; COPY_BUF_SIZE];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                zip.write_all(&buf[..n])?;
            }
        }
    }
    Ok(())
}

fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

// ── SFTP ───────────────────────────────────────────────────────────

pub struct SftpDownloader {
    sftp: Arc<Mutex<Sftp>>,
}

impl SftpDownloader {
    pub async fn connect(target: Arc<SshTarget>) -> Result<Self, DownloadError> {
        let sftp = tokio::task::spawn_blocking(move || {
            let session: Session = target.connect()?;
            Ok::<_, DownloadError>(session.sftp()?)
        })
        .await
        .map_err(|_| DownloadError::Worker)??;

        Ok(Self {
            sftp: Arc::new(Mutex::new(sftp)),
        })
    }
}

fn sftp_info(path: &str, stat: &ssh2::FileStat) -> DownloadInfo {
    DownloadInfo {
        name: basename(path),
        size: stat.size.unwrap_or(0),
        is_dir: stat.is_dir(),
    }
}

fn zip_sftp_tree<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    sftp: &Sftp,
    root: &str,
    dir: &str,
) -> Result<(), DownloadError> {
    let mut entries = sftp.readdir(Path::new(dir))?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (path, stat) in entries {
        let path_str = path.to_string_lossy().into_owned();
        let relative = path_str
            .strip_prefix(root)
            .unwrap_or(&path_str)
            .trim_start_matches('/')
            .to_string();
        let mode = stat.perm.unwrap_or(0o644);

        if stat.is_dir() {
            zip.add_directory(format!("{relative}/"), entry_options(mode))?;
            zip_sftp_tree(zip, sftp, root, &path_str)?;
        } else {
            zip.start_file(relative, entry_options(mode))?;
            let mut file = sftp.open(Path::new(&path_str))?;
            let mut buf = [0u8; COPY_BUF_SIZE];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                zip.write_all(&buf[..n])?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Downloader for SftpDownloader {
    async fn stat(&self, path: &str) -> Result<DownloadInfo, DownloadError> {
        let sftp = Arc::clone(&self.sftp);
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let stat = sftp.lock().stat(Path::new(&path))?;
            Ok(sftp_info(&path, &stat))
        })
        .await
        .map_err(|_| DownloadError::Worker)?
    }

    async fn download(&self, path: &str) -> Result<(DownloadInfo, ByteStream), DownloadError> {
        let sftp = Arc::clone(&self.sftp);
        let path = path.to_string();

        let (info, file) = tokio::task::spawn_blocking(
            move || -> Result<(DownloadInfo, ssh2::File), DownloadError> {
                let guard = sftp.lock();
                let stat = guard.stat(Path::new(&path))?;
                if stat.is_dir() {
                    return Err(DownloadError::IsDirectory);
                }
                let file = guard.open(Path::new(&path))?;
                Ok((sftp_info(&path, &stat), file))
            },
        )
        .await
        .map_err(|_| DownloadError::Worker)??;

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
        tokio::task::spawn_blocking(move || {
            let mut file = file;
            let mut buf = [0u8; COPY_BUF_SIZE];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        Ok((info, ReceiverStream::new(rx).boxed()))
    }

    async fn download_dir(&self, path: &str) -> Result<(DownloadInfo, ByteStream), DownloadError> {
        let sftp = Arc::clone(&self.sftp);
        let path = path.to_string();

        let (info, spool) = tokio::task::spawn_blocking(
            move || -> Result<(DownloadInfo, std::fs::File), DownloadError> {
                let guard = sftp.lock();
                let stat = guard.stat(Path::new(&path))?;
                if !stat.is_dir() {
                    return Err(DownloadError::NotDirectory);
                }
                let mut spool = tempfile::tempfile()?;
                {
                    let mut zip = ZipWriter::new(&mut spool);
                    zip_sftp_tree(&mut zip, &guard, &path, &path)?;
                    zip.finish()?;
                }
                Ok((sftp_info(&path, &stat), spool))
            },
        )
        .await
        .map_err(|_| DownloadError::Worker)??;

        Ok((info, spool_stream(spool)?))
    }
}
