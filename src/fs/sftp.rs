//! SFTP filesystem backend.
//!
//! All libssh2 calls are blocking and run on the blocking pool. One session
//! carries both the SFTP subsystem and the ad-hoc exec channels used for
//! `cp -a` and environment probes; short request/response calls keep the
//! session lock uncontended.
//!
//! Remote path separator is probed once at attach time: `ver` identifies a
//! Windows host, a working `uname` identifies a Unix one, anything else
//! defaults to `/`.

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{OpenFlags, OpenType, Session, Sftp};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::ssh::{run_command, SshError, SshTarget};

use super::{Filesystem, FsEntry, FsError};

impl From<ssh2::Error> for FsError {
    fn from(e: ssh2::Error) -> Self {
        FsError::Ssh(SshError::Proto(e))
    }
}

struct SftpInner {
    session: Mutex<Session>,
    sftp: Mutex<Sftp>,
    separator: &'static str,
}

pub struct SftpFs {
    inner: Arc<SftpInner>,
}

impl SftpFs {
    pub async fn connect(target: Arc<SshTarget>) -> Result<Self, FsError> {
        let inner = tokio::task::spawn_blocking(move || {
            let session = target.connect()?;
            let sftp = session.sftp()?;
            let separator = detect_separator(&session);
            Ok::<_, FsError>(SftpInner {
                session: Mutex::new(session),
                sftp: Mutex::new(sftp),
                separator,
            })
        })
        .await
        .map_err(|_| FsError::Ssh(SshError::Worker))??;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, FsError>
    where
        T: Send + 'static,
        F: FnOnce(&SftpInner) -> Result<T, FsError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|_| FsError::Ssh(SshError::Worker))?
    }
}

fn detect_separator(session: &Session) -> &'static str {
    if let Ok(output) = run_command(session, "ver") {
        if output.to_lowercase().contains("windows") {
            return "\\";
        }
    }
    if run_command(session, "uname").is_ok() {
        return "/";
    }
    "/"
}

/// Join remote path segments with `/`, then flip to the detected separator.
fn join_remote(separator: &str, parent: &str, child: &str) -> String {
    let joined = format!("{}/{}", parent.trim_end_matches('/'), child);
    if separator == "\\" {
        joined.replace('/', "\\")
    } else {
        joined
    }
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
}

fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind(['/', '\\']) {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "/",
    }
}

fn to_entry(separator: &str, parent: &str, name: String, stat: &ssh2::FileStat) -> FsEntry {
    FsEntry {
        path: join_remote(separator, parent, &name),
        name,
        is_dir: stat.is_dir(),
        size: stat.size.unwrap_or(0),
        mode: stat.perm.unwrap_or(0),
        mod_time: stat.mtime.map(|secs| secs as i64 * 1000).unwrap_or(0),
    }
}

fn mkdir_all(sftp: &Sftp, path: &str, mode: i32) -> Result<(), FsError> {
    let mut current = String::new();
    for segment in path.split(['/', '\\']).filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        let target = Path::new(&current);
        if sftp.stat(target).is_ok() {
            continue;
        }
        sftp.mkdir(target, mode)?;
    }
    Ok(())
}

fn delete_tree(sftp: &Sftp, path: &str) -> Result<(), FsError> {
    let stat = sftp.stat(Path::new(path))?;
    if !stat.is_dir() {
        sftp.unlink(Path::new(path))?;
        return Ok(());
    }
    for (child, _) in sftp.readdir(Path::new(path))? {
        delete_tree(sftp, &child.to_string_lossy())?;
    }
    sftp.rmdir(Path::new(path))?;
    Ok(())
}

fn copy_tree(sftp: &Sftp, src: &str, dest: &str) -> Result<(), FsError> {
    let stat = sftp.stat(Path::new(src))?;

    if stat.is_dir() {
        mkdir_all(sftp, dest, stat.perm.unwrap_or(0o755) as i32)?;
        for (child, _) in sftp.readdir(Path::new(src))? {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let child_src = child.to_string_lossy().into_owned();
            let child_dest = format!("{}/{}", dest.trim_end_matches('/'), name);
            if let Err(e) = copy_tree(sftp, &child_src, &child_dest) {
                let _ = delete_tree(sftp, dest);
                return Err(e);
            }
        }
        return Ok(());
    }

    let mut source = sftp.open(Path::new(src))?;
    let mut target = sftp.open_mode(
        Path::new(dest),
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        stat.perm.unwrap_or(0o644) as i32,
        OpenType::File,
    )?;
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Err(e) = std::io::Write::write_all(&mut target, &buf[..n]) {
            let _ = sftp.unlink(Path::new(dest));
            return Err(FsError::CopyFailed(e.to_string()));
        }
    }
    Ok(())
}

#[async_trait]
impl Filesystem for SftpFs {
    async fn get_root(&self) -> Result<Vec<FsEntry>, FsError> {
        self.blocking(|inner| {
            let home = {
                let session = inner.session.lock();
                run_command(&session, "echo $HOME")
                    .map(|out| out.trim().to_string())
                    .unwrap_or_default()
            };
            let home = if home.is_empty() { "~".to_string() } else { home };

            let sftp = inner.sftp.lock();
            let stat = sftp.stat(Path::new(&home))?;
            Ok(vec![FsEntry {
                name: "/".to_string(),
                path: home,
                is_dir: true,
                size: stat.size.unwrap_or(0),
                mode: stat.perm.unwrap_or(0),
                mod_time: stat.mtime.map(|secs| secs as i64 * 1000).unwrap_or(0),
            }])
        })
        .await
    }

    async fn list(&self, path: &str, show_hidden: bool) -> Result<Vec<FsEntry>, FsError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            let sftp = inner.sftp.lock();
            let mut entries = Vec::new();
            for (child, stat) in sftp.readdir(Path::new(&path))? {
                let name = child
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !show_hidden && name.starts_with('.') {
                    continue;
                }
                entries.push(to_entry(inner.separator, &path, name, &stat));
            }
            Ok(entries)
        })
        .await
    }

    async fn create(&self, parent: &str, name: &str, is_dir: bool) -> Result<(), FsError> {
        let parent = parent.to_string();
        let name = name.to_string();
        self.blocking(move |inner| {
            let full = join_remote(inner.separator, &parent, &name);
            let sftp = inner.sftp.lock();
            if sftp.stat(Path::new(&full)).is_ok() {
                return Err(FsError::AlreadyExists(full));
            }
            if is_dir {
                sftp.mkdir(Path::new(&full), 0o750)?;
            } else {
                sftp.open_mode(
                    Path::new(&full),
                    OpenFlags::WRITE | OpenFlags::CREATE,
                    0o640,
                    OpenType::File,
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<(), FsError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            let sftp = inner.sftp.lock();
            delete_tree(&sftp, &path)
        })
        .await
    }

    async fn rename(&self, old_path: &str, new_name: &str) -> Result<(), FsError> {
        if new_name.contains('/') {
            return Err(FsError::InvalidName(new_name.to_string()));
        }
        let old_path = old_path.to_string();
        let new_name = new_name.to_string();
        self.blocking(move |inner| {
            let new_path = join_remote(inner.separator, parent_dir(&old_path), &new_name);
            let sftp = inner.sftp.lock();
            if sftp.stat(Path::new(&new_path)).is_ok() {
                return Err(FsError::AlreadyExists(new_path));
            }
            sftp.rename(Path::new(&old_path), Path::new(&new_path), None)?;
            Ok(())
        })
        .await
    }

    async fn copy(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let src = src.to_string();
        let dest = dest.to_string();
        self.blocking(move |inner| {
            let target = {
                let sftp = inner.sftp.lock();
                sftp.stat(Path::new(&src))
                    .map_err(|e| FsError::CopyFailed(format!("source path does not exist: {e}")))?;
                let mut target = join_remote(inner.separator, &dest, basename(&src));
                if sftp.stat(Path::new(&target)).is_ok() {
                    target.push_str(" copy");
                }
                target
            };

            {
                let session = inner.session.lock();
                match run_command(&session, &format!("cp -a {:?} {:?}", src, target)) {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        tracing::warn!("cp failed ({e}), falling back to manual copy");
                    }
                }
            }

            let sftp = inner.sftp.lock();
            copy_tree(&sftp, &src, &target)
        })
        .await
    }

    async fn move_entry(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let src = src.to_string();
        let dest = dest.to_string();
        self.blocking(move |inner| {
            let sftp = inner.sftp.lock();
            sftp.stat(Path::new(&src))
                .map_err(|e| FsError::MoveFailed(format!("source path does not exist: {e}")))?;
            let mut target = join_remote(inner.separator, &dest, basename(&src));
            if sftp.stat(Path::new(&target)).is_ok() {
                target.push_str(" copy");
            }
            sftp.rename(Path::new(&src), Path::new(&target), None)
                .map_err(|e| FsError::MoveFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }
}
