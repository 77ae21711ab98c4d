//! Local filesystem backend.
//!
//! Copies shell out to `cp -a` when available (mode/ownership preservation
//! for free) and fall back to a recursive manual copy otherwise; Windows
//! always takes the manual path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{unix_millis, Filesystem, FsEntry, FsError};

pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0
    }
}

fn to_entry(name: String, path: &Path, metadata: &std::fs::Metadata) -> FsEntry {
    FsEntry {
        name,
        path: path.to_string_lossy().into_owned(),
        is_dir: metadata.is_dir(),
        size: metadata.len(),
        mode: entry_mode(metadata),
        mod_time: metadata.modified().map(unix_millis).unwrap_or(0),
    }
}

/// `dest/basename(src)`, with `" copy"` appended when that already exists.
/// Probed once only, matching the client's expectations.
async fn collision_target(src: &Path, dest: &Path) -> Result<PathBuf, FsError> {
    let name = src
        .file_name()
        .ok_or_else(|| FsError::Other(format!("invalid source path: {}", src.display())))?;
    let mut target = dest.join(name);
    if fs::metadata(&target).await.is_ok() {
        let mut with_suffix = target.into_os_string();
        with_suffix.push(" copy");
        target = PathBuf::from(with_suffix);
    }
    Ok(target)
}

#[async_trait]
impl Filesystem for LocalFs {
    async fn get_root(&self) -> Result<Vec<FsEntry>, FsError> {
        let metadata = fs::metadata(&self.root).await?;
        Ok(vec![to_entry("/".to_string(), &self.root, &metadata)])
    }

    async fn list(&self, path: &str, show_hidden: bool) -> Result<Vec<FsEntry>, FsError> {
        let mut dir = fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            let metadata = match item.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("error getting file info: {e}");
                    continue;
                }
            };
            entries.push(to_entry(name, &item.path(), &metadata));
        }
        Ok(entries)
    }

    async fn create(&self, parent: &str, name: &str, is_dir: bool) -> Result<(), FsError> {
        let new_path = Path::new(parent).join(name);
        if fs::metadata(&new_path).await.is_ok() {
            return Err(FsError::AlreadyExists(new_path.display().to_string()));
        }

        if is_dir {
            fs::create_dir(&new_path).await?;
            set_mode(&new_path, 0o750).await?;
        } else {
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o640);
            options.open(&new_path).await?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), FsError> {
        let metadata = fs::metadata(path).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_name: &str) -> Result<(), FsError> {
        if new_name.contains('/') {
            return Err(FsError::InvalidName(new_name.to_string()));
        }
        let old = Path::new(old_path);
        let parent = old.parent().unwrap_or_else(|| Path::new("/"));
        let new_path = parent.join(new_name);
        if fs::metadata(&new_path).await.is_ok() {
            return Err(FsError::AlreadyExists(new_path.display().to_string()));
        }
        fs::rename(old, &new_path).await?;
        Ok(())
    }

    async fn copy(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let src = Path::new(src);
        fs::metadata(src).await?;
        let target = collision_target(src, Path::new(dest)).await?;

        if cfg!(not(windows)) {
            match tokio::process::Command::new("cp")
                .arg("-a")
                .arg(src)
                .arg(&target)
                .output()
                .await
            {
                Ok(output) if output.status.success() => return Ok(()),
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    tracing::warn!("cp failed ({stderr}), falling back to manual copy");
                }
                Err(e) => {
                    tracing::warn!("cp not runnable ({e}), falling back to manual copy");
                }
            }
        }

        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || copy_recursive(&src, &target))
            .await
            .map_err(|_| FsError::CopyFailed("copy worker failed".to_string()))?
    }

    async fn move_entry(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let src = Path::new(src);
        fs::metadata(src).await?;
        let target = collision_target(src, Path::new(dest)).await?;
        fs::rename(src, &target)
            .await
            .map_err(|e| FsError::MoveFailed(e.to_string()))?;
        Ok(())
    }
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Manual copy used when `cp` is unavailable. Cleans up the partial
/// destination on error.
fn copy_recursive(src: &Path, dest: &Path) -> Result<(), FsError> {
    let metadata = std::fs::metadata(src)?;

    if metadata.is_dir() {
        std::fs::create_dir_all(dest)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                dest,
                std::fs::Permissions::from_mode(metadata.permissions().mode()),
            );
        }
        for item in std::fs::read_dir(src)? {
            let item = item?;
            if let Err(e) = copy_recursive(&item.path(), &dest.join(item.file_name())) {
                let _ = std::fs::remove_dir_all(dest);
                return Err(e);
            }
        }
        return Ok(());
    }

    if let Err(e) = std::fs::copy(src, dest) {
        let _ = std::fs::remove_file(dest);
        return Err(FsError::CopyFailed(e.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_into_directory_keeps_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("f");
        std::fs::write(&src, b"payload").unwrap();
        let dest = dir.path().join("g");
        std::fs::create_dir(&dest).unwrap();

        let fs = LocalFs::new(dir.path().to_path_buf());
        fs.copy(src.to_str().unwrap(), dest.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dest.join("f")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn copy_collision_appends_copy_suffix() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("f");
        std::fs::write(&src, b"new").unwrap();
        let dest = dir.path().join("g");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("f"), b"old").unwrap();

        let fs = LocalFs::new(dir.path().to_path_buf());
        fs.copy(src.to_str().unwrap(), dest.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dest.join("f")).unwrap(), b"old");
        assert_eq!(std::fs::read(dest.join("f copy")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn copy_directory_is_recursive() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("tree");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a"), b"a").unwrap();
        std::fs::write(src.join("sub/b"), b"b").unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir(&dest).unwrap();

        let fs = LocalFs::new(dir.path().to_path_buf());
        fs.copy(src.to_str().unwrap(), dest.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dest.join("tree/a")).unwrap(), b"a");
        assert_eq!(std::fs::read(dest.join("tree/sub/b")).unwrap(), b"b");
    }

    #[test]
    fn manual_copy_preserves_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("tree");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested/file"), b"deep").unwrap();
        let dest = dir.path().join("copy");

        copy_recursive(&src, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("nested/file")).unwrap(), b"deep");
    }

    #[tokio::test]
    async fn move_renames_into_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("f");
        std::fs::write(&src, b"data").unwrap();
        let dest = dir.path().join("g");
        std::fs::create_dir(&dest).unwrap();

        let fs = LocalFs::new(dir.path().to_path_buf());
        fs.move_entry(src.to_str().unwrap(), dest.to_str().unwrap())
            .await
            .unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(dest.join("f")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn create_dir_uses_restricted_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let fs = LocalFs::new(dir.path().to_path_buf());
        fs.create(dir.path().to_str().unwrap(), "newdir", true)
            .await
            .unwrap();

        let metadata = std::fs::metadata(dir.path().join("newdir")).unwrap();
        assert!(metadata.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(metadata.permissions().mode() & 0o777, 0o750);
        }
    }

    #[tokio::test]
    async fn rename_within_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("before");
        std::fs::write(&src, b"x").unwrap();

        let fs = LocalFs::new(dir.path().to_path_buf());
        fs.rename(src.to_str().unwrap(), "after").await.unwrap();

        assert!(!src.exists());
        assert!(dir.path().join("after").exists());
    }
}
