use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::config::{COMPLETED_DIR, SCRATCH_DIR, SPILL_SUFFIX};

/// Disk layout owned by the transfer core: a scratch directory holding one
/// spill file per active upload session and a store of completed artifacts.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(self.scratch_root()).await?;
        fs::create_dir_all(self.completed_root()).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn completed_root(&self) -> PathBuf {
        self.root.join(COMPLETED_DIR)
    }

    /// 会话专属的临时累积文件路径。
    pub fn spill_path(&self, upload_id: &str) -> PathBuf {
        self.scratch_root().join(format!("{upload_id}{SPILL_SUFFIX}"))
    }

    /// 将制品逻辑名解析为 completed 目录下的安全路径。
    pub async fn resolve_artifact_checked(
        &self,
        name: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let base = self.completed_root();
        let target = resolve_under(&base, name)?;
        ensure_no_symlink_components(&base, &target, allow_missing_leaf).await?;
        Ok(target)
    }

    /// 原子地将累积完成的临时文件提升为目标文件。
    ///
    /// 同步文件与父目录，并通过同文件系统 rename 保证读取方不会看到半写状态。
    pub async fn promote(
        &self,
        spill: &Path,
        target: &Path,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        if !overwrite {
            match fs::metadata(target).await {
                Ok(_) => return Err(StorageError::DestinationExists),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::File::open(spill).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(spill, target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(target).await.is_ok() {
                    fs::rename(spill, target).await?;
                } else {
                    return Err(StorageError::Io(err));
                }
            }
            #[cfg(not(windows))]
            return Err(StorageError::Io(err));
        }

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf, StorageError> {
    let trimmed = relative.trim_start_matches(['/', '\\']);
    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(StorageError::InvalidPath);
    }
    Ok(base.join(normalized))
}

async fn ensure_no_symlink_components(
    base: &Path,
    target: &Path,
    allow_missing_leaf: bool,
) -> Result<(), StorageError> {
    let relative = target
        .strip_prefix(base)
        .map_err(|_| StorageError::InvalidPath)?;
    let mut current = PathBuf::from(base);
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StorageError::InvalidPath);
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(StorageError::InvalidPath);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                return Ok(());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
    }

    Ok(())
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    DestinationExists,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
