//! Crash-safe file replacement.
//!
//! A reader either sees the previous file contents or the new ones, never a
//! partial write: bytes go to a sibling temp file, are fsynced, and are then
//! renamed over the destination. [`write_new_atomic`] publishes the temp
//! file with a hard link instead, so only the first writer of a path wins.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::hash::canonical_json_pretty;

/// Atomically replaces `path` with `data`, creating parent directories.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let (parent, tmp_path) = stage_temp(path, data).await?;

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    sync_dir(parent).await;
    Ok(())
}

/// Creates `path` with `data` unless it already exists. Returns `false`, and
/// leaves the existing file untouched, when another writer got there first.
pub async fn write_new_atomic(path: &Path, data: &[u8]) -> io::Result<bool> {
    let (parent, tmp_path) = stage_temp(path, data).await?;

    let linked = fs::hard_link(&tmp_path, path).await;
    let _ = fs::remove_file(&tmp_path).await;
    match linked {
        Ok(()) => {
            sync_dir(parent).await;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Writes `data` to a fsynced temp sibling of `path`.
async fn stage_temp<'a>(path: &'a Path, data: &[u8]) -> io::Result<(&'a Path, PathBuf)> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok((parent, tmp_path))
}

// Persists the rename or link itself. Not every platform allows fsync on a directory.
async fn sync_dir(dir: &Path) {
    if let Ok(dir) = fs::File::open(dir).await {
        let _ = dir.sync_all().await;
    }
}

/// Writes `value` as pretty canonical JSON via [`write_atomic`].
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = canonical_json_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &bytes).await
}
