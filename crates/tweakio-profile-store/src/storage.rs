//! Filesystem primitives: atomic replacement, exclusive creation and
//! tolerant tree removal.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;
use crate::paths::layout;

/// Unique hidden sibling of `path`, e.g. `.metadata.json.tmp.<uuid>`.
pub(crate) fn sibling_path(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.trim_start_matches('.');
    path.with_file_name(format!(".{name}.{tag}.{}", Uuid::new_v4().simple()))
}

async fn write_synced(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = async_fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = async_fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        debug!(path = ?path, error = %e, "Failed to remove temporary file");
    }
}

#[cfg(unix)]
async fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        match async_fs::File::open(parent).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!(path = ?parent, error = %e, "Directory sync failed");
                }
            }
            Err(e) => debug!(path = ?parent, error = %e, "Directory open for sync failed"),
        }
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) {}

/// Replace `path` with `contents` atomically.
///
/// The bytes go to a unique sibling temp file which is synced and then
/// renamed over the target, so readers see the old file or the new file and
/// never a mix. On failure the temp file is removed and the target is left
/// as it was.
///
/// # Errors
///
/// Returns [`StorageError::WriteFailed`] naming the target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    debug!(path = ?path, bytes = contents.len(), "Writing file atomically");

    let temp_path = sibling_path(path, "tmp");
    let result = async {
        write_synced(&temp_path, contents).await?;
        async_fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(source) = result {
        remove_quietly(&temp_path).await;
        return Err(StorageError::write_failed(path, source));
    }

    sync_parent(path).await;
    Ok(())
}

/// Create `path` holding `contents`, failing if it already exists.
///
/// The file is written in full under a temp name first and then hard-linked
/// into place, so the target never exists with partial contents. Where hard
/// links are unsupported it falls back to `create_new` on the target.
///
/// # Errors
///
/// Returns [`StorageError::AlreadyExists`] when `path` exists, or
/// [`StorageError::WriteFailed`] on I/O failure.
pub async fn create_exclusive(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let temp_path = sibling_path(path, "new");
    if let Err(source) = write_synced(&temp_path, contents).await {
        remove_quietly(&temp_path).await;
        return Err(StorageError::write_failed(path, source));
    }

    let linked = async_fs::hard_link(&temp_path, path).await;
    remove_quietly(&temp_path).await;

    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(StorageError::AlreadyExists(path.to_path_buf()))
        }
        Err(e) if matches!(e.kind(), ErrorKind::Unsupported | ErrorKind::PermissionDenied) => {
            debug!(path = ?path, error = %e, "Hard link unavailable, using create_new");
            match write_synced(path, contents).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    Err(StorageError::AlreadyExists(path.to_path_buf()))
                }
                Err(source) => Err(StorageError::write_failed(path, source)),
            }
        }
        Err(source) => Err(StorageError::write_failed(path, source)),
    }
}

/// Read a file, mapping "not found" to `None`.
///
/// # Errors
///
/// Returns [`StorageError::ReadFailed`] for any other I/O failure.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match async_fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StorageError::read_failed(path, source)),
    }
}

/// Create a directory and its parents.
///
/// # Errors
///
/// Returns [`StorageError::DirectoryCreationFailed`].
pub async fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    async_fs::create_dir_all(path)
        .await
        .map_err(|source| StorageError::directory_creation_failed(path, source))
}

/// Create `path` as a new directory; its parent must already exist.
///
/// # Errors
///
/// Returns [`StorageError::AlreadyExists`] if something is already there.
pub async fn create_dir_new(path: &Path) -> Result<(), StorageError> {
    match async_fs::create_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(StorageError::AlreadyExists(path.to_path_buf()))
        }
        Err(source) => Err(StorageError::directory_creation_failed(path, source)),
    }
}

/// Remove a file, treating "not found" as success.
///
/// # Errors
///
/// Returns [`StorageError::RemoveFailed`] for any other I/O failure.
pub async fn remove_file_if_exists(path: &Path) -> Result<(), StorageError> {
    match async_fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StorageError::remove_failed(path, source)),
    }
}

/// Remove a directory tree, treating "not found" as success.
///
/// # Errors
///
/// Returns [`StorageError::RemoveFailed`] for any other I/O failure.
pub async fn remove_dir_if_exists(path: &Path) -> Result<(), StorageError> {
    match async_fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StorageError::remove_failed(path, source)),
    }
}

async fn remove_entry(path: &Path, is_dir: bool) -> Result<(), StorageError> {
    if is_dir {
        remove_dir_if_exists(path).await
    } else {
        remove_file_if_exists(path).await
    }
}

/// Remove a profile directory.
///
/// Missing entries are not errors, so a previously interrupted removal can
/// be retried. `metadata.json` and the lock go last: until the final step the
/// directory still looks like a profile and stays discoverable. The directory
/// itself is removed only if nothing new appeared in it meanwhile.
///
/// # Errors
///
/// Returns [`StorageError::RemoveFailed`] for the first entry that could
/// not be removed.
pub async fn remove_profile_tree(dir: &Path) -> Result<(), StorageError> {
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(StorageError::remove_failed(dir, source)),
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(source) => return Err(StorageError::remove_failed(dir, source)),
        };
        let name = entry.file_name();
        if name == layout::METADATA_FILE || name == layout::LOCK_FILE {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        remove_entry(&entry.path(), is_dir).await?;
    }

    remove_file_if_exists(&dir.join(layout::METADATA_FILE)).await?;
    remove_file_if_exists(&dir.join(layout::LOCK_FILE)).await?;
    // Non-recursive: a lock created after ours was removed must survive.
    match async_fs::remove_dir(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => return Err(StorageError::remove_failed(dir, source)),
    }

    debug!(path = ?dir, "Profile tree removed");
    Ok(())
}

/// Names of the immediate subdirectories of `dir`, sorted. A missing
/// directory yields an empty list.
///
/// # Errors
///
/// Returns [`StorageError::ReadFailed`] if the directory cannot be listed.
pub async fn list_subdirectories(dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(StorageError::read_failed(dir, source)),
    };

    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
            Ok(None) => break,
            Err(source) => return Err(StorageError::read_failed(dir, source)),
        }
    }
    names.sort();
    Ok(names)
}

/// Timestamps observed on a directory and its immediate entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeTimes {
    /// Directory birth time where the platform reports one, else the
    /// earliest modification time seen
    pub created: SystemTime,
    /// Latest modification time seen
    pub modified: SystemTime,
}

/// Stat `dir` and its immediate entries.
///
/// Hidden entries (the lock, temp files) are ignored so that taking a lock
/// does not move the observed times. With no visible entries the
/// directory's own modification time is used.
///
/// # Errors
///
/// Returns [`StorageError::ReadFailed`] if the directory itself cannot be
/// stat'ed or listed. Entries that vanish or fail to stat are skipped.
pub async fn tree_times(dir: &Path) -> Result<TreeTimes, StorageError> {
    let meta = async_fs::metadata(dir)
        .await
        .map_err(|source| StorageError::read_failed(dir, source))?;
    let dir_modified = meta
        .modified()
        .map_err(|source| StorageError::read_failed(dir, source))?;

    let mut earliest: Option<SystemTime> = None;
    let mut latest: Option<SystemTime> = None;

    let mut entries = async_fs::read_dir(dir)
        .await
        .map_err(|source| StorageError::read_failed(dir, source))?;
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if let Ok(m) = entry.metadata().await
                    && let Ok(modified) = m.modified()
                {
                    earliest = Some(earliest.map_or(modified, |e| e.min(modified)));
                    latest = Some(latest.map_or(modified, |l| l.max(modified)));
                }
            }
            Ok(None) => break,
            Err(source) => return Err(StorageError::read_failed(dir, source)),
        }
    }

    let earliest = earliest.unwrap_or(dir_modified);
    let latest = latest.unwrap_or(dir_modified);
    let created = meta.created().map_or(earliest, |c| c.min(earliest));
    Ok(TreeTimes {
        created,
        modified: latest.max(created),
    })
}
