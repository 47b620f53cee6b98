//! Cross-process lock files.
//!
//! A lock is a small JSON file (`{pid, acquired_at, token}`) created with
//! exclusive semantics. A lock whose pid is no longer running is stale and
//! may be reclaimed by anyone; a live one is waited on with exponential
//! backoff until the caller's deadline.
//!
//! Reclaiming re-reads the lock and deletes it only if it still holds the
//! stale record, with every reclaimer serialised on an advisory lock over a
//! sibling guard file (`.lock.reclaim`). A fresh lock written after the
//! stale one was judged is therefore never removed by a late reclaimer.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProfileStoreConfig;
use crate::error::{LockError, StorageError};
use crate::liveness::{LivenessProbe, SystemProbe};
use crate::paths::{PathResolver, layout};
use crate::platform::Platform;
use crate::storage;

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Owning process
    pub pid: u32,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
    /// Per-acquisition token; release requires both pid and token to match
    pub token: Uuid,
}

impl LockRecord {
    /// Fresh record for `pid`.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            acquired_at: Utc::now(),
            token: Uuid::new_v4(),
        }
    }
}

/// What a lock path currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock file
    Free,
    /// Held by a live process, or unreadable and younger than the grace
    /// period (`holder` is then `None`)
    Held {
        /// Parsed record, when readable
        holder: Option<LockRecord>,
    },
    /// Holder is not running, or the file stayed unreadable past the grace
    /// period
    Stale {
        /// Parsed record, when readable
        holder: Option<LockRecord>,
    },
}

impl LockState {
    /// Whether a live process holds the lock
    pub fn is_held(&self) -> bool {
        matches!(self, LockState::Held { .. })
    }

    /// Recorded pid, if the file was readable
    pub fn holder_pid(&self) -> Option<u32> {
        match self {
            LockState::Free => None,
            LockState::Held { holder } | LockState::Stale { holder } => {
                holder.as_ref().map(|h| h.pid)
            }
        }
    }
}

/// An acquired lock.
///
/// Dropping the handle without calling [`LockHandle::release`] removes the
/// lock synchronously, so a cancelled caller never leaks it.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockHandle {
    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record written at acquisition
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Remove the lock if it still records this handle's pid and token.
    ///
    /// Returns `false` when the file is gone or now belongs to someone else;
    /// the file is then left alone. Calling it again after success is a no-op.
    ///
    /// # Errors
    ///
    /// [`StorageError`] on I/O failure; the handle stays armed and may be
    /// released again.
    pub async fn release(&mut self) -> Result<bool, StorageError> {
        if self.released {
            return Ok(false);
        }
        let removed = release_if_owned(&self.path, &self.record).await?;
        self.released = true;
        Ok(removed)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let owned = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok())
            .is_some_and(|current| current == self.record);
        if owned {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = ?self.path, "Lock released on drop"),
                Err(e) => warn!(path = ?self.path, error = %e, "Failed to release lock on drop"),
            }
        }
    }
}

async fn release_if_owned(path: &Path, record: &LockRecord) -> Result<bool, StorageError> {
    let Some(bytes) = storage::read_optional(path).await? else {
        warn!(path = ?path, pid = record.pid, "Lock already gone at release");
        return Ok(false);
    };

    match serde_json::from_slice::<LockRecord>(&bytes) {
        Ok(current) if current == *record => {
            storage::remove_file_if_exists(path).await?;
            debug!(path = ?path, pid = record.pid, "Lock released");
            Ok(true)
        }
        Ok(current) => {
            warn!(
                path = ?path,
                pid = record.pid,
                holder = current.pid,
                "Lock now belongs to another holder, leaving it"
            );
            Ok(false)
        }
        Err(_) => {
            warn!(path = ?path, "Lock became unreadable, leaving it");
            Ok(false)
        }
    }
}

/// Guard file serialising reclaims of `path`, e.g. `.lock.reclaim`.
fn reclaim_guard_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.reclaim", name.trim_start_matches('.')))
}

/// Compare-and-unlink under an exclusive advisory lock on the guard file.
///
/// Only reclaimers remove a lock they do not own, and they all hold the
/// guard while they re-read and delete, so a lock replaced after it was
/// judged stale is never touched.
fn reclaim_guarded(path: &Path, expected: Option<&LockRecord>) -> Result<bool, StorageError> {
    let guard_path = reclaim_guard_path(path);
    let guard = match std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&guard_path)
    {
        Ok(file) => file,
        // Profile directory removed underneath us; so is the lock.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => return Err(StorageError::write_failed(&guard_path, source)),
    };
    guard
        .lock_exclusive()
        .map_err(|source| StorageError::write_failed(&guard_path, source))?;

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => return Err(StorageError::read_failed(path, source)),
    };
    let still_stale = match (serde_json::from_slice::<LockRecord>(&bytes), expected) {
        (Ok(current), Some(expected)) => current == *expected,
        (Err(_), None) => true,
        _ => false,
    };
    if !still_stale {
        debug!(path = ?path, "Lock changed since it was judged stale, leaving it");
        return Ok(false);
    }

    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StorageError::remove_failed(path, source)),
    }
    // `guard` drops here and releases the advisory lock.
}

enum Attempt {
    Acquired(LockHandle),
    Busy(Option<u32>),
}

/// Acquires, inspects and reclaims lock files.
#[derive(Debug, Clone)]
pub struct LockManager {
    resolver: PathResolver,
    probe: Arc<dyn LivenessProbe>,
    timeout: Duration,
    retry_initial: Duration,
    retry_max: Duration,
    unreadable_grace: Duration,
}

impl LockManager {
    /// Create a lock manager using the OS process table for liveness.
    pub fn new(config: &ProfileStoreConfig) -> Self {
        Self {
            resolver: PathResolver::new(&config.root_dir),
            probe: Arc::new(SystemProbe),
            timeout: config.lock_timeout,
            retry_initial: config.lock_retry_initial,
            retry_max: config.lock_retry_max,
            unreadable_grace: config.unreadable_lock_grace,
        }
    }

    /// Replace the liveness probe
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Configured acquisition timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `pid` is running according to this manager's probe
    pub fn is_alive(&self, pid: u32) -> bool {
        self.probe.is_alive(pid)
    }

    /// Read the lock at `path` and classify it.
    ///
    /// # Errors
    ///
    /// [`StorageError::ReadFailed`] on I/O failure other than "not found".
    pub async fn state(&self, path: &Path) -> Result<LockState, StorageError> {
        let Some(bytes) = storage::read_optional(path).await? else {
            return Ok(LockState::Free);
        };

        if let Ok(record) = serde_json::from_slice::<LockRecord>(&bytes) {
            return Ok(if self.probe.is_alive(record.pid) {
                LockState::Held {
                    holder: Some(record),
                }
            } else {
                LockState::Stale {
                    holder: Some(record),
                }
            });
        }

        let age = match tokio::fs::metadata(path).await {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Free),
            Err(source) => return Err(StorageError::read_failed(path, source)),
        };

        Ok(if age >= self.unreadable_grace {
            LockState::Stale { holder: None }
        } else {
            LockState::Held { holder: None }
        })
    }

    /// True iff a lock exists at `path` and its holder is live.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::state`].
    pub async fn is_locked(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(self.state(path).await?.is_held())
    }

    /// Acquire with the configured timeout.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if a live holder keeps the lock past the
    /// timeout, [`LockError::Storage`] on I/O failure.
    pub async fn acquire(&self, path: &Path) -> Result<LockHandle, LockError> {
        self.acquire_until(path, Instant::now() + self.timeout).await
    }

    /// Acquire, waiting no later than `deadline`.
    ///
    /// Stale locks are reclaimed immediately. While a live process holds
    /// the lock the caller sleeps with exponential backoff. Dropping the
    /// future while it waits has no effect on disk.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::acquire`].
    pub async fn acquire_until(&self, path: &Path, deadline: Instant) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let mut delay = self.retry_initial;

        loop {
            let holder = match self.attempt(path).await? {
                Attempt::Acquired(handle) => return Ok(handle),
                Attempt::Busy(holder) => holder,
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(path = ?path, holder = ?holder, "Lock acquisition timed out");
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    holder_pid: holder,
                    waited: now.duration_since(started),
                });
            }

            debug!(
                path = ?path,
                holder = ?holder,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Lock busy, backing off"
            );
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.retry_max);
        }
    }

    /// Single non-blocking attempt. Returns `None` when a live holder has it.
    ///
    /// # Errors
    ///
    /// [`StorageError`] on I/O failure.
    pub async fn try_acquire(&self, path: &Path) -> Result<Option<LockHandle>, StorageError> {
        Ok(match self.attempt(path).await? {
            Attempt::Acquired(handle) => Some(handle),
            Attempt::Busy(_) => None,
        })
    }

    async fn attempt(&self, path: &Path) -> Result<Attempt, StorageError> {
        let record = LockRecord::new(std::process::id());
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StorageError::write_failed(path, std::io::Error::other(e)))?;

        // One extra create after a reclaim or a lock vanishing under us.
        for _ in 0..2 {
            match storage::create_exclusive(path, &bytes).await {
                Ok(()) => {
                    debug!(path = ?path, pid = record.pid, "Lock acquired");
                    return Ok(Attempt::Acquired(LockHandle {
                        path: path.to_path_buf(),
                        record,
                        released: false,
                    }));
                }
                Err(StorageError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }

            match self.state(path).await? {
                LockState::Free => continue,
                LockState::Held { holder } => {
                    return Ok(Attempt::Busy(holder.map(|h| h.pid)));
                }
                LockState::Stale { holder } => {
                    warn!(
                        path = ?path,
                        pid = holder.as_ref().map(|h| h.pid),
                        "Reclaiming stale lock"
                    );
                    self.reclaim(path, holder.as_ref()).await?;
                }
            }
        }

        let holder = self.state(path).await?.holder_pid();
        Ok(Attempt::Busy(holder))
    }

    /// Remove a lock previously judged stale, provided it still holds
    /// `expected` (or is still unreadable when `expected` is `None`).
    ///
    /// Returns whether a lock was removed.
    async fn reclaim(&self, path: &Path, expected: Option<&LockRecord>) -> Result<bool, StorageError> {
        let owned_path = path.to_path_buf();
        let expected = expected.cloned();
        tokio::task::spawn_blocking(move || reclaim_guarded(&owned_path, expected.as_ref()))
            .await
            .map_err(|e| StorageError::remove_failed(path, std::io::Error::other(e)))?
    }

    /// Remove `path` if it is stale. Safe to race with `acquire`.
    ///
    /// # Errors
    ///
    /// [`StorageError`] on I/O failure.
    pub async fn remove_if_stale(&self, path: &Path) -> Result<bool, StorageError> {
        match self.state(path).await? {
            LockState::Stale { holder } => {
                let removed = self.reclaim(path, holder.as_ref()).await?;
                if removed {
                    warn!(path = ?path, pid = holder.map(|h| h.pid), "Removed stale lock");
                }
                Ok(removed)
            }
            LockState::Free | LockState::Held { .. } => Ok(false),
        }
    }

    /// Scan every platform gate and profile lock under the root and remove
    /// the stale ones. Idempotent.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if a platform directory cannot be listed or a stale
    /// lock cannot be removed.
    pub async fn cleanup_stale(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut removed = Vec::new();
        for platform in Platform::ALL {
            for path in self.lock_paths(platform).await? {
                if self.remove_if_stale(&path).await? {
                    removed.push(path);
                }
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Stale lock cleanup finished");
        }
        Ok(removed)
    }

    async fn lock_paths(&self, platform: Platform) -> Result<Vec<PathBuf>, StorageError> {
        let platform_dir = self.resolver.platform_dir(platform);
        let mut paths = vec![self.resolver.activation_gate(platform)];
        for name in storage::list_subdirectories(&platform_dir).await? {
            paths.push(platform_dir.join(name).join(layout::LOCK_FILE));
        }
        Ok(paths)
    }
}
