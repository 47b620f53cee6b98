//! Profile lifecycle orchestration.
//!
//! [`ProfileManager`] composes the resolver, metadata store, lock manager and
//! registry into the create/activate/deactivate/delete/recover state machine.
//!
//! # Exclusion
//!
//! Within a process every mutating operation on a platform runs under that
//! platform's async mutex, so two activations of one platform never
//! interleave. Across processes each profile has a lock file, and
//! activation additionally holds the platform's activation gate while it
//! checks that no other profile of the platform is held by a live process.
//!
//! # Cancellation
//!
//! Waiting for the platform mutex or a lock is cancellable: dropped lock
//! handles release themselves and nothing on disk has changed yet. Once an
//! operation starts mutating state it runs in a spawned task that owns the
//! platform mutex guard, so dropping the caller's future cannot tear the
//! sequence down midway.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tweakio_errors::{Operation, ProfileError, Result};

use crate::config::ProfileStoreConfig;
use crate::error::{LockError, MetadataError, StorageError};
use crate::liveness::LivenessProbe;
use crate::lock::{LockHandle, LockManager, LockState};
use crate::metadata::{MetadataStore, ProfileMetadata, ProfileStatus};
use crate::paths::{PathResolver, ProfileId, ProfileLocation, layout};
use crate::platform::Platform;
use crate::recovery::{self, RecoveryMode};
use crate::registry::Registry;
use crate::storage;

/// Which profiles [`ProfileManager::list`] returns, by effective status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFilter {
    /// Every profile
    #[default]
    All,
    /// Profiles held by a live process
    Active,
    /// Usable profiles nobody holds
    Inactive,
    /// Profiles needing recovery
    Corrupted,
}

impl StateFilter {
    /// Whether `status` passes the filter
    pub fn matches(&self, status: ProfileStatus) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Active => status == ProfileStatus::Active,
            StateFilter::Inactive => status == ProfileStatus::Inactive,
            StateFilter::Corrupted => status == ProfileStatus::Corrupted,
        }
    }
}

/// Listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileFilter {
    /// Restrict to one platform
    pub platform: Option<Platform>,
    /// Restrict by effective status
    pub state: StateFilter,
}

impl ProfileFilter {
    /// Every profile of every platform
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to `platform`
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Restrict by effective status
    pub fn with_state(mut self, state: StateFilter) -> Self {
        self.state = state;
        self
    }
}

/// One entry of [`ProfileManager::list`].
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    /// Platform
    pub platform: Platform,
    /// Profile identifier
    pub profile_id: ProfileId,
    /// Profile directory
    pub directory: PathBuf,
    /// `active` iff a live process holds the lock, `corrupted` if the
    /// metadata failed to load or is marked so, else `inactive`
    pub status: ProfileStatus,
    /// Whether this manager holds it
    pub active_here: bool,
    /// Pid of the live lock holder
    pub lock_holder: Option<u32>,
    /// Loaded metadata, when it loaded
    pub metadata: Option<ProfileMetadata>,
    /// Why the metadata did not load
    pub problem: Option<String>,
}

/// A profile held by a live process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockedProfile {
    /// Profile identifier
    pub profile_id: ProfileId,
    /// Holder pid, when the lock is readable
    pub holder_pid: Option<u32>,
}

/// Result of [`ProfileManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct PlatformStatus {
    /// Platform
    pub platform: Platform,
    /// Profile this manager holds
    pub active_here: Option<ProfileId>,
    /// Profiles locked by any live process
    pub locked: Vec<LockedProfile>,
}

/// Read-only view handed to the backup collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    /// Platform
    pub platform: Platform,
    /// Profile identifier
    pub profile_id: ProfileId,
    /// Profile directory
    pub directory: PathBuf,
    /// Metadata at snapshot time
    pub metadata: ProfileMetadata,
}

/// What [`ProfileManager::reconcile`] repaired.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Stale lock files removed
    pub removed_locks: Vec<PathBuf>,
    /// Profiles reset from `active` to `inactive` because no live process
    /// held them
    pub reset_profiles: Vec<(Platform, ProfileId)>,
}

#[derive(Debug)]
struct HeldProfile {
    profile_id: ProfileId,
    lock: LockHandle,
}

#[derive(Debug, Default)]
struct PlatformSlot {
    held: Option<HeldProfile>,
}

type SlotGuard = OwnedMutexGuard<PlatformSlot>;

#[derive(Debug)]
struct Inner {
    config: ProfileStoreConfig,
    resolver: PathResolver,
    metadata: MetadataStore,
    locks: LockManager,
    registry: Arc<Registry>,
    slots: parking_lot::Mutex<HashMap<Platform, Arc<AsyncMutex<PlatformSlot>>>>,
    #[cfg(test)]
    fail_before_metadata: std::sync::atomic::AtomicBool,
}

/// Profile lifecycle manager.
///
/// Cheap to clone; clones share state. Locks still held when the last clone
/// drops are released, but metadata keeps saying `active` until the next
/// [`ProfileManager::open`] reconciles it. Call
/// [`ProfileManager::shutdown`] for a clean exit.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tweakio_profile_store::prelude::*;
///
/// # async fn example() -> tweakio_errors::Result<()> {
/// let manager = ProfileManager::open(ProfileStoreConfig::default(), Arc::new(Registry::new())).await?;
/// let id = ProfileId::new("support_bot")?;
///
/// manager.create(Platform::WhatsApp, &id).await?;
/// manager.activate(Platform::WhatsApp, &id).await?;
/// assert!(manager.is_active(Platform::WhatsApp, &id));
/// manager.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProfileManager {
    inner: Arc<Inner>,
}

impl ProfileManager {
    /// Open the store at `config.root_dir`, creating its layout and
    /// reconciling state left by dead processes.
    ///
    /// # Errors
    ///
    /// A storage error if the configuration is invalid, the root cannot be
    /// created, or reconciliation hits an I/O failure.
    pub async fn open(config: ProfileStoreConfig, registry: Arc<Registry>) -> Result<Self> {
        let locks = LockManager::new(&config);
        Self::open_with_locks(config, registry, locks).await
    }

    /// Like [`ProfileManager::open`] with a custom liveness probe.
    ///
    /// # Errors
    ///
    /// Same as [`ProfileManager::open`].
    pub async fn open_with_probe(
        config: ProfileStoreConfig,
        registry: Arc<Registry>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Result<Self> {
        let locks = LockManager::new(&config).with_probe(probe);
        Self::open_with_locks(config, registry, locks).await
    }

    async fn open_with_locks(
        config: ProfileStoreConfig,
        registry: Arc<Registry>,
        locks: LockManager,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = PathResolver::new(&config.root_dir);
        for platform in Platform::all() {
            storage::ensure_dir(&resolver.platform_dir(platform))
                .await
                .map_err(|e| e.into_profile_error(Operation::Open))?;
        }

        let manager = Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                metadata: MetadataStore::new(),
                locks,
                registry,
                slots: parking_lot::Mutex::new(HashMap::new()),
                #[cfg(test)]
                fail_before_metadata: std::sync::atomic::AtomicBool::new(false),
            }),
        };

        let report = manager.reconcile().await?;
        info!(
            root = ?manager.inner.config.root_dir,
            removed_locks = report.removed_locks.len(),
            reset_profiles = report.reset_profiles.len(),
            "Profile store opened"
        );
        Ok(manager)
    }

    /// Configuration in use
    pub fn config(&self) -> &ProfileStoreConfig {
        &self.inner.config
    }

    /// Registry this manager updates
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Path resolver for this store's root
    pub fn resolver(&self) -> &PathResolver {
        &self.inner.resolver
    }

    /// Directory of a profile. Pure; the profile need not exist.
    pub fn profile_directory(&self, platform: Platform, profile_id: &ProfileId) -> PathBuf {
        self.inner.resolver.locate(platform, profile_id).dir
    }

    /// Whether this manager holds `profile_id` as the active profile of
    /// `platform`.
    pub fn is_active(&self, platform: Platform, profile_id: &ProfileId) -> bool {
        self.inner.registry.is_active(platform, profile_id)
    }

    /// Remove stale locks and reset `active` records nobody holds.
    ///
    /// # Errors
    ///
    /// A storage error on I/O failure.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let inner = &self.inner;
        let removed_locks = inner
            .locks
            .cleanup_stale()
            .await
            .map_err(|e| e.into_profile_error(Operation::Open))?;

        let mut reset_profiles = Vec::new();
        for platform in Platform::all() {
            for profile_id in inner.profile_ids(platform).await? {
                let location = inner.resolver.locate(platform, &profile_id);
                if inner.reset_if_orphaned(&location).await? {
                    reset_profiles.push((platform, profile_id));
                }
            }
        }

        Ok(ReconcileReport {
            removed_locks,
            reset_profiles,
        })
    }

    /// Create a profile with its directory tree, placeholder session
    /// artifacts and an inactive metadata record.
    ///
    /// Any failure after the directory is created removes everything created
    /// so far before the error is returned.
    ///
    /// # Errors
    ///
    /// [`ProfileError::Duplicate`] if the directory exists, otherwise a
    /// storage or partial-write error.
    pub async fn create(&self, platform: Platform, profile_id: &ProfileId) -> Result<ProfileMetadata> {
        let inner = Arc::clone(&self.inner);
        let location = inner.resolver.locate(platform, profile_id);
        let guard = inner.slot(platform).lock_owned().await;

        let task_inner = Arc::clone(&inner);
        detached(Operation::Create, &inner.config.root_dir, async move {
            let _guard = guard;
            task_inner.create_locked(&location).await
        })
        .await
    }

    /// Make `profile_id` the active profile of `platform` for this process.
    ///
    /// A no-op if it already is. Otherwise the profile's lock is acquired
    /// (waiting up to the configured timeout), the previously active profile
    /// of the platform is deactivated, and the metadata is updated.
    ///
    /// # Errors
    ///
    /// - [`ProfileError::NotFound`] if the profile does not exist
    /// - [`ProfileError::Corruption`] if its metadata is invalid or marked corrupted
    /// - [`ProfileError::LockTimeout`] if the profile, or another profile of
    ///   the platform, stays held by a live process past the timeout
    /// - storage or partial-write errors; the previous profile then stays
    ///   active unless its lock could not be released, in which case it is
    ///   marked corrupted
    pub async fn activate(&self, platform: Platform, profile_id: &ProfileId) -> Result<ProfileMetadata> {
        let op = Operation::Activate;
        let inner = Arc::clone(&self.inner);
        let location = inner.resolver.locate(platform, profile_id);

        let mut guard = inner.slot(platform).lock_owned().await;
        if guard
            .held
            .as_ref()
            .is_some_and(|held| &held.profile_id == profile_id)
        {
            debug!(platform = %platform, profile_id = %profile_id, "Profile already active");
            return inner.load_checked(&location, op).await;
        }

        inner.ensure_exists(&location, op).await?;
        inner.load_activatable(&location).await?;

        let deadline = Instant::now() + inner.locks.timeout();
        let lock_error = |e: LockError| {
            e.into_profile_error(op, platform.as_str(), profile_id.as_str())
        };
        let gate = inner
            .locks
            .acquire_until(&inner.resolver.activation_gate(platform), deadline)
            .await
            .map_err(lock_error)?;
        let lock = inner
            .locks
            .acquire_until(&location.lock_path(), deadline)
            .await
            .map_err(lock_error)?;

        let previous = guard.held.as_ref().map(|held| held.profile_id.clone());
        inner
            .wait_for_exclusive(&location, previous.as_ref(), deadline)
            .await?;

        let task_inner = Arc::clone(&inner);
        detached(op, &inner.config.root_dir, async move {
            task_inner
                .commit_activation(&mut guard, location, lock, gate)
                .await
        })
        .await
    }

    /// Deactivate whatever this manager holds for `platform`.
    ///
    /// Returns the deactivated profile, or `None` if nothing was active.
    ///
    /// # Errors
    ///
    /// A storage or partial-write error; if the metadata update fails the
    /// profile stays active.
    pub async fn deactivate(&self, platform: Platform) -> Result<Option<ProfileId>> {
        let inner = Arc::clone(&self.inner);
        let mut guard = inner.slot(platform).lock_owned().await;
        if guard.held.is_none() {
            debug!(platform = %platform, "Nothing to deactivate");
            return Ok(None);
        }

        let task_inner = Arc::clone(&inner);
        detached(Operation::Deactivate, &inner.config.root_dir, async move {
            task_inner.deactivate_held(platform, &mut guard).await
        })
        .await
    }

    /// Delete a profile directory.
    ///
    /// Without `force`, a profile held by this manager or locked by any live
    /// process is refused. With `force` a held profile is deactivated first
    /// and a foreign lock is removed along with the tree.
    ///
    /// # Errors
    ///
    /// [`ProfileError::NotFound`], [`ProfileError::Active`], or a storage
    /// error if removal fails; a retry then continues where it stopped.
    pub async fn delete(&self, platform: Platform, profile_id: &ProfileId, force: bool) -> Result<()> {
        let op = Operation::Delete;
        let inner = Arc::clone(&self.inner);
        let location = inner.resolver.locate(platform, profile_id);
        let mut guard = inner.slot(platform).lock_owned().await;

        inner.ensure_exists(&location, op).await?;
        let held_here = guard
            .held
            .as_ref()
            .is_some_and(|held| &held.profile_id == profile_id);

        // Take the profile's lock so no activation can start mid-removal.
        let lock = if held_here {
            None
        } else {
            inner
                .locks
                .try_acquire(&location.lock_path())
                .await
                .map_err(|e| e.for_profile(op, &location))?
        };
        let held_elsewhere = !held_here && lock.is_none();

        if held_here || held_elsewhere {
            let holder = if held_here {
                Some(std::process::id())
            } else {
                inner
                    .locks
                    .state(&location.lock_path())
                    .await
                    .ok()
                    .and_then(|s| s.holder_pid())
            };
            if !force {
                return Err(ProfileError::active(
                    op,
                    platform.as_str(),
                    profile_id.as_str(),
                    holder,
                ));
            }
            warn!(
                platform = %platform,
                profile_id = %profile_id,
                holder_pid = ?holder,
                "Forcing deletion of an active profile"
            );
        }

        let task_inner = Arc::clone(&inner);
        detached(op, &inner.config.root_dir, async move {
            let mut lock = lock;
            if held_here {
                task_inner.deactivate_held(platform, &mut guard).await?;
            }

            if let Err(e) = storage::remove_profile_tree(&location.dir).await {
                if let Some(lock) = lock.as_mut() {
                    release_logged(lock).await;
                }
                return Err(e.for_profile(op, &location));
            }
            // The lock file went with the tree; the handle has nothing left to release.
            drop(lock);
            if task_inner.registry.is_active(platform, &location.profile_id) {
                task_inner.registry.clear_active(platform);
            }

            info!(platform = %platform, profile_id = %location.profile_id, "Profile deleted");
            Ok(())
        })
        .await
    }

    /// Rebuild a profile's metadata; see [`RecoveryMode`].
    ///
    /// The profile's lock is held for the duration so no process can
    /// activate it mid-rebuild.
    ///
    /// # Errors
    ///
    /// [`ProfileError::NotFound`], [`ProfileError::Active`] if the profile is
    /// held, or [`ProfileError::Recovery`] if the directory is unreadable or
    /// a repair step fails.
    pub async fn recover(
        &self,
        platform: Platform,
        profile_id: &ProfileId,
        mode: RecoveryMode,
    ) -> Result<ProfileMetadata> {
        let op = Operation::Recover;
        let inner = Arc::clone(&self.inner);
        let location = inner.resolver.locate(platform, profile_id);
        let guard = inner.slot(platform).lock_owned().await;

        let as_recovery = |e: ProfileError| match e {
            ProfileError::Storage { reason, .. } | ProfileError::PartialWrite { reason, .. } => {
                ProfileError::recovery(platform.as_str(), profile_id.as_str(), reason)
            }
            other => other,
        };

        inner.ensure_exists(&location, op).await.map_err(as_recovery)?;
        if guard
            .held
            .as_ref()
            .is_some_and(|held| &held.profile_id == profile_id)
        {
            return Err(ProfileError::active(
                op,
                platform.as_str(),
                profile_id.as_str(),
                Some(std::process::id()),
            ));
        }

        let lock = inner
            .locks
            .try_acquire(&location.lock_path())
            .await
            .map_err(|e| as_recovery(e.for_profile(op, &location)))?;
        let Some(mut lock) = lock else {
            let holder = inner
                .locks
                .state(&location.lock_path())
                .await
                .ok()
                .and_then(|s| s.holder_pid());
            return Err(ProfileError::active(
                op,
                platform.as_str(),
                profile_id.as_str(),
                holder,
            ));
        };

        let task_inner = Arc::clone(&inner);
        detached(op, &inner.config.root_dir, async move {
            let _guard = guard;
            let result = recovery::reconstruct(&task_inner.metadata, &location, mode).await;
            release_logged(&mut lock).await;
            result
        })
        .await
    }

    /// Load a profile's metadata. Salvageable corruption is recorded in the
    /// file before the error is returned.
    ///
    /// # Errors
    ///
    /// [`ProfileError::NotFound`] or [`ProfileError::Corruption`].
    pub async fn get(&self, platform: Platform, profile_id: &ProfileId) -> Result<ProfileMetadata> {
        let location = self.inner.resolver.locate(platform, profile_id);
        self.inner.ensure_exists(&location, Operation::Load).await?;
        self.inner.load_checked(&location, Operation::Load).await
    }

    /// Read-only snapshot for the backup collaborator.
    ///
    /// # Errors
    ///
    /// [`ProfileError::Active`] while the profile is locked,
    /// [`ProfileError::NotFound`] or [`ProfileError::Corruption`].
    pub async fn snapshot(&self, platform: Platform, profile_id: &ProfileId) -> Result<ProfileSnapshot> {
        let op = Operation::Snapshot;
        let inner = &self.inner;
        let location = inner.resolver.locate(platform, profile_id);
        inner.ensure_exists(&location, op).await?;

        let state = inner
            .locks
            .state(&location.lock_path())
            .await
            .map_err(|e| e.for_profile(op, &location))?;
        if state.is_held() || inner.registry.is_active(platform, profile_id) {
            return Err(ProfileError::active(
                op,
                platform.as_str(),
                profile_id.as_str(),
                state.holder_pid(),
            ));
        }

        let metadata = inner.load_checked(&location, op).await?;
        Ok(ProfileSnapshot {
            platform,
            profile_id: profile_id.clone(),
            directory: location.dir,
            metadata,
        })
    }

    /// Enumerate profiles, sorted by platform then id.
    ///
    /// Profiles whose metadata fails to load are listed as corrupted.
    ///
    /// # Errors
    ///
    /// A storage error if a platform directory cannot be listed.
    pub async fn list(&self, filter: &ProfileFilter) -> Result<Vec<ProfileSummary>> {
        let platforms: Vec<Platform> = match filter.platform {
            Some(platform) => vec![platform],
            None => Platform::all().collect(),
        };

        let mut summaries = Vec::new();
        for platform in platforms {
            for profile_id in self.inner.profile_ids(platform).await? {
                let summary = self.inner.summarize(platform, profile_id).await;
                if filter.state.matches(summary.status) {
                    summaries.push(summary);
                }
            }
        }
        summaries.sort_by(|a, b| (a.platform, &a.profile_id).cmp(&(b.platform, &b.profile_id)));
        Ok(summaries)
    }

    /// Which profile this manager holds for `platform`, and which profiles
    /// of it any live process holds.
    ///
    /// # Errors
    ///
    /// A storage error on I/O failure.
    pub async fn status(&self, platform: Platform) -> Result<PlatformStatus> {
        let inner = &self.inner;
        let mut locked = Vec::new();
        for profile_id in inner.profile_ids(platform).await? {
            let location = inner.resolver.locate(platform, &profile_id);
            let state = inner
                .locks
                .state(&location.lock_path())
                .await
                .map_err(|e| e.for_profile(Operation::Load, &location))?;
            if state.is_held() {
                locked.push(LockedProfile {
                    holder_pid: state.holder_pid(),
                    profile_id,
                });
            }
        }

        Ok(PlatformStatus {
            platform,
            active_here: inner.registry.get_active(platform),
            locked,
        })
    }

    /// Deactivate every platform this manager holds.
    ///
    /// # Errors
    ///
    /// The first deactivation failure; the remaining platforms are still
    /// attempted.
    pub async fn shutdown(&self) -> Result<()> {
        let platforms: Vec<Platform> = {
            let mut platforms: Vec<_> = self.inner.slots.lock().keys().copied().collect();
            platforms.sort();
            platforms
        };

        let mut first_error = None;
        for platform in platforms {
            if let Err(err) = self.deactivate(platform).await {
                warn!(platform = %platform, error = %err, "Deactivation failed during shutdown");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Run `task` to completion in its own task, independent of the caller.
async fn detached<T, F>(operation: Operation, root: &Path, task: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(task).await.map_err(|e| {
        ProfileError::storage(
            operation,
            root.display().to_string(),
            format!("background task failed: {e}"),
        )
    })?
}

async fn release_logged(lock: &mut LockHandle) {
    if let Err(e) = lock.release().await {
        warn!(path = ?lock.path(), error = %e, "Failed to release lock");
    }
}

impl Inner {
    fn slot(&self, platform: Platform) -> Arc<AsyncMutex<PlatformSlot>> {
        Arc::clone(self.slots.lock().entry(platform).or_default())
    }

    async fn profile_ids(&self, platform: Platform) -> Result<Vec<ProfileId>> {
        let dir = self.resolver.platform_dir(platform);
        let names = storage::list_subdirectories(&dir)
            .await
            .map_err(|e| e.into_profile_error(Operation::List))?;

        Ok(names
            .into_iter()
            .filter_map(|name| match ProfileId::new(name.as_str()) {
                Ok(id) => Some(id),
                Err(_) => {
                    debug!(platform = %platform, name = %name, "Skipping non-profile directory");
                    None
                }
            })
            .collect())
    }

    async fn ensure_exists(&self, location: &ProfileLocation, operation: Operation) -> Result<()> {
        let not_found = || {
            ProfileError::not_found(location.platform.as_str(), location.profile_id.as_str())
        };
        match tokio::fs::metadata(&location.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(not_found()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(StorageError::read_failed(&location.dir, e).for_profile(operation, location)),
        }
    }

    async fn mark_if_salvageable(&self, location: &ProfileLocation, err: &MetadataError) {
        if !matches!(
            err,
            MetadataError::Corrupted {
                salvageable: true,
                ..
            }
        ) {
            return;
        }
        match self.metadata.mark_corrupted(&location.metadata_path()).await {
            Ok(true) => warn!(
                platform = %location.platform,
                profile_id = %location.profile_id,
                reason = %err,
                "Profile marked corrupted"
            ),
            Ok(false) => {}
            Err(e) => warn!(profile = %location, error = %e, "Failed to mark profile corrupted"),
        }
    }

    async fn load_checked(&self, location: &ProfileLocation, operation: Operation) -> Result<ProfileMetadata> {
        match self.metadata.load_at(location).await {
            Ok(record) => Ok(record),
            Err(err) => {
                self.mark_if_salvageable(location, &err).await;
                Err(err.into_profile_error(
                    operation,
                    location.platform.as_str(),
                    location.profile_id.as_str(),
                ))
            }
        }
    }

    async fn load_activatable(&self, location: &ProfileLocation) -> Result<ProfileMetadata> {
        let record = self.load_checked(location, Operation::Activate).await?;
        if record.status == ProfileStatus::Corrupted {
            return Err(ProfileError::corruption(
                Operation::Activate,
                location.platform.as_str(),
                location.profile_id.as_str(),
                "profile is marked corrupted; recover it first",
            ));
        }
        Ok(record)
    }

    async fn create_locked(&self, location: &ProfileLocation) -> Result<ProfileMetadata> {
        let op = Operation::Create;
        storage::ensure_dir(&self.resolver.platform_dir(location.platform))
            .await
            .map_err(|e| e.into_profile_error(op))?;

        match storage::create_dir_new(&location.dir).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => {
                return Err(ProfileError::duplicate(
                    location.platform.as_str(),
                    location.profile_id.as_str(),
                ));
            }
            Err(e) => return Err(e.for_profile(op, location)),
        }

        match self.populate(location).await {
            Ok(record) => {
                info!(
                    platform = %location.platform,
                    profile_id = %location.profile_id,
                    path = ?location.dir,
                    "Profile created"
                );
                Ok(record)
            }
            Err(err) => {
                warn!(profile = %location, error = %err, "Profile creation failed, rolling back");
                if let Err(cleanup) = storage::remove_profile_tree(&location.dir).await {
                    warn!(path = ?location.dir, error = %cleanup, "Rollback left files behind");
                }
                Err(err)
            }
        }
    }

    async fn populate(&self, location: &ProfileLocation) -> Result<ProfileMetadata> {
        let op = Operation::Create;
        for sub in layout::SUBDIRECTORIES {
            storage::ensure_dir(&location.file(sub))
                .await
                .map_err(|e| e.for_profile(op, location))?;
        }
        for artifact in location.platform.session_artifacts() {
            storage::write_atomic(&location.file(artifact.file_name), artifact.placeholder)
                .await
                .map_err(|e| e.for_profile(op, location))?;
        }

        #[cfg(test)]
        if self.fail_before_metadata.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ProfileError::partial_write(
                op,
                location.metadata_path().display().to_string(),
                "simulated write failure",
            )
            .with_profile(location.platform.as_str(), location.profile_id.as_str()));
        }

        let record = ProfileMetadata::new(location.platform, location.profile_id.clone());
        self.metadata
            .save(&location.metadata_path(), &record)
            .await
            .map_err(|e| {
                e.into_profile_error(op, location.platform.as_str(), location.profile_id.as_str())
            })?;
        Ok(record)
    }

    /// Reset a record saying `active` when no live process holds its lock.
    /// Takes the lock while doing so, so a concurrent activation cannot be
    /// overwritten.
    async fn reset_if_orphaned(&self, location: &ProfileLocation) -> Result<bool> {
        let op = Operation::Open;
        if !matches!(self.metadata.load_at(location).await, Ok(ref r) if r.is_active()) {
            return Ok(false);
        }

        let Some(mut lock) = self
            .locks
            .try_acquire(&location.lock_path())
            .await
            .map_err(|e| e.for_profile(op, location))?
        else {
            return Ok(false);
        };

        let result = self.reset_locked(location).await;
        release_logged(&mut lock).await;
        result
    }

    async fn reset_locked(&self, location: &ProfileLocation) -> Result<bool> {
        let mut record = match self.metadata.load_at(location).await {
            Ok(record) if record.is_active() => record,
            _ => return Ok(false),
        };
        let stale_pid = record.lock_pid;
        record.deactivate();
        self.metadata
            .save(&location.metadata_path(), &record)
            .await
            .map_err(|e| {
                e.into_profile_error(
                    Operation::Open,
                    location.platform.as_str(),
                    location.profile_id.as_str(),
                )
            })?;
        warn!(
            platform = %location.platform,
            profile_id = %location.profile_id,
            pid = ?stale_pid,
            "Reset active status left by a process that no longer holds the lock"
        );
        Ok(true)
    }

    /// Wait until no profile of the platform other than `target` and
    /// `previous` is held by a live process. Stale holders are reclaimed on
    /// the way.
    async fn wait_for_exclusive(
        &self,
        target: &ProfileLocation,
        previous: Option<&ProfileId>,
        deadline: Instant,
    ) -> Result<()> {
        let platform = target.platform;
        let started = Instant::now();
        let mut delay = self.config.lock_retry_initial;

        loop {
            let mut blocker = None;
            for other in self.profile_ids(platform).await? {
                if other == target.profile_id || Some(&other) == previous {
                    continue;
                }
                let location = self.resolver.locate(platform, &other);
                let state = self
                    .locks
                    .state(&location.lock_path())
                    .await
                    .map_err(|e| e.for_profile(Operation::Activate, &location))?;
                if state.is_held() {
                    blocker = Some((other, state.holder_pid()));
                    break;
                }
                if matches!(state, LockState::Stale { .. })
                    && let Err(err) = self.locks.remove_if_stale(&location.lock_path()).await
                {
                    warn!(profile = %location, error = %err, "Could not remove stale lock");
                }
                if let Err(err) = self.reset_if_orphaned(&location).await {
                    warn!(profile = %location, error = %err, "Could not reset orphaned profile");
                }
            }

            let Some((other, holder)) = blocker else {
                return Ok(());
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    platform = %platform,
                    profile_id = %target.profile_id,
                    blocking = %other,
                    holder_pid = ?holder,
                    "Another profile of the platform stayed active"
                );
                return Err(ProfileError::lock_timeout(
                    platform.as_str(),
                    target.profile_id.as_str(),
                    holder,
                    u64::try_from(now.duration_since(started).as_millis()).unwrap_or(u64::MAX),
                ));
            }

            debug!(platform = %platform, blocking = %other, holder_pid = ?holder, "Waiting for platform");
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.config.lock_retry_max);
        }
    }

    async fn commit_activation(
        &self,
        guard: &mut SlotGuard,
        location: ProfileLocation,
        mut lock: LockHandle,
        mut gate: LockHandle,
    ) -> Result<ProfileMetadata> {
        let result = match self.switch_to(guard, &location).await {
            Ok(record) => {
                guard.held = Some(HeldProfile {
                    profile_id: location.profile_id.clone(),
                    lock,
                });
                self.registry
                    .set_active(location.platform, location.profile_id.clone());
                info!(
                    platform = %location.platform,
                    profile_id = %location.profile_id,
                    pid = ?record.lock_pid,
                    "Profile activated"
                );
                Ok(record)
            }
            Err(err) => {
                release_logged(&mut lock).await;
                Err(err)
            }
        };
        release_logged(&mut gate).await;
        result
    }

    async fn switch_to(&self, guard: &mut SlotGuard, location: &ProfileLocation) -> Result<ProfileMetadata> {
        let op = Operation::Activate;
        // Re-read under the lock; another process may have changed it.
        let mut record = self.load_activatable(location).await?;

        if let Some(previous) = guard.held.take() {
            self.retire_previous(location.platform, previous, guard).await?;
        }

        record.activate(std::process::id());
        self.metadata
            .save(&location.metadata_path(), &record)
            .await
            .map_err(|e| {
                e.into_profile_error(op, location.platform.as_str(), location.profile_id.as_str())
            })?;
        Ok(record)
    }

    /// Deactivate the profile being replaced by an activation.
    ///
    /// Metadata goes first: if it cannot be written the previous profile is
    /// put back and stays fully active. If its lock then cannot be released
    /// it is marked corrupted and dropped from the registry.
    async fn retire_previous(
        &self,
        platform: Platform,
        previous: HeldProfile,
        guard: &mut SlotGuard,
    ) -> Result<()> {
        let location = self.resolver.locate(platform, &previous.profile_id);
        if let Err(err) = self.write_inactive_with_retry(&location).await {
            warn!(profile = %location, error = %err, "Previous profile kept active");
            guard.held = Some(previous);
            return Err(err);
        }

        let HeldProfile {
            profile_id,
            mut lock,
        } = previous;
        let released = match lock.release().await {
            Ok(_) => Ok(()),
            Err(first) => {
                warn!(profile = %location, error = %first, "Retrying lock release");
                lock.release().await.map(|_| ())
            }
        };
        self.registry.clear_active(platform);

        if let Err(err) = released {
            warn!(
                platform = %platform,
                profile_id = %profile_id,
                error = %err,
                "Previous profile lock could not be released, marking it corrupted"
            );
            if let Err(mark) = self.metadata.mark_corrupted(&location.metadata_path()).await {
                warn!(profile = %location, error = %mark, "Failed to mark profile corrupted");
            }
            return Err(err.for_profile(Operation::Deactivate, &location));
        }

        info!(platform = %platform, profile_id = %profile_id, "Previous profile deactivated");
        Ok(())
    }

    async fn write_inactive(&self, location: &ProfileLocation) -> Result<()> {
        let op = Operation::Deactivate;
        let mut record = match self.metadata.load_at(location).await {
            Ok(record) => record,
            Err(err) if err.is_corruption() => {
                warn!(profile = %location, reason = %err, "Metadata corrupted at deactivation, leaving it for recovery");
                self.mark_if_salvageable(location, &err).await;
                return Ok(());
            }
            Err(err) => {
                return Err(err.into_profile_error(
                    op,
                    location.platform.as_str(),
                    location.profile_id.as_str(),
                ));
            }
        };

        record.deactivate();
        self.metadata
            .save(&location.metadata_path(), &record)
            .await
            .map_err(|e| {
                e.into_profile_error(op, location.platform.as_str(), location.profile_id.as_str())
            })
    }

    async fn write_inactive_with_retry(&self, location: &ProfileLocation) -> Result<()> {
        match self.write_inactive(location).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(profile = %location, error = %first, "Retrying metadata update");
                self.write_inactive(location).await
            }
        }
    }

    async fn deactivate_held(&self, platform: Platform, guard: &mut SlotGuard) -> Result<Option<ProfileId>> {
        let Some(held) = guard.held.take() else {
            return Ok(None);
        };
        let location = self.resolver.locate(platform, &held.profile_id);

        // Metadata before the lock: once the lock is gone another process
        // may activate and write this record.
        if let Err(err) = self.write_inactive_with_retry(&location).await {
            guard.held = Some(held);
            return Err(err);
        }

        let HeldProfile {
            profile_id,
            mut lock,
        } = held;
        self.registry.clear_active(platform);
        lock.release()
            .await
            .map_err(|e| e.for_profile(Operation::Deactivate, &location))?;

        info!(platform = %platform, profile_id = %profile_id, "Profile deactivated");
        Ok(Some(profile_id))
    }

    async fn summarize(&self, platform: Platform, profile_id: ProfileId) -> ProfileSummary {
        let location = self.resolver.locate(platform, &profile_id);

        let lock_state = match self.locks.state(&location.lock_path()).await {
            Ok(state) => state,
            Err(e) => {
                debug!(profile = %location, error = %e, "Lock unreadable while listing");
                LockState::Free
            }
        };
        let locked = lock_state.is_held();

        let (metadata, problem) = match self.load_checked(&location, Operation::List).await {
            Ok(record) => (Some(record), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let status = match &metadata {
            None => ProfileStatus::Corrupted,
            Some(record) if record.status == ProfileStatus::Corrupted => ProfileStatus::Corrupted,
            Some(_) if locked => ProfileStatus::Active,
            Some(_) => ProfileStatus::Inactive,
        };

        ProfileSummary {
            active_here: self.registry.is_active(platform, &profile_id),
            lock_holder: if locked { lock_state.holder_pid() } else { None },
            directory: location.dir,
            platform,
            profile_id,
            status,
            metadata,
            problem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn must<T, E: std::fmt::Debug>(r: std::result::Result<T, E>) -> T {
        r.expect("operation should succeed")
    }

    fn id(value: &str) -> ProfileId {
        must(ProfileId::new(value))
    }

    async fn open(temp_dir: &TempDir) -> ProfileManager {
        let config = ProfileStoreConfig::new(temp_dir.path())
            .with_lock_timeout(std::time::Duration::from_millis(300))
            .with_lock_retry(
                std::time::Duration::from_millis(5),
                std::time::Duration::from_millis(25),
            );
        must(ProfileManager::open(config, Arc::new(Registry::new())).await)
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back_directory() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;
        let bot = id("bot");
        manager
            .inner
            .fail_before_metadata
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = manager.create(Platform::WhatsApp, &bot).await.err();
        match err {
            Some(ProfileError::PartialWrite { profile_id, .. }) => {
                assert_eq!(profile_id.as_deref(), Some("bot"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!manager.profile_directory(Platform::WhatsApp, &bot).exists());
        let platform_dir = manager.resolver().platform_dir(Platform::WhatsApp);
        assert_eq!(must(std::fs::read_dir(&platform_dir)).count(), 0);
        assert!(must(manager.list(&ProfileFilter::all()).await).is_empty());

        manager
            .inner
            .fail_before_metadata
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let record = must(manager.create(Platform::WhatsApp, &bot).await);
        assert_eq!(record.status, ProfileStatus::Inactive);
    }

    #[tokio::test]
    async fn test_create_writes_layout() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;

        let record = must(manager.create(Platform::WhatsApp, &id("bot")).await);
        assert_eq!(record.status, ProfileStatus::Inactive);

        let dir = manager.profile_directory(Platform::WhatsApp, &id("bot"));
        for sub in layout::SUBDIRECTORIES {
            assert!(dir.join(sub).is_dir(), "{sub} missing");
        }
        assert_eq!(must(std::fs::read_to_string(dir.join("session.json"))), "{}");
        assert!(!dir.join(layout::DATABASE_FILE).exists());
        assert!(!dir.join(layout::LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_populate_fails_on_blocked_layout() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;
        let location = manager.resolver().locate(Platform::WhatsApp, &id("bot"));

        // A file where the cache directory should go.
        must(std::fs::create_dir_all(&location.dir));
        must(std::fs::write(location.cache_dir(), "not a dir"));
        assert!(manager.inner.populate(&location).await.is_err());
        assert!(!location.metadata_path().exists());
    }

    #[tokio::test]
    async fn test_create_existing_entry_is_duplicate() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);

        let err = manager.create(Platform::WhatsApp, &bot).await.err();
        assert!(matches!(err, Some(ProfileError::Duplicate { .. })));
        assert!(manager.profile_directory(Platform::WhatsApp, &bot).join(layout::METADATA_FILE).exists());

        // A plain file with the profile's name counts too, and is left alone.
        let blocker = manager.profile_directory(Platform::WhatsApp, &id("blocked"));
        must(std::fs::write(&blocker, "x"));
        let err = manager.create(Platform::WhatsApp, &id("blocked")).await.err();
        assert!(matches!(err, Some(ProfileError::Duplicate { .. })));
        assert_eq!(must(std::fs::read_to_string(&blocker)), "x");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_forced_delete_logs_warning() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::Arattai, &bot).await);
        must(manager.activate(Platform::Arattai, &bot).await);

        let refused = manager.delete(Platform::Arattai, &bot, false).await.err();
        assert!(matches!(
            refused,
            Some(ProfileError::Active {
                holder_pid: Some(_),
                ..
            })
        ));

        must(manager.delete(Platform::Arattai, &bot, true).await);
        assert!(logs_contain("Forcing deletion of an active profile"));
        assert!(!manager.is_active(Platform::Arattai, &bot));
        assert!(!manager.profile_directory(Platform::Arattai, &bot).exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_resets_orphaned_active_status() {
        let temp_dir = must(TempDir::new());
        let bot = id("bot");
        {
            let manager = open(&temp_dir).await;
            must(manager.create(Platform::WhatsApp, &bot).await);
            must(manager.activate(Platform::WhatsApp, &bot).await);
            // Dropped without shutdown: the lock goes, the record stays active.
        }

        let manager = open(&temp_dir).await;
        let record = must(manager.get(Platform::WhatsApp, &bot).await);
        assert_eq!(record.status, ProfileStatus::Inactive);
        assert!(logs_contain("Reset active status"));
    }

    #[tokio::test]
    async fn test_activate_refuses_marked_corrupted() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);

        let path = manager
            .profile_directory(Platform::WhatsApp, &bot)
            .join(layout::METADATA_FILE);
        let mut value: serde_json::Value = must(serde_json::from_slice(&must(std::fs::read(&path))));
        value["status"] = serde_json::json!("active");
        must(std::fs::write(&path, must(serde_json::to_vec(&value))));

        let err = manager.activate(Platform::WhatsApp, &bot).await.err();
        assert!(matches!(err, Some(ProfileError::Corruption { .. })));

        let patched: serde_json::Value = must(serde_json::from_slice(&must(std::fs::read(&path))));
        assert_eq!(patched["status"], "corrupted");

        let err = manager.activate(Platform::WhatsApp, &bot).await.err();
        assert!(matches!(err, Some(ProfileError::Corruption { .. })));
    }

    #[tokio::test]
    async fn test_recover_refuses_held_profile() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);
        must(manager.activate(Platform::WhatsApp, &bot).await);

        let err = manager
            .recover(Platform::WhatsApp, &bot, RecoveryMode::Soft)
            .await
            .err();
        assert!(matches!(err, Some(ProfileError::Active { .. })));
    }

    #[tokio::test]
    async fn test_status_reports_local_and_locked() {
        let temp_dir = must(TempDir::new());
        let manager = open(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);
        must(manager.activate(Platform::WhatsApp, &bot).await);

        let status = must(manager.status(Platform::WhatsApp).await);
        assert_eq!(status.active_here, Some(bot.clone()));
        assert_eq!(
            status.locked,
            vec![LockedProfile {
                profile_id: bot,
                holder_pid: Some(std::process::id()),
            }]
        );

        let other = must(manager.status(Platform::Arattai).await);
        assert!(other.active_here.is_none());
        assert!(other.locked.is_empty());
    }
}
