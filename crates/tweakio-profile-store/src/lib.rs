//! Browser-session profile storage for tweakio messaging automation
//!
//! Each messaging platform (WhatsApp, Arattai) owns a set of named profiles,
//! one directory per profile holding browser session state, cache, media
//! and a `metadata.json` record. At most one profile per platform is active
//! at a time, and a profile is active in at most one process, enforced with
//! PID lock files that dead processes cannot wedge.
//!
//! # Architecture
//!
//! - [`platform`]: the closed set of supported platforms
//! - [`paths`]: identifier validation and the on-disk layout
//! - [`storage`]: atomic writes, exclusive creation and tree removal
//! - [`metadata`]: the metadata record, validation and persistence
//! - [`lock`] and [`liveness`]: cross-process lock files with stale reclaim
//! - [`registry`]: this process's active profile per platform
//! - [`recovery`]: metadata reconstruction for corrupted profiles
//! - [`manager`]: the lifecycle state machine tying the above together
//! - [`config`] and [`error`]: settings and internal error types
//!
//! # Durability
//!
//! - Metadata and lock files are replaced by writing a sibling temp file,
//!   syncing it and renaming it into place
//! - Profile creation is all-or-nothing; a failure removes what was created
//! - Locks whose holder is gone are reclaimed instead of blocking forever
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tweakio_profile_store::prelude::*;
//!
//! # async fn example() -> tweakio_errors::Result<()> {
//! let config = ProfileStoreConfig::new("/var/lib/tweakio");
//! let manager = ProfileManager::open(config, Arc::new(Registry::new())).await?;
//!
//! let support = ProfileId::new("support_bot")?;
//! let sales = ProfileId::new("sales_team")?;
//! manager.create(Platform::WhatsApp, &support).await?;
//! manager.create(Platform::WhatsApp, &sales).await?;
//!
//! manager.activate(Platform::WhatsApp, &support).await?;
//! // Switching deactivates support_bot first.
//! manager.activate(Platform::WhatsApp, &sales).await?;
//!
//! for summary in manager.list(&ProfileFilter::all()).await? {
//!     println!("{}:{} {}", summary.platform, summary.profile_id, summary.status);
//! }
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod error;
pub mod liveness;
pub mod lock;
pub mod manager;
pub mod metadata;
pub mod paths;
pub mod platform;
pub mod prelude;
pub mod recovery;
pub mod registry;
pub mod storage;

pub use config::ProfileStoreConfig;
pub use error::{LockError, MetadataError, StorageError, ValidationError};
pub use liveness::{LivenessProbe, SystemProbe};
pub use lock::{LockHandle, LockManager, LockRecord, LockState};
pub use manager::{
    LockedProfile, PlatformStatus, ProfileFilter, ProfileManager, ProfileSnapshot,
    ProfileSummary, ReconcileReport, StateFilter,
};
pub use metadata::{BackupSettings, MetadataStore, ProfileMetadata, ProfilePaths, ProfileStatus};
pub use paths::{PathResolver, ProfileId, ProfileLocation};
pub use platform::Platform;
pub use recovery::RecoveryMode;
pub use registry::Registry;
