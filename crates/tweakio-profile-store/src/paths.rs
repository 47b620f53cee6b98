//! Identifier grammar and on-disk layout.
//!
//! [`PathResolver`] maps `(platform, profile_id)` to a profile directory.
//! It is a pure function of its root: it validates identifiers and joins
//! paths but never touches the filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tweakio_errors::{ProfileError, Result};

use crate::platform::Platform;

/// File and directory names inside a profile directory.
pub mod layout {
    /// Metadata record
    pub const METADATA_FILE: &str = "metadata.json";
    /// Cross-process lock object
    pub const LOCK_FILE: &str = ".lock";
    /// Cache subdirectory, discarded on hard recovery
    pub const CACHE_DIR: &str = "cache";
    /// Backup collaborator area
    pub const BACKUP_DIR: &str = "backups";
    /// Media root
    pub const MEDIA_DIR: &str = "media";
    /// Message store owned by the storage collaborator; never created here
    pub const DATABASE_FILE: &str = "messages.db";
    /// Lock serializing activations of one platform across processes
    pub const ACTIVATION_GATE_FILE: &str = ".activation.lock";
    /// Directories created with every profile, parents first
    pub const SUBDIRECTORIES: &[&str] = &[
        CACHE_DIR,
        BACKUP_DIR,
        MEDIA_DIR,
        "media/images",
        "media/videos",
        "media/voice",
        "media/documents",
    ];
}

/// Longest accepted identifier.
pub const MAX_IDENTIFIER_LEN: usize = 32;

/// Check a value against `[A-Za-z0-9_-]{1,32}`, returning the reason on failure.
pub(crate) fn check_identifier(value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(format!(
            "must be at most {MAX_IDENTIFIER_LEN} characters, got {}",
            value.len()
        ));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(format!(
            "character {bad:?} is not allowed (use letters, digits, '_' or '-')"
        ));
    }
    Ok(())
}

/// Validated profile identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

impl ProfileId {
    /// Validate and wrap a profile id.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::InvalidIdentifier`] when the value does not
    /// match `[A-Za-z0-9_-]{1,32}`.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        match check_identifier(&value) {
            Ok(()) => Ok(Self(value)),
            Err(reason) => Err(ProfileError::invalid_profile_id(value, reason)),
        }
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProfileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProfileId {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProfileId {
    type Error = ProfileError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

/// A resolved profile: identity plus its directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLocation {
    /// Platform the profile belongs to
    pub platform: Platform,
    /// Profile identifier
    pub profile_id: ProfileId,
    /// Profile directory
    pub dir: PathBuf,
}

impl ProfileLocation {
    /// Path of `metadata.json`.
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(layout::METADATA_FILE)
    }

    /// Path of the lock object.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(layout::LOCK_FILE)
    }

    /// Path of the cache subdirectory.
    pub fn cache_dir(&self) -> PathBuf {
        self.dir.join(layout::CACHE_DIR)
    }

    /// Path of a file relative to the profile directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl fmt::Display for ProfileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.profile_id)
    }
}

/// Maps `(platform, profile_id)` to `<root>/platforms/<platform>/<profile_id>`.
#[derive(Debug, Clone)]
pub struct PathResolver {
    platforms_dir: PathBuf,
}

impl PathResolver {
    /// Create a resolver rooted at the store's data directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            platforms_dir: root.as_ref().join("platforms"),
        }
    }

    /// Directory holding one subdirectory per platform.
    pub fn platforms_dir(&self) -> &Path {
        &self.platforms_dir
    }

    /// Directory holding every profile of `platform`.
    pub fn platform_dir(&self, platform: Platform) -> PathBuf {
        self.platforms_dir.join(platform.as_str())
    }

    /// Lock path serializing activations of `platform`.
    pub fn activation_gate(&self, platform: Platform) -> PathBuf {
        self.platform_dir(platform).join(layout::ACTIVATION_GATE_FILE)
    }

    /// Validate raw identifiers and resolve them to a profile directory.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::InvalidIdentifier`] for a malformed or unknown
    /// platform or a malformed profile id.
    pub fn resolve(&self, platform: &str, profile_id: &str) -> Result<PathBuf> {
        let (platform, profile_id) = Self::parse(platform, profile_id)?;
        Ok(self.locate(platform, &profile_id).dir)
    }

    /// Validate a raw `(platform, profile_id)` pair.
    ///
    /// # Errors
    ///
    /// Same as [`PathResolver::resolve`].
    pub fn parse(platform: &str, profile_id: &str) -> Result<(Platform, ProfileId)> {
        Ok((platform.parse()?, profile_id.parse()?))
    }

    /// Resolve already validated identifiers.
    pub fn locate(&self, platform: Platform, profile_id: &ProfileId) -> ProfileLocation {
        ProfileLocation {
            platform,
            profile_id: profile_id.clone(),
            dir: self.platform_dir(platform).join(profile_id.as_str()),
        }
    }
}
