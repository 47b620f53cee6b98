//! Profile metadata record and its store.
//!
//! `metadata.json` is always replaced through [`storage::write_atomic`], so
//! a reader sees one complete record. Loading never repairs anything: a
//! record that fails to parse or validate is reported as
//! [`MetadataError::Corrupted`], and [`MetadataStore::mark_corrupted`] is the
//! only path that patches a damaged file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{MetadataError, ValidationError};
use crate::paths::{ProfileId, ProfileLocation, layout};
use crate::platform::Platform;
use crate::storage;

/// Default number of session backups kept by the backup collaborator.
pub const DEFAULT_MAX_BACKUPS: u32 = 10;

/// Lifecycle status recorded in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    /// Designated for use and locked
    Active,
    /// Present and usable
    Inactive,
    /// Activation refused until recovered
    Corrupted,
}

impl ProfileStatus {
    /// Lowercase name as stored on disk.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::Active => "active",
            ProfileStatus::Inactive => "inactive",
            ProfileStatus::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relative names of the files and directories inside a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilePaths {
    /// Session artifact
    pub session_file: String,
    /// Cookie jar
    pub cookies_file: String,
    /// Browser fingerprint
    pub fingerprint_file: String,
    /// Cache directory
    pub cache_dir: String,
    /// Backup directory
    pub backup_dir: String,
    /// Media root
    pub media_dir: String,
    /// Image media
    pub media_images: String,
    /// Video media
    pub media_videos: String,
    /// Voice notes
    pub media_voice: String,
    /// Documents
    pub media_documents: String,
    /// Message store
    pub database_file: String,
}

impl Default for ProfilePaths {
    fn default() -> Self {
        Self {
            session_file: "session.json".to_string(),
            cookies_file: "cookies.json".to_string(),
            fingerprint_file: "fingerprint.pkl".to_string(),
            cache_dir: layout::CACHE_DIR.to_string(),
            backup_dir: layout::BACKUP_DIR.to_string(),
            media_dir: layout::MEDIA_DIR.to_string(),
            media_images: "media/images".to_string(),
            media_videos: "media/videos".to_string(),
            media_voice: "media/voice".to_string(),
            media_documents: "media/documents".to_string(),
            database_file: layout::DATABASE_FILE.to_string(),
        }
    }
}

/// Backup collaborator settings, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Whether session backups are taken
    pub enabled: bool,
    /// How many backups to keep
    pub max_backups: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

/// The `metadata.json` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// Profile identifier; must match the directory name
    pub profile_id: ProfileId,
    /// Owning platform; must match the parent directory
    pub platform: Platform,
    /// Platform client version, opaque to the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last activation time, never earlier than `created_at`
    pub last_used: DateTime<Utc>,
    /// Lifecycle status
    pub status: ProfileStatus,
    /// Pid of the last lock holder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_pid: Option<u32>,
    /// Layout names
    #[serde(default)]
    pub paths: ProfilePaths,
    /// Backup settings
    #[serde(default)]
    pub backup: BackupSettings,
    /// Platform-specific block, opaque to the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_config: Option<Value>,
    /// Unknown top-level keys, preserved on save
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProfileMetadata {
    /// Fresh inactive record for a new profile.
    pub fn new(platform: Platform, profile_id: ProfileId) -> Self {
        let now = Utc::now();
        Self {
            profile_id,
            platform,
            platform_version: None,
            created_at: now,
            last_used: now,
            status: ProfileStatus::Inactive,
            lock_pid: None,
            paths: ProfilePaths::default(),
            backup: BackupSettings::default(),
            platform_config: None,
            extra: Map::new(),
        }
    }

    /// Mark active for `pid`, bumping `last_used` without moving it backwards.
    pub fn activate(&mut self, pid: u32) {
        self.status = ProfileStatus::Active;
        self.lock_pid = Some(pid);
        self.touch();
    }

    /// Mark inactive. `lock_pid` keeps the last holder.
    pub fn deactivate(&mut self) {
        self.status = ProfileStatus::Inactive;
    }

    /// Set `last_used` to now, or leave it if the clock went backwards.
    pub fn touch(&mut self) {
        self.last_used = self.last_used.max(Utc::now());
    }

    /// Whether the record is currently marked active
    pub fn is_active(&self) -> bool {
        self.status == ProfileStatus::Active
    }
}

/// Atomic load/save/validate of `metadata.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataStore;

impl MetadataStore {
    /// Create a store
    pub fn new() -> Self {
        Self
    }

    /// Schema and business rules shared by `load` and `save`.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self, record: &ProfileMetadata) -> Result<(), ValidationError> {
        if record.last_used < record.created_at {
            return Err(ValidationError::invalid_value(
                "last_used",
                format!(
                    "{} is earlier than created_at {}",
                    record.last_used.to_rfc3339(),
                    record.created_at.to_rfc3339()
                ),
            ));
        }
        if record.status == ProfileStatus::Active && record.lock_pid.is_none() {
            return Err(ValidationError::invalid_value(
                "lock_pid",
                "an active profile must record its lock holder",
            ));
        }
        if record.backup.enabled && record.backup.max_backups == 0 {
            return Err(ValidationError::invalid_value(
                "backup.max_backups",
                "must be at least 1 when backups are enabled",
            ));
        }
        Ok(())
    }

    /// Read and validate a record.
    ///
    /// # Errors
    ///
    /// - [`MetadataError::Corrupted`] with `salvageable = false` when the
    ///   file is missing, unparseable or not a JSON object
    /// - [`MetadataError::Corrupted`] with `salvageable = true` when it parses
    ///   but fails the schema or [`MetadataStore::validate`]
    /// - [`MetadataError::Storage`] for I/O failures other than "not found"
    pub async fn load(&self, path: &Path) -> Result<ProfileMetadata, MetadataError> {
        debug!(path = ?path, "Loading metadata");

        let bytes = storage::read_optional(path)
            .await?
            .ok_or_else(|| MetadataError::corrupted(path, "metadata.json is missing", false))?;

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| MetadataError::corrupted(path, format!("unparseable JSON: {e}"), false))?;
        if !value.is_object() {
            return Err(MetadataError::corrupted(
                path,
                "top-level value is not an object",
                false,
            ));
        }

        let record: ProfileMetadata = serde_json::from_value(value)
            .map_err(|e| MetadataError::corrupted(path, format!("schema violation: {e}"), true))?;

        self.validate(&record)
            .map_err(|e| MetadataError::corrupted(path, e.to_string(), true))?;

        Ok(record)
    }

    /// Load the record of `location`, additionally requiring its identity
    /// fields to match the directory it lives in.
    ///
    /// # Errors
    ///
    /// Same as [`MetadataStore::load`]; an identity mismatch is salvageable
    /// corruption.
    pub async fn load_at(&self, location: &ProfileLocation) -> Result<ProfileMetadata, MetadataError> {
        let path = location.metadata_path();
        let record = self.load(&path).await?;

        let mismatch = if record.platform != location.platform {
            Some(ValidationError::mismatch(
                "platform",
                location.platform.as_str(),
                record.platform.as_str(),
            ))
        } else if record.profile_id != location.profile_id {
            Some(ValidationError::mismatch(
                "profile_id",
                location.profile_id.as_str(),
                record.profile_id.as_str(),
            ))
        } else {
            None
        };

        match mismatch {
            Some(err) => Err(MetadataError::corrupted(path, err.to_string(), true)),
            None => Ok(record),
        }
    }

    /// Validate and atomically write a record.
    ///
    /// # Errors
    ///
    /// [`MetadataError::Invalid`] before touching the disk, or
    /// [`MetadataError::Storage`] if the write fails; the previous record is
    /// then still intact.
    pub async fn save(&self, path: &Path, record: &ProfileMetadata) -> Result<(), MetadataError> {
        self.validate(record)?;

        let bytes = serde_json::to_vec_pretty(record).map_err(|e| {
            MetadataError::Invalid(ValidationError::invalid_value("record", e.to_string()))
        })?;
        storage::write_atomic(path, &bytes).await?;

        debug!(path = ?path, status = %record.status, "Metadata saved");
        Ok(())
    }

    /// Set `status` to `corrupted` in place, preserving every other field.
    ///
    /// Returns `false` without touching the file when it is missing or not a
    /// JSON object; recovery has to reconstruct those.
    ///
    /// # Errors
    ///
    /// [`MetadataError::Storage`] on I/O failure.
    pub async fn mark_corrupted(&self, path: &Path) -> Result<bool, MetadataError> {
        let Some(bytes) = storage::read_optional(path).await? else {
            return Ok(false);
        };
        let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(&bytes) else {
            warn!(path = ?path, "Metadata is unparseable, leaving it for recovery");
            return Ok(false);
        };

        object.insert(
            "status".to_string(),
            Value::String(ProfileStatus::Corrupted.as_str().to_string()),
        );
        let bytes = serde_json::to_vec_pretty(&Value::Object(object)).map_err(|e| {
            MetadataError::Invalid(ValidationError::invalid_value("record", e.to_string()))
        })?;
        storage::write_atomic(path, &bytes).await?;

        warn!(path = ?path, "Metadata marked corrupted");
        Ok(true)
    }
}
