//! Metadata reconstruction for corrupted profiles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use tweakio_errors::{ProfileError, Result};

use crate::metadata::{BackupSettings, MetadataStore, ProfileMetadata};
use crate::paths::{ProfileLocation, layout};
use crate::storage;

/// How much of a profile recovery may discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Rebuild metadata only; session and cache contents are kept
    #[default]
    Soft,
    /// Rebuild metadata and reset session artifacts and cache, forcing
    /// re-authentication
    Hard,
}

impl RecoveryMode {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryMode::Soft => "soft",
            RecoveryMode::Hard => "hard",
        }
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" => Ok(RecoveryMode::Soft),
            "hard" => Ok(RecoveryMode::Hard),
            other => Err(format!("unknown recovery mode '{other}', expected soft or hard")),
        }
    }
}

/// Fields worth keeping from a damaged record.
#[derive(Debug, Default)]
struct Salvage {
    platform_version: Option<String>,
    platform_config: Option<Value>,
    backup: Option<BackupSettings>,
}

impl Salvage {
    fn from_bytes(bytes: &[u8]) -> Self {
        let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(bytes) else {
            return Self::default();
        };
        Self {
            platform_version: object
                .remove("platform_version")
                .and_then(|v| v.as_str().map(str::to_string)),
            platform_config: object.remove("platform_config").filter(|v| !v.is_null()),
            backup: object
                .remove("backup")
                .and_then(|v| serde_json::from_value(v).ok()),
        }
    }
}

/// Rebuild `metadata.json` for `location` from what is on disk.
///
/// Timestamps come from file stats and the status is reset to inactive.
/// Opaque fields that still parse (`platform_version`, `platform_config`,
/// `backup`) are carried over. In [`RecoveryMode::Hard`] the session
/// artifacts are rewritten with their placeholders and the cache directory
/// is emptied. Missing layout directories are recreated in both modes.
///
/// The caller must hold the profile's platform exclusion and ensure the
/// profile is not locked.
///
/// # Errors
///
/// [`ProfileError::Recovery`] if the directory cannot be read or any repair
/// step fails.
pub(crate) async fn reconstruct(
    metadata: &MetadataStore,
    location: &ProfileLocation,
    mode: RecoveryMode,
) -> Result<ProfileMetadata> {
    let fail = |reason: String| {
        ProfileError::recovery(location.platform.as_str(), location.profile_id.as_str(), reason)
    };

    // Stat before any repair so rewritten files do not skew the timestamps.
    let times = storage::tree_times(&location.dir)
        .await
        .map_err(|e| fail(format!("profile directory is unreadable: {e}")))?;

    let salvage = match storage::read_optional(&location.metadata_path()).await {
        Ok(Some(bytes)) => Salvage::from_bytes(&bytes),
        Ok(None) => Salvage::default(),
        Err(e) => return Err(fail(e.to_string())),
    };
    debug!(
        profile = %location,
        kept_version = salvage.platform_version.is_some(),
        kept_config = salvage.platform_config.is_some(),
        "Salvaged metadata fields"
    );

    for sub in layout::SUBDIRECTORIES {
        storage::ensure_dir(&location.file(sub))
            .await
            .map_err(|e| fail(e.to_string()))?;
    }

    if mode == RecoveryMode::Hard {
        for artifact in location.platform.session_artifacts() {
            storage::write_atomic(&location.file(artifact.file_name), artifact.placeholder)
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
        let cache = location.cache_dir();
        storage::remove_dir_if_exists(&cache)
            .await
            .map_err(|e| fail(e.to_string()))?;
        storage::ensure_dir(&cache)
            .await
            .map_err(|e| fail(e.to_string()))?;
    }

    let created_at: DateTime<Utc> = times.created.into();
    let modified: DateTime<Utc> = times.modified.into();

    let mut record = ProfileMetadata::new(location.platform, location.profile_id.clone());
    record.created_at = created_at;
    record.last_used = modified.max(created_at);
    record.platform_version = salvage.platform_version;
    record.platform_config = salvage.platform_config;
    if let Some(backup) = salvage.backup {
        record.backup = backup;
    }

    metadata
        .save(&location.metadata_path(), &record)
        .await
        .map_err(|e| fail(e.to_string()))?;

    info!(
        platform = %location.platform,
        profile_id = %location.profile_id,
        mode = %mode,
        "Profile metadata reconstructed"
    );
    Ok(record)
}
