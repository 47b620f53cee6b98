//! Store-internal error types.
//!
//! These stay close to the filesystem and carry paths. The manager converts
//! them into [`ProfileError`] once it knows which platform, profile and
//! operation they belong to.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tweakio_errors::{Operation, ProfileError};

use crate::paths::ProfileLocation;

/// Filesystem failures
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to read file
    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        /// Path to the file
        path: PathBuf,
        /// Source error
        source: std::io::Error,
    },

    /// Atomic write did not complete; the previous contents are intact
    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        /// Path to the file
        path: PathBuf,
        /// Source error
        source: std::io::Error,
    },

    /// Failed to create directory
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreationFailed {
        /// Path to the directory
        path: PathBuf,
        /// Source error
        source: std::io::Error,
    },

    /// Failed to remove a file or directory
    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        /// Path that could not be removed
        path: PathBuf,
        /// Source error
        source: std::io::Error,
    },

    /// Exclusive creation found an existing entry
    #[error("Already exists: {0}")]
    AlreadyExists(PathBuf),
}

impl StorageError {
    /// Create a read error
    pub fn read_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a write error
    pub fn write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a directory creation error
    pub fn directory_creation_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryCreationFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a removal error
    pub fn remove_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::RemoveFailed {
            path: path.into(),
            source,
        }
    }

    /// Path the failure refers to
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::ReadFailed { path, .. }
            | Self::WriteFailed { path, .. }
            | Self::DirectoryCreationFailed { path, .. }
            | Self::RemoveFailed { path, .. }
            | Self::AlreadyExists(path) => path,
        }
    }

    /// Convert into the public taxonomy. Failed atomic writes become
    /// [`ProfileError::PartialWrite`], everything else is a storage failure.
    pub fn into_profile_error(self, operation: Operation) -> ProfileError {
        let path = self.path().display().to_string();
        match self {
            Self::WriteFailed { source, .. } => {
                ProfileError::partial_write(operation, path, source.to_string())
            }
            Self::ReadFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::RemoveFailed { source, .. } => {
                ProfileError::storage(operation, path, source.to_string())
            }
            Self::AlreadyExists(_) => ProfileError::storage(operation, path, "already exists"),
        }
    }

    /// Like [`StorageError::into_profile_error`], naming the profile the
    /// path belongs to.
    pub fn for_profile(self, operation: Operation, location: &ProfileLocation) -> ProfileError {
        self.into_profile_error(operation)
            .with_profile(location.platform.as_str(), location.profile_id.as_str())
    }
}

/// Metadata record rule violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Invalid field value
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason for invalidity
        reason: String,
    },

    /// Record does not belong to the directory it was read from
    #[error("Field '{field}' is '{actual}' but the profile directory says '{expected}'")]
    Mismatch {
        /// The field name
        field: String,
        /// Value implied by the directory
        expected: String,
        /// Value found in the record
        actual: String,
    },
}

impl ValidationError {
    /// Create an invalid value error
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a mismatch error
    pub fn mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Mismatch {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

/// Failures of [`crate::metadata::MetadataStore`]
#[derive(Error, Debug)]
pub enum MetadataError {
    /// Record failed structural or schema validation
    #[error("Metadata at {path} is corrupted: {reason}")]
    Corrupted {
        /// Metadata file
        path: PathBuf,
        /// What failed
        reason: String,
        /// Whether the file is parseable enough to patch its status in place
        salvageable: bool,
    },

    /// Record refused before writing
    #[error("Refusing to save invalid metadata: {0}")]
    Invalid(#[from] ValidationError),

    /// Underlying filesystem failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MetadataError {
    /// Create a corruption error
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>, salvageable: bool) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
            salvageable,
        }
    }

    /// Whether this is a corruption report
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }

    /// Convert into the public taxonomy with profile context attached.
    pub fn into_profile_error(
        self,
        operation: Operation,
        platform: impl Into<String>,
        profile_id: impl Into<String>,
    ) -> ProfileError {
        match self {
            Self::Corrupted { reason, .. } => {
                ProfileError::corruption(operation, platform, profile_id, reason)
            }
            Self::Invalid(err) => {
                ProfileError::corruption(operation, platform, profile_id, err.to_string())
            }
            Self::Storage(err) => err
                .into_profile_error(operation)
                .with_profile(platform, profile_id),
        }
    }
}

/// Failures of [`crate::lock::LockManager`]
#[derive(Error, Debug)]
pub enum LockError {
    /// A live process kept the lock for the whole timeout
    #[error("Timed out after {waited:?} waiting for {path}")]
    Timeout {
        /// Lock path
        path: PathBuf,
        /// Holder recorded in the lock, when readable
        holder_pid: Option<u32>,
        /// Time spent waiting
        waited: Duration,
    },

    /// Underlying filesystem failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LockError {
    /// Convert into the public taxonomy with profile context attached.
    pub fn into_profile_error(
        self,
        operation: Operation,
        platform: impl Into<String>,
        profile_id: impl Into<String>,
    ) -> ProfileError {
        match self {
            Self::Timeout {
                holder_pid, waited, ..
            } => ProfileError::lock_timeout(
                platform,
                profile_id,
                holder_pid,
                u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            ),
            Self::Storage(err) => err
                .into_profile_error(operation)
                .with_profile(platform, profile_id),
        }
    }
}
