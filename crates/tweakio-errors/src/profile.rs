//! Profile lifecycle error types.
//!
//! One variant per failure class of the profile state machine. Identifier
//! and duplicate errors are raised before anything touches the disk; the
//! rest carry enough context (platform, profile id, operation, holder pid)
//! to explain what blocked the caller.

use crate::common::{ErrorCategory, ErrorSeverity, IdentifierKind, Operation};

/// Profile lifecycle errors.
///
/// # Examples
///
/// ```
/// use tweakio_errors::{ErrorCategory, ErrorSeverity, Operation, ProfileError};
///
/// let err = ProfileError::lock_timeout("whatsapp", "support_bot", Some(4242), 30_000);
/// assert_eq!(err.category(), ErrorCategory::Lock);
/// assert_eq!(err.holder_pid(), Some(4242));
/// assert!(err.is_retryable());
///
/// let err = ProfileError::corruption(Operation::Activate, "whatsapp", "sales", "missing field `status`");
/// assert_eq!(err.severity(), ErrorSeverity::Error);
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    /// Platform or profile id does not match the identifier grammar
    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        /// Which identifier was rejected
        kind: IdentifierKind,
        /// The rejected value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A profile directory already exists at the resolved path
    #[error("Profile '{profile_id}' already exists for platform '{platform}'")]
    Duplicate {
        /// Platform name
        platform: String,
        /// Profile identifier
        profile_id: String,
    },

    /// No profile directory exists at the resolved path
    #[error("Profile '{profile_id}' does not exist for platform '{platform}'")]
    NotFound {
        /// Platform name
        platform: String,
        /// Profile identifier
        profile_id: String,
    },

    /// Profile is registered active or locked by a live process
    #[error(
        "Cannot {operation} profile '{profile_id}' on '{platform}': it is active{}",
        holder_suffix(.holder_pid)
    )]
    Active {
        /// Operation that was refused
        operation: Operation,
        /// Platform name
        platform: String,
        /// Profile identifier
        profile_id: String,
        /// Process id holding the lock, when known
        holder_pid: Option<u32>,
    },

    /// Lock not acquired within the configured timeout
    #[error(
        "Timed out after {waited_ms} ms waiting for the lock on '{profile_id}' ({platform}){}",
        holder_suffix(.holder_pid)
    )]
    LockTimeout {
        /// Platform name
        platform: String,
        /// Profile identifier
        profile_id: String,
        /// Process id holding the lock, when known
        holder_pid: Option<u32>,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Metadata failed structural or schema validation
    #[error("Corrupted metadata for profile '{profile_id}' on '{platform}' during {operation}: {reason}")]
    Corruption {
        /// Operation that detected the corruption
        operation: Operation,
        /// Platform name
        platform: String,
        /// Profile identifier
        profile_id: String,
        /// What failed validation
        reason: String,
    },

    /// I/O failure during an atomic write; the previous record is intact
    #[error(
        "Atomic write of {path} failed during {operation}{}: {reason}",
        profile_suffix(.platform, .profile_id)
    )]
    PartialWrite {
        /// Operation that issued the write
        operation: Operation,
        /// Target path
        path: String,
        /// Underlying failure
        reason: String,
        /// Platform name, when the write belonged to a profile
        platform: Option<String>,
        /// Profile identifier, when the write belonged to a profile
        profile_id: Option<String>,
    },

    /// Recovery could not proceed
    #[error("Cannot recover profile '{profile_id}' on '{platform}': {reason}")]
    Recovery {
        /// Platform name
        platform: String,
        /// Profile identifier
        profile_id: String,
        /// Why recovery failed
        reason: String,
    },

    /// Any other filesystem failure
    #[error(
        "Storage failure at {path} during {operation}{}: {reason}",
        profile_suffix(.platform, .profile_id)
    )]
    Storage {
        /// Operation that touched the filesystem
        operation: Operation,
        /// Path involved
        path: String,
        /// Underlying failure
        reason: String,
        /// Platform name, when the path belonged to a profile
        platform: Option<String>,
        /// Profile identifier, when the path belonged to a profile
        profile_id: Option<String>,
    },
}

fn holder_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (held by pid {pid})"),
        None => String::new(),
    }
}

fn profile_suffix(platform: &Option<String>, profile_id: &Option<String>) -> String {
    match (platform, profile_id) {
        (Some(platform), Some(profile_id)) => format!(" of '{profile_id}' ({platform})"),
        (Some(platform), None) => format!(" on '{platform}'"),
        _ => String::new(),
    }
}

impl ProfileError {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProfileError::InvalidIdentifier { .. } => ErrorCategory::Identifier,
            ProfileError::Duplicate { .. } => ErrorCategory::Conflict,
            ProfileError::NotFound { .. } => ErrorCategory::NotFound,
            ProfileError::Active { .. } => ErrorCategory::Active,
            ProfileError::LockTimeout { .. } => ErrorCategory::Lock,
            ProfileError::Corruption { .. } => ErrorCategory::Corruption,
            ProfileError::PartialWrite { .. } | ProfileError::Storage { .. } => {
                ErrorCategory::Storage
            }
            ProfileError::Recovery { .. } => ErrorCategory::Recovery,
        }
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProfileError::Active { .. } | ProfileError::LockTimeout { .. } => {
                ErrorSeverity::Warning
            }
            ProfileError::Recovery { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Whether repeating the same call later can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProfileError::LockTimeout { .. }
                | ProfileError::Active { .. }
                | ProfileError::PartialWrite { .. }
                | ProfileError::Storage { .. }
        )
    }

    /// Platform the error refers to, if any.
    pub fn platform(&self) -> Option<&str> {
        match self {
            ProfileError::Duplicate { platform, .. }
            | ProfileError::NotFound { platform, .. }
            | ProfileError::Active { platform, .. }
            | ProfileError::LockTimeout { platform, .. }
            | ProfileError::Corruption { platform, .. }
            | ProfileError::Recovery { platform, .. } => Some(platform),
            ProfileError::PartialWrite { platform, .. } | ProfileError::Storage { platform, .. } => {
                platform.as_deref()
            }
            ProfileError::InvalidIdentifier { .. } => None,
        }
    }

    /// Profile id the error refers to, if any.
    pub fn profile_id(&self) -> Option<&str> {
        match self {
            ProfileError::Duplicate { profile_id, .. }
            | ProfileError::NotFound { profile_id, .. }
            | ProfileError::Active { profile_id, .. }
            | ProfileError::LockTimeout { profile_id, .. }
            | ProfileError::Corruption { profile_id, .. }
            | ProfileError::Recovery { profile_id, .. } => Some(profile_id),
            ProfileError::PartialWrite { profile_id, .. }
            | ProfileError::Storage { profile_id, .. } => profile_id.as_deref(),
            ProfileError::InvalidIdentifier { .. } => None,
        }
    }

    /// Attach the profile a storage or partial-write failure belongs to.
    /// Other variants already carry it and are returned unchanged.
    #[must_use]
    pub fn with_profile(self, platform: impl Into<String>, profile_id: impl Into<String>) -> Self {
        match self {
            ProfileError::PartialWrite {
                operation,
                path,
                reason,
                ..
            } => ProfileError::PartialWrite {
                operation,
                path,
                reason,
                platform: Some(platform.into()),
                profile_id: Some(profile_id.into()),
            },
            ProfileError::Storage {
                operation,
                path,
                reason,
                ..
            } => ProfileError::Storage {
                operation,
                path,
                reason,
                platform: Some(platform.into()),
                profile_id: Some(profile_id.into()),
            },
            other => other,
        }
    }

    /// Process id of the blocking lock holder, when known.
    pub fn holder_pid(&self) -> Option<u32> {
        match self {
            ProfileError::Active { holder_pid, .. }
            | ProfileError::LockTimeout { holder_pid, .. } => *holder_pid,
            _ => None,
        }
    }

    /// Create an invalid platform error.
    pub fn invalid_platform(value: impl Into<String>, reason: impl Into<String>) -> Self {
        ProfileError::InvalidIdentifier {
            kind: IdentifierKind::Platform,
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid profile id error.
    pub fn invalid_profile_id(value: impl Into<String>, reason: impl Into<String>) -> Self {
        ProfileError::InvalidIdentifier {
            kind: IdentifierKind::ProfileId,
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a duplicate profile error.
    pub fn duplicate(platform: impl Into<String>, profile_id: impl Into<String>) -> Self {
        ProfileError::Duplicate {
            platform: platform.into(),
            profile_id: profile_id.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(platform: impl Into<String>, profile_id: impl Into<String>) -> Self {
        ProfileError::NotFound {
            platform: platform.into(),
            profile_id: profile_id.into(),
        }
    }

    /// Create an active profile error.
    pub fn active(
        operation: Operation,
        platform: impl Into<String>,
        profile_id: impl Into<String>,
        holder_pid: Option<u32>,
    ) -> Self {
        ProfileError::Active {
            operation,
            platform: platform.into(),
            profile_id: profile_id.into(),
            holder_pid,
        }
    }

    /// Create a lock timeout error.
    pub fn lock_timeout(
        platform: impl Into<String>,
        profile_id: impl Into<String>,
        holder_pid: Option<u32>,
        waited_ms: u64,
    ) -> Self {
        ProfileError::LockTimeout {
            platform: platform.into(),
            profile_id: profile_id.into(),
            holder_pid,
            waited_ms,
        }
    }

    /// Create a corruption error.
    pub fn corruption(
        operation: Operation,
        platform: impl Into<String>,
        profile_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProfileError::Corruption {
            operation,
            platform: platform.into(),
            profile_id: profile_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a partial write error.
    pub fn partial_write(
        operation: Operation,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProfileError::PartialWrite {
            operation,
            path: path.into(),
            reason: reason.into(),
            platform: None,
            profile_id: None,
        }
    }

    /// Create a recovery error.
    pub fn recovery(
        platform: impl Into<String>,
        profile_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProfileError::Recovery {
            platform: platform.into(),
            profile_id: profile_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(
        operation: Operation,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProfileError::Storage {
            operation,
            path: path.into(),
            reason: reason.into(),
            platform: None,
            profile_id: None,
        }
    }
}
