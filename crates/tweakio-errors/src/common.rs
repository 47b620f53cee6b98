//! Classification shared by every error in the profile store.
//!
//! [`ErrorCategory`] groups errors into the classes a front end reacts to
//! differently (exit codes, retry hints). [`Operation`] names the public
//! operation that was running when the error surfaced.

use core::fmt;

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    /// Malformed platform or profile identifier
    Identifier = 0,
    /// Profile already exists
    Conflict = 1,
    /// Profile does not exist
    NotFound = 2,
    /// Profile is active or locked by a live process
    Active = 3,
    /// Lock could not be acquired in time
    Lock = 4,
    /// Metadata failed structural or schema validation
    Corruption = 5,
    /// Filesystem failure
    Storage = 6,
    /// Recovery itself could not proceed
    Recovery = 7,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Identifier => write!(f, "Identifier"),
            ErrorCategory::Conflict => write!(f, "Conflict"),
            ErrorCategory::NotFound => write!(f, "NotFound"),
            ErrorCategory::Active => write!(f, "Active"),
            ErrorCategory::Lock => write!(f, "Lock"),
            ErrorCategory::Corruption => write!(f, "Corruption"),
            ErrorCategory::Storage => write!(f, "Storage"),
            ErrorCategory::Recovery => write!(f, "Recovery"),
        }
    }
}

/// Error severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ErrorSeverity {
    /// Informational, no action required
    Info = 0,
    /// Warning, may require attention
    Warning = 1,
    /// Error, operation failed
    Error = 2,
    /// Critical, on-disk state needs manual attention
    Critical = 3,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARN"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Which identifier failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    /// Platform name
    Platform,
    /// Profile id
    ProfileId,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierKind::Platform => write!(f, "platform"),
            IdentifierKind::ProfileId => write!(f, "profile id"),
        }
    }
}

/// The operation that was running when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Opening the store and reconciling on-disk state
    Open,
    /// Profile creation
    Create,
    /// Profile activation
    Activate,
    /// Profile deactivation
    Deactivate,
    /// Profile deletion
    Delete,
    /// Metadata recovery
    Recover,
    /// Profile enumeration
    List,
    /// Metadata load
    Load,
    /// Read-only snapshot for collaborators
    Snapshot,
}

impl Operation {
    /// Lowercase name used in messages and structured output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Create => "create",
            Operation::Activate => "activate",
            Operation::Deactivate => "deactivate",
            Operation::Delete => "delete",
            Operation::Recover => "recover",
            Operation::List => "list",
            Operation::Load => "load",
            Operation::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
