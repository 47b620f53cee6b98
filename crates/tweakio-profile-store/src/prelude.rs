//! Convenience re-exports for common types

pub use crate::config::ProfileStoreConfig;
pub use crate::manager::{
    PlatformStatus, ProfileFilter, ProfileManager, ProfileSnapshot, ProfileSummary, StateFilter,
};
pub use crate::metadata::{ProfileMetadata, ProfileStatus};
pub use crate::paths::{PathResolver, ProfileId};
pub use crate::platform::Platform;
pub use crate::recovery::RecoveryMode;
pub use crate::registry::Registry;

pub use tweakio_errors::{ErrorCategory, ErrorSeverity, Operation, ProfileError};
