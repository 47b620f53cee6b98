//! Convenience re-exports for error handling.

pub use crate::{
    Result,
    common::{ErrorCategory, ErrorSeverity, IdentifierKind, Operation},
    profile::ProfileError,
};
