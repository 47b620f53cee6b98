//! Error taxonomy for tweakio profile management
//!
//! Every operation of the profile store reports failures through
//! [`ProfileError`]. Variants carry the platform, profile id and the
//! [`Operation`] that failed so a front end can render a precise message
//! and pick an exit code from the [`ErrorCategory`].
//!
//! # Modules
//!
//! - [`common`]: classification (category, severity) and the operation tag
//! - [`profile`]: the [`ProfileError`] enum itself
//!
//! # Example
//!
//! ```
//! use tweakio_errors::prelude::*;
//!
//! fn ensure_present(found: bool) -> Result<()> {
//!     if !found {
//!         return Err(ProfileError::not_found("whatsapp", "support_bot"));
//!     }
//!     Ok(())
//! }
//!
//! let err = ensure_present(false).unwrap_err();
//! assert_eq!(err.category(), ErrorCategory::NotFound);
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod common;
pub mod prelude;
pub mod profile;

pub use common::{ErrorCategory, ErrorSeverity, IdentifierKind, Operation};
pub use profile::ProfileError;

/// A specialized `Result` type for profile operations.
pub type Result<T> = std::result::Result<T, ProfileError>;
