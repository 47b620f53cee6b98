//! Error types and exit codes for tweakctl

use thiserror::Error;
use tweakio_errors::{ErrorCategory, ErrorSeverity, ProfileError};

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn profile_error(error: &anyhow::Error) -> Option<&ProfileError> {
    match error.downcast_ref::<CliError>() {
        Some(CliError::Profile(err)) => Some(err),
        Some(_) => None,
        None => error.downcast_ref::<ProfileError>(),
    }
}

/// Process exit code for a failed command. Clap owns 2 for usage errors.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    match profile_error(error).map(ProfileError::category) {
        Some(ErrorCategory::NotFound) => 3,
        Some(ErrorCategory::Identifier | ErrorCategory::Conflict) => 4,
        Some(ErrorCategory::Active) => 5,
        Some(ErrorCategory::Corruption | ErrorCategory::Recovery) => 6,
        Some(ErrorCategory::Lock) => 7,
        Some(ErrorCategory::Storage) | None => 1,
    }
}

/// Short machine-readable kind for JSON error output.
pub fn error_kind(error: &anyhow::Error) -> String {
    match error.downcast_ref::<CliError>() {
        Some(CliError::Profile(err)) => err.category().to_string(),
        Some(CliError::InvalidConfiguration(_)) => "Configuration".to_string(),
        Some(CliError::IoError(_)) => "Io".to_string(),
        None => error
            .downcast_ref::<ProfileError>()
            .map_or_else(|| "Error".to_string(), |err| err.category().to_string()),
    }
}

/// Severity of a failed command; anything outside the profile taxonomy is
/// a plain error.
pub fn error_severity(error: &anyhow::Error) -> ErrorSeverity {
    profile_error(error).map_or(ErrorSeverity::Error, ProfileError::severity)
}

/// Whether running the same command again later may succeed.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    profile_error(error).is_some_and(ProfileError::is_retryable)
}
