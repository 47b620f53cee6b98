//! Supported platforms.
//!
//! The platform set is closed: adding a platform means adding a variant here
//! together with its session artifact set, never registering one at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tweakio_errors::ProfileError;

use crate::paths::check_identifier;

/// A file the session collaborator owns inside a profile directory, with the
/// placeholder contents written at creation and on hard recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionArtifact {
    /// File name relative to the profile directory
    pub file_name: &'static str,
    /// Contents of a fresh, unauthenticated artifact
    pub placeholder: &'static [u8],
}

const BROWSER_SESSION_ARTIFACTS: &[SessionArtifact] = &[
    SessionArtifact {
        file_name: "session.json",
        placeholder: b"{}",
    },
    SessionArtifact {
        file_name: "cookies.json",
        placeholder: b"{}",
    },
    SessionArtifact {
        file_name: "fingerprint.pkl",
        placeholder: b"",
    },
];

/// Messaging platform a profile belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Arattai
    Arattai,
    /// WhatsApp Web
    WhatsApp,
}

impl Platform {
    /// Every supported platform, in directory order.
    pub const ALL: [Platform; 2] = [Platform::Arattai, Platform::WhatsApp];

    /// Iterate over every supported platform.
    pub fn all() -> impl Iterator<Item = Platform> {
        Self::ALL.into_iter()
    }

    /// Canonical lowercase name, used as the platform directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WhatsApp => "whatsapp",
            Platform::Arattai => "arattai",
        }
    }

    /// Human-facing name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::WhatsApp => "WhatsApp",
            Platform::Arattai => "Arattai",
        }
    }

    /// Session artifacts the platform's browser collaborator persists.
    pub fn session_artifacts(&self) -> &'static [SessionArtifact] {
        match self {
            Platform::WhatsApp | Platform::Arattai => BROWSER_SESSION_ARTIFACTS,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_identifier(s).map_err(|reason| ProfileError::invalid_platform(s, reason))?;

        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let known: Vec<&str> = Platform::ALL.iter().map(Platform::as_str).collect();
                ProfileError::invalid_platform(
                    s,
                    format!("unknown platform, expected one of: {}", known.join(", ")),
                )
            })
    }
}
