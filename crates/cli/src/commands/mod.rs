//! Command implementations for tweakctl

pub mod profile;
pub mod status;

use anyhow::Result;
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tweakio_profile_store::prelude::*;

use crate::error::CliError;

/// Options that decide which store a command operates on.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub lock_timeout: Option<u64>,
}

impl StoreOptions {
    /// Defaults, then the settings file, then command-line overrides.
    pub async fn resolve(&self) -> Result<ProfileStoreConfig> {
        let mut config = ProfileStoreConfig::default();
        if let Some(path) = &self.config {
            config = config.load_from_path(path).await?;
        }
        if let Some(root) = &self.root {
            config.root_dir = root.clone();
        }
        if let Some(secs) = self.lock_timeout {
            if secs == 0 {
                return Err(CliError::InvalidConfiguration(
                    "--lock-timeout must be at least 1 second".to_string(),
                )
                .into());
            }
            config.lock_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Open a manager over the resolved store.
    pub async fn open(&self) -> Result<ProfileManager> {
        let config = self.resolve().await?;
        debug!(root = ?config.root_dir, "Opening profile store");
        let manager = ProfileManager::open(config, Arc::new(Registry::new()))
            .await
            .map_err(CliError::from)?;
        Ok(manager)
    }
}

/// Parse command-line identifiers so malformed input maps to the
/// identifier exit code rather than a usage error.
pub fn parse_target(platform: &str, profile: &str) -> Result<(Platform, ProfileId)> {
    let parsed = PathResolver::parse(platform, profile).map_err(CliError::from)?;
    Ok(parsed)
}

pub fn parse_platform(platform: &str) -> Result<Platform> {
    let parsed = platform.parse::<Platform>().map_err(CliError::from)?;
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Rebuild metadata, keep session and cache
    Soft,
    /// Rebuild metadata and reset session and cache
    Hard,
}

impl From<ModeArg> for RecoveryMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Soft => RecoveryMode::Soft,
            ModeArg::Hard => RecoveryMode::Hard,
        }
    }
}

#[derive(Debug, Clone, Args)]
#[group(multiple = false)]
pub struct StateArgs {
    /// Show every profile (default)
    #[arg(long)]
    pub all: bool,
    /// Only profiles held by a live process
    #[arg(long)]
    pub active: bool,
    /// Only profiles needing recovery
    #[arg(long)]
    pub corrupted: bool,
}

impl StateArgs {
    pub fn filter(&self) -> StateFilter {
        if self.active {
            StateFilter::Active
        } else if self.corrupted {
            StateFilter::Corrupted
        } else {
            StateFilter::All
        }
    }
}
