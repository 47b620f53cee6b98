//! Store configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tweakio_errors::{Operation, ProfileError, Result};

/// Environment variable overriding the default data root.
pub const ROOT_ENV_VAR: &str = "TWEAKIO_HOME";

/// Application directory name under the OS data directory.
pub const APP_DIR_NAME: &str = "tweakio";

/// Profile store configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileStoreConfig {
    /// Data root; profiles live under `<root_dir>/platforms`
    pub root_dir: PathBuf,
    /// Upper bound on how long `activate` waits for a lock
    pub lock_timeout: Duration,
    /// First backoff step while a live process holds a lock
    pub lock_retry_initial: Duration,
    /// Backoff ceiling
    pub lock_retry_max: Duration,
    /// Age after which an unparseable lock file is considered abandoned
    pub unreadable_lock_grace: Duration,
}

impl Default for ProfileStoreConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            lock_timeout: Duration::from_secs(30),
            lock_retry_initial: Duration::from_millis(50),
            lock_retry_max: Duration::from_secs(1),
            unreadable_lock_grace: Duration::from_secs(5),
        }
    }
}

/// `$TWEAKIO_HOME`, else `<data dir>/tweakio`, else `./.tweakio`.
pub fn default_root_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".tweakio"))
}

impl ProfileStoreConfig {
    /// Create a configuration rooted at `root_dir` with default timings
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Set the lock acquisition timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the lock retry backoff bounds
    pub fn with_lock_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.lock_retry_initial = initial;
        self.lock_retry_max = max;
        self
    }

    /// Set the grace period for unparseable lock files
    pub fn with_unreadable_lock_grace(mut self, grace: Duration) -> Self {
        self.unreadable_lock_grace = grace;
        self
    }

    /// Check timing invariants.
    ///
    /// # Errors
    ///
    /// Returns a storage-class error naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(ProfileError::storage(
                Operation::Open,
                self.root_dir.display().to_string(),
                format!("invalid configuration: {reason}"),
            ))
        };

        if self.lock_timeout.is_zero() {
            return invalid("lock timeout must be greater than zero");
        }
        if self.lock_retry_initial.is_zero() {
            return invalid("initial lock retry delay must be greater than zero");
        }
        if self.lock_retry_initial > self.lock_retry_max {
            return invalid("initial lock retry delay exceeds the maximum");
        }
        Ok(())
    }

    /// Apply a settings file on top of `self`. A missing file changes nothing.
    ///
    /// # Errors
    ///
    /// Returns a storage-class error when the file exists but cannot be read
    /// or parsed.
    pub async fn load_from_path(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let as_error = |reason: String| {
            ProfileError::storage(Operation::Open, path.display().to_string(), reason)
        };

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "Settings file not found, using defaults");
                return Ok(self);
            }
            Err(e) => return Err(as_error(format!("failed to read settings: {e}"))),
        };

        let file: SettingsFile = serde_json::from_str(&content)
            .map_err(|e| as_error(format!("failed to parse settings: {e}")))?;

        if let Some(root) = file.root_dir {
            self.root_dir = root;
        }
        if let Some(secs) = file.lock_timeout_secs {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = file.lock_retry_initial_ms {
            self.lock_retry_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = file.lock_retry_max_ms {
            self.lock_retry_max = Duration::from_millis(ms);
        }
        if let Some(secs) = file.unreadable_lock_grace_secs {
            self.unreadable_lock_grace = Duration::from_secs(secs);
        }

        debug!(path = ?path, "Loaded store settings");
        Ok(self)
    }
}

/// On-disk settings; every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    /// Data root override
    pub root_dir: Option<PathBuf>,
    /// Lock timeout in seconds
    pub lock_timeout_secs: Option<u64>,
    /// Initial retry delay in milliseconds
    pub lock_retry_initial_ms: Option<u64>,
    /// Retry ceiling in milliseconds
    pub lock_retry_max_ms: Option<u64>,
    /// Unparseable lock grace in seconds
    pub unreadable_lock_grace_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn must<T, E: std::fmt::Debug>(r: std::result::Result<T, E>) -> T {
        r.expect("operation should succeed")
    }

    #[test]
    fn test_defaults() {
        let config = ProfileStoreConfig::new("/data");
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let config = ProfileStoreConfig::new("/data")
            .with_lock_retry(Duration::from_secs(2), Duration::from_secs(1));
        assert!(config.validate().is_err());

        let config = ProfileStoreConfig::new("/data").with_lock_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_settings_file_keeps_defaults() {
        let temp_dir = must(TempDir::new());
        let base = ProfileStoreConfig::new(temp_dir.path());
        let loaded = must(
            base.clone()
                .load_from_path(temp_dir.path().join("absent.json"))
                .await,
        );
        assert_eq!(loaded, base);
    }

    #[tokio::test]
    async fn test_settings_file_overrides() {
        let temp_dir = must(TempDir::new());
        let path = temp_dir.path().join("settings.json");
        must(std::fs::write(
            &path,
            r#"{"lock_timeout_secs": 3, "lock_retry_max_ms": 200}"#,
        ));

        let loaded = must(
            ProfileStoreConfig::new(temp_dir.path())
                .load_from_path(&path)
                .await,
        );
        assert_eq!(loaded.lock_timeout, Duration::from_secs(3));
        assert_eq!(loaded.lock_retry_max, Duration::from_millis(200));
        assert_eq!(loaded.lock_retry_initial, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_settings_file_rejects_unknown_keys() {
        let temp_dir = must(TempDir::new());
        let path = temp_dir.path().join("settings.json");
        must(std::fs::write(&path, r#"{"lock_timout_secs": 3}"#));

        let result = ProfileStoreConfig::new(temp_dir.path())
            .load_from_path(&path)
            .await;
        assert!(result.is_err());
    }
}
