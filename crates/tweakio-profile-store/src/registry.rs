//! Process-local record of the active profile per platform.
//!
//! The registry is a cache of what this process holds locks for. It never
//! touches the disk; across processes the lock files are authoritative.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::paths::ProfileId;
use crate::platform::Platform;

/// Active profile per platform for one process.
#[derive(Debug, Default)]
pub struct Registry {
    active: RwLock<HashMap<Platform, ProfileId>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `profile_id` as active for `platform`, returning the previous entry.
    pub fn set_active(&self, platform: Platform, profile_id: ProfileId) -> Option<ProfileId> {
        self.active.write().insert(platform, profile_id)
    }

    /// Clear the entry for `platform`, returning it.
    pub fn clear_active(&self, platform: Platform) -> Option<ProfileId> {
        self.active.write().remove(&platform)
    }

    /// Active profile for `platform`
    pub fn get_active(&self, platform: Platform) -> Option<ProfileId> {
        self.active.read().get(&platform).cloned()
    }

    /// Whether `profile_id` is the active profile for `platform`
    pub fn is_active(&self, platform: Platform, profile_id: &ProfileId) -> bool {
        self.active.read().get(&platform) == Some(profile_id)
    }

    /// All entries, ordered by platform
    pub fn entries(&self) -> Vec<(Platform, ProfileId)> {
        let mut entries: Vec<_> = self
            .active
            .read()
            .iter()
            .map(|(p, id)| (*p, id.clone()))
            .collect();
        entries.sort();
        entries
    }
}
