//! Integration tests for the profile lifecycle

use chrono::Utc;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tweakio_profile_store::prelude::*;
use tweakio_profile_store::paths::layout;

/// Far above any real pid on supported systems.
const DEAD_PID: u32 = 0x7FFF_FFF0;

fn must<T, E: std::fmt::Debug>(r: std::result::Result<T, E>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => panic!("unexpected Err: {e:?}"),
    }
}

fn id(value: &str) -> ProfileId {
    must(ProfileId::new(value))
}

fn test_config(root: &Path) -> ProfileStoreConfig {
    ProfileStoreConfig::new(root)
        .with_lock_timeout(Duration::from_secs(2))
        .with_lock_retry(Duration::from_millis(5), Duration::from_millis(50))
}

async fn open_manager(temp_dir: &TempDir) -> ProfileManager {
    must(ProfileManager::open(test_config(temp_dir.path()), Arc::new(Registry::new())).await)
}

fn read_json(path: &Path) -> Value {
    must(serde_json::from_slice(&must(std::fs::read(path))))
}

fn write_dead_lock(path: &Path) {
    let record = json!({
        "pid": DEAD_PID,
        "acquired_at": Utc::now(),
        "token": "00000000-0000-4000-8000-000000000000",
    });
    must(std::fs::write(path, must(serde_json::to_vec(&record))));
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_create_then_list() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;

        must(manager.create(Platform::WhatsApp, &id("support_bot")).await);
        must(manager.create(Platform::WhatsApp, &id("sales_team")).await);
        must(manager.create(Platform::Arattai, &id("support_bot")).await);

        let all = must(manager.list(&ProfileFilter::all()).await);
        let names: Vec<_> = all
            .iter()
            .map(|s| format!("{}:{}", s.platform, s.profile_id))
            .collect();
        assert_eq!(
            names,
            vec![
                "arattai:support_bot",
                "whatsapp:sales_team",
                "whatsapp:support_bot"
            ]
        );
        assert!(all.iter().all(|s| s.status == ProfileStatus::Inactive));
        assert!(all.iter().all(|s| s.problem.is_none()));

        let whatsapp = must(
            manager
                .list(&ProfileFilter::all().with_platform(Platform::WhatsApp))
                .await,
        );
        assert_eq!(whatsapp.len(), 2);
    }

    #[tokio::test]
    async fn test_switch_between_profiles() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let support = id("support_bot");
        let sales = id("sales_team");
        must(manager.create(Platform::WhatsApp, &support).await);
        must(manager.create(Platform::WhatsApp, &sales).await);

        let record = must(manager.activate(Platform::WhatsApp, &support).await);
        assert_eq!(record.status, ProfileStatus::Active);
        assert_eq!(record.lock_pid, Some(std::process::id()));
        assert!(manager.is_active(Platform::WhatsApp, &support));

        must(manager.activate(Platform::WhatsApp, &sales).await);
        assert!(manager.is_active(Platform::WhatsApp, &sales));
        assert!(!manager.is_active(Platform::WhatsApp, &support));

        let support_dir = manager.profile_directory(Platform::WhatsApp, &support);
        let old = read_json(&support_dir.join(layout::METADATA_FILE));
        assert_eq!(old["status"], "inactive");
        assert_eq!(old["lock_pid"], Value::Null);
        assert!(!support_dir.join(layout::LOCK_FILE).exists());

        let active = must(
            manager
                .list(&ProfileFilter::all().with_state(StateFilter::Active))
                .await,
        );
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].profile_id, sales);
        assert!(active[0].active_here);
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::Arattai, &bot).await);

        let first = must(manager.activate(Platform::Arattai, &bot).await);
        let second = must(manager.activate(Platform::Arattai, &bot).await);
        assert_eq!(first.last_used, second.last_used);
    }

    #[tokio::test]
    async fn test_platforms_activate_independently() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::Arattai, &bot).await);
        must(manager.create(Platform::WhatsApp, &bot).await);

        must(manager.activate(Platform::Arattai, &bot).await);
        must(manager.activate(Platform::WhatsApp, &bot).await);
        assert!(manager.is_active(Platform::Arattai, &bot));
        assert!(manager.is_active(Platform::WhatsApp, &bot));
        assert_eq!(manager.registry().entries().len(), 2);

        must(manager.shutdown().await);
        assert!(manager.registry().entries().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);
        must(manager.activate(Platform::WhatsApp, &bot).await);

        assert_eq!(must(manager.deactivate(Platform::WhatsApp).await), Some(bot.clone()));
        assert_eq!(must(manager.deactivate(Platform::WhatsApp).await), None);

        let record = must(manager.get(Platform::WhatsApp, &bot).await);
        assert_eq!(record.status, ProfileStatus::Inactive);
        assert!(record.lock_pid.is_none());
        assert!(!manager.profile_directory(Platform::WhatsApp, &bot).join(layout::LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_metadata_survives_reopen() {
        let temp_dir = must(TempDir::new());
        let bot = id("bot");
        let created = {
            let manager = open_manager(&temp_dir).await;
            must(manager.create(Platform::WhatsApp, &bot).await)
        };

        let manager = open_manager(&temp_dir).await;
        let loaded = must(manager.get(Platform::WhatsApp, &bot).await);
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn test_unknown_fields_are_preserved() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);

        let path = manager
            .profile_directory(Platform::WhatsApp, &bot)
            .join(layout::METADATA_FILE);
        let mut value = read_json(&path);
        value["proxy"] = json!({"host": "10.0.0.1", "port": 8080});
        must(std::fs::write(&path, must(serde_json::to_vec(&value))));

        must(manager.activate(Platform::WhatsApp, &bot).await);
        must(manager.deactivate(Platform::WhatsApp).await);
        assert_eq!(read_json(&path)["proxy"]["port"], 8080);
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_create() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        must(manager.create(Platform::WhatsApp, &id("bot")).await);

        let err = manager.create(Platform::WhatsApp, &id("bot")).await.err();
        assert!(matches!(err, Some(ProfileError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn test_missing_profile_is_not_found() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let ghost = id("ghost");

        for err in [
            manager.activate(Platform::WhatsApp, &ghost).await.err(),
            manager.delete(Platform::WhatsApp, &ghost, true).await.err(),
            manager.get(Platform::WhatsApp, &ghost).await.err(),
            manager.snapshot(Platform::WhatsApp, &ghost).await.err(),
        ] {
            assert!(matches!(err, Some(ProfileError::NotFound { .. })), "{err:?}");
        }
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected_before_io() {
        assert!(matches!(
            ProfileId::new("../escape"),
            Err(ProfileError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            "telegram".parse::<Platform>(),
            Err(ProfileError::InvalidIdentifier { .. })
        ));
        assert!(ProfileId::new("a".repeat(33)).is_err());
    }

    #[tokio::test]
    async fn test_corrupted_profile_is_listed_and_refused() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);
        must(manager.create(Platform::WhatsApp, &id("good")).await);

        let dir = manager.profile_directory(Platform::WhatsApp, &bot);
        must(std::fs::write(dir.join(layout::METADATA_FILE), "{\"profile_id\": \"bo"));

        let corrupted = must(
            manager
                .list(&ProfileFilter::all().with_state(StateFilter::Corrupted))
                .await,
        );
        assert_eq!(corrupted.len(), 1);
        assert_eq!(corrupted[0].profile_id, bot);
        assert!(corrupted[0].metadata.is_none());
        assert!(corrupted[0].problem.is_some());

        let err = manager.activate(Platform::WhatsApp, &bot).await.err();
        assert!(matches!(err, Some(ProfileError::Corruption { .. })));
        assert!(!dir.join(layout::LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_stray_directories_are_skipped() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        must(manager.create(Platform::WhatsApp, &id("bot")).await);
        must(std::fs::create_dir_all(
            temp_dir.path().join("platforms/whatsapp/not a profile"),
        ));

        let all = must(manager.list(&ProfileFilter::all()).await);
        assert_eq!(all.len(), 1);
    }
}

mod deletion {
    use super::*;

    #[tokio::test]
    async fn test_delete_inactive() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);

        must(manager.delete(Platform::WhatsApp, &bot, false).await);
        assert!(!manager.profile_directory(Platform::WhatsApp, &bot).exists());
        assert!(must(manager.list(&ProfileFilter::all()).await).is_empty());
    }

    #[tokio::test]
    async fn test_delete_locked_requires_force() {
        let temp_dir = must(TempDir::new());
        let holder = open_manager(&temp_dir).await;
        let other = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(holder.create(Platform::WhatsApp, &bot).await);
        must(holder.activate(Platform::WhatsApp, &bot).await);

        let err = other.delete(Platform::WhatsApp, &bot, false).await.err();
        match err {
            Some(ProfileError::Active { holder_pid, .. }) => {
                assert_eq!(holder_pid, Some(std::process::id()));
            }
            other => panic!("expected Active, got {other:?}"),
        }
        assert!(holder.profile_directory(Platform::WhatsApp, &bot).exists());

        must(other.delete(Platform::WhatsApp, &bot, true).await);
        assert!(!holder.profile_directory(Platform::WhatsApp, &bot).exists());
    }

    #[tokio::test]
    async fn test_delete_held_here_deactivates_first() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::Arattai, &bot).await);
        must(manager.activate(Platform::Arattai, &bot).await);

        must(manager.delete(Platform::Arattai, &bot, true).await);
        assert!(!manager.is_active(Platform::Arattai, &bot));
        assert_eq!(must(manager.deactivate(Platform::Arattai).await), None);

        // The slot is free again.
        must(manager.create(Platform::Arattai, &bot).await);
        must(manager.activate(Platform::Arattai, &bot).await);
    }
}

mod stale_state {
    use super::*;

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed_without_waiting() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);

        let lock_path = manager
            .profile_directory(Platform::WhatsApp, &bot)
            .join(layout::LOCK_FILE);
        write_dead_lock(&lock_path);

        let started = std::time::Instant::now();
        must(manager.activate(Platform::WhatsApp, &bot).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        let lock = read_json(&lock_path);
        assert_eq!(lock["pid"], std::process::id());
    }

    #[tokio::test]
    async fn test_open_removes_stale_locks_and_resets_status() {
        let temp_dir = must(TempDir::new());
        let bot = id("bot");
        let dir = {
            let manager = open_manager(&temp_dir).await;
            must(manager.create(Platform::WhatsApp, &bot).await);
            manager.profile_directory(Platform::WhatsApp, &bot)
        };

        // A crashed process left its lock and an active record behind.
        let metadata_path = dir.join(layout::METADATA_FILE);
        let mut value = read_json(&metadata_path);
        value["status"] = json!("active");
        value["lock_pid"] = json!(DEAD_PID);
        must(std::fs::write(&metadata_path, must(serde_json::to_vec(&value))));
        write_dead_lock(&dir.join(layout::LOCK_FILE));

        let manager = open_manager(&temp_dir).await;
        assert!(!dir.join(layout::LOCK_FILE).exists());
        let record = must(manager.get(Platform::WhatsApp, &bot).await);
        assert_eq!(record.status, ProfileStatus::Inactive);
        assert!(record.lock_pid.is_none());

        let report = must(manager.reconcile().await);
        assert!(report.removed_locks.is_empty());
        assert!(report.reset_profiles.is_empty());
    }

    #[tokio::test]
    async fn test_dead_holder_of_sibling_profile_does_not_block() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let old = id("old");
        let new = id("new");
        must(manager.create(Platform::WhatsApp, &old).await);
        must(manager.create(Platform::WhatsApp, &new).await);

        let old_dir = manager.profile_directory(Platform::WhatsApp, &old);
        write_dead_lock(&old_dir.join(layout::LOCK_FILE));

        must(manager.activate(Platform::WhatsApp, &new).await);
        assert!(!old_dir.join(layout::LOCK_FILE).exists());
    }
}

mod recovery {
    use super::*;

    async fn corrupted_profile(manager: &ProfileManager, bot: &ProfileId) -> std::path::PathBuf {
        must(manager.create(Platform::WhatsApp, bot).await);
        let dir = manager.profile_directory(Platform::WhatsApp, bot);
        must(std::fs::write(dir.join("session.json"), r#"{"wa_token": "secret"}"#));
        must(std::fs::write(dir.join("cache/page.bin"), "cached"));
        must(std::fs::write(dir.join(layout::METADATA_FILE), "not json"));
        dir
    }

    #[tokio::test]
    async fn test_soft_recovery_keeps_session() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        let dir = corrupted_profile(&manager, &bot).await;

        let record = must(manager.recover(Platform::WhatsApp, &bot, RecoveryMode::Soft).await);
        assert_eq!(record.status, ProfileStatus::Inactive);
        assert_eq!(record.profile_id, bot);
        assert!(
            must(std::fs::read_to_string(dir.join("session.json"))).contains("wa_token")
        );
        assert!(dir.join("cache/page.bin").exists());
        assert!(!dir.join(layout::LOCK_FILE).exists());

        must(manager.activate(Platform::WhatsApp, &bot).await);
    }

    #[tokio::test]
    async fn test_hard_recovery_resets_session() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        let dir = corrupted_profile(&manager, &bot).await;

        must(manager.recover(Platform::WhatsApp, &bot, RecoveryMode::Hard).await);
        assert_eq!(must(std::fs::read_to_string(dir.join("session.json"))), "{}");
        assert_eq!(must(std::fs::read_to_string(dir.join("cookies.json"))), "{}");
        assert!(dir.join(layout::CACHE_DIR).is_dir());
        assert!(!dir.join("cache/page.bin").exists());

        let listed = must(manager.list(&ProfileFilter::all()).await);
        assert_eq!(listed[0].status, ProfileStatus::Inactive);
    }

    #[tokio::test]
    async fn test_recover_refuses_profile_locked_elsewhere() {
        let temp_dir = must(TempDir::new());
        let holder = open_manager(&temp_dir).await;
        let other = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(holder.create(Platform::WhatsApp, &bot).await);
        must(holder.activate(Platform::WhatsApp, &bot).await);

        let err = other
            .recover(Platform::WhatsApp, &bot, RecoveryMode::Soft)
            .await
            .err();
        assert!(matches!(err, Some(ProfileError::Active { .. })));
    }

    #[tokio::test]
    async fn test_recover_missing_profile() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let err = manager
            .recover(Platform::Arattai, &id("ghost"), RecoveryMode::Hard)
            .await
            .err();
        assert!(matches!(err, Some(ProfileError::NotFound { .. })));
    }
}

mod snapshots {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_inactive_profile() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        let created = must(manager.create(Platform::WhatsApp, &bot).await);

        let snapshot = must(manager.snapshot(Platform::WhatsApp, &bot).await);
        assert_eq!(snapshot.metadata, created);
        assert_eq!(snapshot.directory, manager.profile_directory(Platform::WhatsApp, &bot));
    }

    #[tokio::test]
    async fn test_snapshot_refused_while_active() {
        let temp_dir = must(TempDir::new());
        let manager = open_manager(&temp_dir).await;
        let bot = id("bot");
        must(manager.create(Platform::WhatsApp, &bot).await);
        must(manager.activate(Platform::WhatsApp, &bot).await);

        let err = manager.snapshot(Platform::WhatsApp, &bot).await.err();
        assert!(matches!(err, Some(ProfileError::Active { .. })));

        must(manager.deactivate(Platform::WhatsApp).await);
        must(manager.snapshot(Platform::WhatsApp, &bot).await);
    }
}

mod configuration {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_platform_directories() {
        let temp_dir = must(TempDir::new());
        let root = temp_dir.path().join("nested/home");
        must(ProfileManager::open(test_config(&root), Arc::new(Registry::new())).await);

        assert!(root.join("platforms/whatsapp").is_dir());
        assert!(root.join("platforms/arattai").is_dir());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_dir = must(TempDir::new());
        let config = test_config(temp_dir.path()).with_lock_timeout(Duration::ZERO);
        let err = ProfileManager::open(config, Arc::new(Registry::new())).await.err();
        assert!(matches!(err, Some(ProfileError::Storage { .. })));
    }
}
