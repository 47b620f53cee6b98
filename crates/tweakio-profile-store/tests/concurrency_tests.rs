//! Contention tests: several managers over one root stand in for separate
//! processes. They share this process's pid, which the liveness check always
//! treats as alive.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tweakio_profile_store::paths::layout;
use tweakio_profile_store::prelude::*;

fn must<T, E: std::fmt::Debug>(r: std::result::Result<T, E>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => panic!("unexpected Err: {e:?}"),
    }
}

fn id(value: &str) -> ProfileId {
    must(ProfileId::new(value))
}

async fn open_with_timeout(root: &Path, timeout: Duration) -> ProfileManager {
    let config = ProfileStoreConfig::new(root)
        .with_lock_timeout(timeout)
        .with_lock_retry(Duration::from_millis(5), Duration::from_millis(20));
    must(ProfileManager::open(config, Arc::new(Registry::new())).await)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activations_leave_one_active() {
    let temp_dir = must(TempDir::new());
    let manager = open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await;
    let ids: Vec<ProfileId> = (0..6).map(|n| id(&format!("p{n}"))).collect();
    for profile_id in &ids {
        must(manager.create(Platform::WhatsApp, profile_id).await);
    }

    let tasks: Vec<_> = ids
        .iter()
        .cloned()
        .map(|profile_id| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.activate(Platform::WhatsApp, &profile_id).await })
        })
        .collect();
    for task in tasks {
        must(must(task.await));
    }

    let active = must(
        manager
            .list(&ProfileFilter::all().with_state(StateFilter::Active))
            .await,
    );
    assert_eq!(active.len(), 1);
    let winner = &active[0].profile_id;
    assert_eq!(manager.registry().get_active(Platform::WhatsApp).as_ref(), Some(winner));

    let recorded_active: Vec<_> = must(manager.list(&ProfileFilter::all()).await)
        .into_iter()
        .filter(|s| s.metadata.as_ref().is_some_and(ProfileMetadata::is_active))
        .collect();
    assert_eq!(recorded_active.len(), 1);
}

#[tokio::test]
async fn test_second_manager_times_out_on_held_profile() {
    let temp_dir = must(TempDir::new());
    let first = open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await;
    let second = open_with_timeout(temp_dir.path(), Duration::from_millis(200)).await;
    let bot = id("bot");
    must(first.create(Platform::WhatsApp, &bot).await);
    must(first.activate(Platform::WhatsApp, &bot).await);

    let err = second.activate(Platform::WhatsApp, &bot).await.err();
    match err {
        Some(ProfileError::LockTimeout {
            holder_pid,
            waited_ms,
            ..
        }) => {
            assert_eq!(holder_pid, Some(std::process::id()));
            assert!(waited_ms >= 150, "waited {waited_ms}ms");
        }
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    assert!(first.is_active(Platform::WhatsApp, &bot));
    assert!(!second.is_active(Platform::WhatsApp, &bot));
}

#[tokio::test]
async fn test_other_profile_of_platform_blocks_activation() {
    let temp_dir = must(TempDir::new());
    let first = open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await;
    let second = open_with_timeout(temp_dir.path(), Duration::from_millis(200)).await;
    let support = id("support_bot");
    let sales = id("sales_team");
    must(first.create(Platform::WhatsApp, &support).await);
    must(first.create(Platform::WhatsApp, &sales).await);
    must(first.activate(Platform::WhatsApp, &support).await);

    let err = second.activate(Platform::WhatsApp, &sales).await.err();
    assert!(matches!(err, Some(ProfileError::LockTimeout { .. })), "{err:?}");

    let sales_dir = second.profile_directory(Platform::WhatsApp, &sales);
    assert!(!sales_dir.join(layout::LOCK_FILE).exists());
    assert!(!temp_dir
        .path()
        .join("platforms/whatsapp")
        .join(layout::ACTIVATION_GATE_FILE)
        .exists());

    // Another platform is unaffected.
    must(second.create(Platform::Arattai, &sales).await);
    must(second.activate(Platform::Arattai, &sales).await);
}

#[tokio::test]
async fn test_waiter_proceeds_once_holder_deactivates() {
    let temp_dir = must(TempDir::new());
    let first = open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await;
    let second = open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await;
    let bot = id("bot");
    must(first.create(Platform::WhatsApp, &bot).await);
    must(first.activate(Platform::WhatsApp, &bot).await);

    let waiter = {
        let second = second.clone();
        let bot = bot.clone();
        tokio::spawn(async move { second.activate(Platform::WhatsApp, &bot).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    must(first.deactivate(Platform::WhatsApp).await);

    let record = must(must(waiter.await));
    assert!(record.is_active());
    assert!(second.is_active(Platform::WhatsApp, &bot));
}

#[tokio::test]
async fn test_cancelled_activation_leaves_no_trace() {
    let temp_dir = must(TempDir::new());
    let first = open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await;
    let second = open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await;
    let bot = id("bot");
    must(first.create(Platform::WhatsApp, &bot).await);
    must(first.activate(Platform::WhatsApp, &bot).await);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        second.activate(Platform::WhatsApp, &bot),
    )
    .await;
    assert!(cancelled.is_err(), "activation should still be waiting");

    assert!(!second.is_active(Platform::WhatsApp, &bot));
    assert!(!temp_dir
        .path()
        .join("platforms/whatsapp")
        .join(layout::ACTIVATION_GATE_FILE)
        .exists());

    // The first holder is untouched and the platform is usable afterwards.
    let record = must(first.get(Platform::WhatsApp, &bot).await);
    assert_eq!(record.lock_pid, Some(std::process::id()));
    must(first.deactivate(Platform::WhatsApp).await);
    must(second.activate(Platform::WhatsApp, &bot).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_of_one_profile() {
    let temp_dir = must(TempDir::new());
    let managers = vec![
        open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await,
        open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await,
        open_with_timeout(temp_dir.path(), Duration::from_secs(5)).await,
    ];

    let tasks: Vec<_> = managers
        .iter()
        .cloned()
        .map(|manager| tokio::spawn(async move { manager.create(Platform::WhatsApp, &id("bot")).await }))
        .collect();

    let mut created = 0;
    for task in tasks {
        match must(task.await) {
            Ok(_) => created += 1,
            Err(ProfileError::Duplicate { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(created, 1);
}

const DEAD_PID: u32 = 0x7FFF_FFF0;

fn write_dead_lock(path: &Path) {
    let record = serde_json::json!({
        "pid": DEAD_PID,
        "acquired_at": "2026-01-01T00:00:00Z",
        "token": uuid::Uuid::new_v4(),
    });
    must(std::fs::write(path, must(serde_json::to_vec(&record))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_racing_activate_never_both_succeed() {
    let temp_dir = must(TempDir::new());
    let deleter = open_with_timeout(temp_dir.path(), Duration::from_secs(1)).await;
    let activator = open_with_timeout(temp_dir.path(), Duration::from_secs(1)).await;
    let bot = id("bot");
    let dir = deleter.profile_directory(Platform::WhatsApp, &bot);

    for round in 0..100 {
        must(deleter.create(Platform::WhatsApp, &bot).await);

        let delete = {
            let deleter = deleter.clone();
            let bot = bot.clone();
            tokio::spawn(async move { deleter.delete(Platform::WhatsApp, &bot, false).await })
        };
        let activate = {
            let activator = activator.clone();
            let bot = bot.clone();
            tokio::spawn(async move { activator.activate(Platform::WhatsApp, &bot).await })
        };
        let deleted = must(delete.await);
        let activated = must(activate.await);

        assert!(
            !(deleted.is_ok() && activated.is_ok()),
            "round {round}: delete and activate both succeeded"
        );
        if deleted.is_ok() {
            assert!(!dir.exists(), "round {round}");
            assert!(!activator.is_active(Platform::WhatsApp, &bot), "round {round}");
        }
        if activated.is_ok() {
            assert!(dir.join(layout::METADATA_FILE).is_file(), "round {round}");
            assert!(activator.is_active(Platform::WhatsApp, &bot), "round {round}");
            assert!(matches!(deleted, Err(ProfileError::Active { .. })), "round {round}");
        }

        must(activator.deactivate(Platform::WhatsApp).await);
        if dir.exists() {
            must(deleter.delete(Platform::WhatsApp, &bot, true).await);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recover_racing_activate_keeps_activation() {
    let temp_dir = must(TempDir::new());
    let recoverer = open_with_timeout(temp_dir.path(), Duration::from_secs(2)).await;
    let activator = open_with_timeout(temp_dir.path(), Duration::from_secs(2)).await;
    let bot = id("bot");
    must(recoverer.create(Platform::WhatsApp, &bot).await);

    for round in 0..50 {
        let recover = {
            let recoverer = recoverer.clone();
            let bot = bot.clone();
            tokio::spawn(async move {
                recoverer
                    .recover(Platform::WhatsApp, &bot, RecoveryMode::Soft)
                    .await
            })
        };
        let activate = {
            let activator = activator.clone();
            let bot = bot.clone();
            tokio::spawn(async move { activator.activate(Platform::WhatsApp, &bot).await })
        };

        match must(recover.await) {
            Ok(_) | Err(ProfileError::Active { .. }) => {}
            Err(other) => panic!("round {round}: unexpected recovery error {other:?}"),
        }
        must(must(activate.await));

        let record = must(activator.get(Platform::WhatsApp, &bot).await);
        assert!(record.is_active(), "round {round}: recovery overwrote an activation");
        assert_eq!(record.lock_pid, Some(std::process::id()), "round {round}");
        must(activator.deactivate(Platform::WhatsApp).await);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_cleanup_racing_activate_keeps_new_lock() {
    let temp_dir = must(TempDir::new());
    let sweeper = open_with_timeout(temp_dir.path(), Duration::from_secs(2)).await;
    let activator = open_with_timeout(temp_dir.path(), Duration::from_secs(2)).await;
    let bot = id("bot");
    must(sweeper.create(Platform::WhatsApp, &bot).await);
    let lock_path = sweeper
        .profile_directory(Platform::WhatsApp, &bot)
        .join(layout::LOCK_FILE);

    for round in 0..50 {
        write_dead_lock(&lock_path);

        let sweep = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.reconcile().await })
        };
        let activate = {
            let activator = activator.clone();
            let bot = bot.clone();
            tokio::spawn(async move { activator.activate(Platform::WhatsApp, &bot).await })
        };
        must(must(sweep.await));
        must(must(activate.await));

        let on_disk: serde_json::Value =
            must(serde_json::from_slice(&must(std::fs::read(&lock_path))));
        assert_eq!(on_disk["pid"], std::process::id(), "round {round}: live lock removed");
        assert!(activator.is_active(Platform::WhatsApp, &bot), "round {round}");

        must(activator.deactivate(Platform::WhatsApp).await);
        assert!(!lock_path.exists(), "round {round}");
    }
}
