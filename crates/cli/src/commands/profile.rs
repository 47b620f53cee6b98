//! Profile lifecycle commands

use anyhow::Result;
use tracing::info;
use tweakio_errors::Operation;
use tweakio_profile_store::prelude::*;

use crate::commands::{ModeArg, StateArgs, StoreOptions, parse_platform, parse_target};
use crate::error::CliError;
use crate::output;

/// Create a profile
pub async fn create(store: &StoreOptions, platform: &str, profile: &str, json: bool) -> Result<()> {
    let (platform, profile_id) = parse_target(platform, profile)?;
    let manager = store.open().await?;

    let metadata = manager
        .create(platform, &profile_id)
        .await
        .map_err(CliError::from)?;
    output::print_profile(
        &format!("Created profile {platform}:{profile_id}"),
        &metadata,
        json,
    );
    Ok(())
}

/// Activate a profile; with `hold` keep it until interrupted.
pub async fn activate(
    store: &StoreOptions,
    platform: &str,
    profile: &str,
    hold: bool,
    json: bool,
) -> Result<()> {
    let (platform, profile_id) = parse_target(platform, profile)?;
    let manager = store.open().await?;

    let metadata = manager
        .activate(platform, &profile_id)
        .await
        .map_err(CliError::from)?;

    if !hold {
        // The lock lives only as long as this process.
        manager.shutdown().await.map_err(CliError::from)?;
        let released = manager
            .get(platform, &profile_id)
            .await
            .map_err(CliError::from)?;
        output::print_profile(
            &format!("Activated {platform}:{profile_id} and released it on exit (use --hold to keep it)"),
            &released,
            json,
        );
        return Ok(());
    }

    output::print_profile(
        &format!("Activated {platform}:{profile_id}, press Ctrl-C to release"),
        &metadata,
        json,
    );
    tokio::signal::ctrl_c().await.map_err(CliError::from)?;
    info!(platform = %platform, profile_id = %profile_id, "Interrupted, releasing profile");
    manager.shutdown().await.map_err(CliError::from)?;
    output::print_success(&format!("Released {platform}:{profile_id}"), json);
    Ok(())
}

/// Deactivate a platform.
///
/// A fresh process holds nothing, so this amounts to clearing state left by
/// dead processes and reporting a live holder if there is one.
pub async fn deactivate(store: &StoreOptions, platform: &str, json: bool) -> Result<()> {
    let platform = parse_platform(platform)?;
    let manager = store.open().await?;

    manager.deactivate(platform).await.map_err(CliError::from)?;
    let report = manager.reconcile().await.map_err(CliError::from)?;
    let status = manager.status(platform).await.map_err(CliError::from)?;

    if let Some(locked) = status.locked.first() {
        return Err(CliError::from(ProfileError::active(
            Operation::Deactivate,
            platform.as_str(),
            locked.profile_id.as_str(),
            locked.holder_pid,
        ))
        .into());
    }

    let message = if report.removed_locks.is_empty() && report.reset_profiles.is_empty() {
        format!("No active profile on {platform}")
    } else {
        format!(
            "Cleared {} stale lock(s) and reset {} profile(s) on {platform}",
            report.removed_locks.len(),
            report.reset_profiles.len()
        )
    };
    output::print_success(&message, json);
    Ok(())
}

/// Delete a profile
pub async fn delete(
    store: &StoreOptions,
    platform: &str,
    profile: &str,
    force: bool,
    json: bool,
) -> Result<()> {
    let (platform, profile_id) = parse_target(platform, profile)?;
    let manager = store.open().await?;

    manager
        .delete(platform, &profile_id, force)
        .await
        .map_err(CliError::from)?;
    if force {
        output::print_warning(&format!("Force-deleted {platform}:{profile_id}"), json);
    } else {
        output::print_success(&format!("Deleted {platform}:{profile_id}"), json);
    }
    Ok(())
}

/// List profiles
pub async fn list(
    store: &StoreOptions,
    platform: Option<&str>,
    state: &StateArgs,
    json: bool,
) -> Result<()> {
    let mut filter = ProfileFilter::all().with_state(state.filter());
    if let Some(platform) = platform {
        filter = filter.with_platform(parse_platform(platform)?);
    }
    let manager = store.open().await?;

    let profiles = manager.list(&filter).await.map_err(CliError::from)?;
    output::print_profile_list(&profiles, json);
    Ok(())
}

/// Rebuild a profile's metadata
pub async fn recover(
    store: &StoreOptions,
    platform: &str,
    profile: &str,
    mode: ModeArg,
    json: bool,
) -> Result<()> {
    let (platform, profile_id) = parse_target(platform, profile)?;
    let manager = store.open().await?;
    let mode = RecoveryMode::from(mode);

    let metadata = manager
        .recover(platform, &profile_id, mode)
        .await
        .map_err(CliError::from)?;
    output::print_profile(
        &format!("Recovered {platform}:{profile_id} ({mode})"),
        &metadata,
        json,
    );
    Ok(())
}
