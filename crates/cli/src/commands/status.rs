//! Platform status command

use anyhow::Result;
use tweakio_profile_store::prelude::*;

use crate::commands::{StoreOptions, parse_platform};
use crate::error::CliError;
use crate::output;

/// Show which profiles are locked, for one platform or all of them.
pub async fn execute(store: &StoreOptions, platform: Option<&str>, json: bool) -> Result<()> {
    let platforms: Vec<Platform> = match platform {
        Some(platform) => vec![parse_platform(platform)?],
        None => Platform::all().collect(),
    };
    let manager = store.open().await?;

    let mut statuses = Vec::with_capacity(platforms.len());
    for platform in platforms {
        statuses.push(manager.status(platform).await.map_err(CliError::from)?);
    }
    output::print_status(&statuses, json);
    Ok(())
}
