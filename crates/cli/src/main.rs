//! tweakctl - tweakio profile control CLI
//!
//! Creates, activates, lists, recovers and deletes the browser-session
//! profiles tweakio automation runs under.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod completion;
mod error;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{ModeArg, StateArgs, StoreOptions};

#[derive(Parser)]
#[command(name = "tweakctl")]
#[command(about = "tweakio profile control - manage messaging platform profiles")]
#[command(version)]
#[command(long_about = "
tweakctl manages the browser-session profiles used by tweakio messaging
automation. Each platform (whatsapp, arattai) has any number of named
profiles; at most one per platform is active at a time, guarded by lock files
that are reclaimed automatically when their owning process dies.

Use --json for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output format (human-readable or JSON)
    #[arg(long, global = true, help = "Output in JSON format for machine parsing")]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data root holding the platforms directory
    #[arg(long, global = true, env = "TWEAKIO_HOME")]
    root: Option<PathBuf>,

    /// JSON settings file
    #[arg(long, global = true, env = "TWEAKIO_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for a profile held by another process
    #[arg(long, global = true, value_name = "SECS")]
    lock_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a profile
    Create {
        /// Platform (whatsapp, arattai)
        platform: String,
        /// Profile identifier
        profile: String,
    },

    /// Activate a profile
    Activate {
        platform: String,
        profile: String,
        /// Keep the profile active until interrupted
        #[arg(long)]
        hold: bool,
    },

    /// Deactivate a platform and clear locks left by dead processes
    Deactivate { platform: String },

    /// Delete a profile
    Delete {
        platform: String,
        profile: String,
        /// Delete even if the profile is active
        #[arg(short, long)]
        force: bool,
    },

    /// List profiles
    List {
        /// Only this platform
        #[arg(short, long)]
        platform: Option<String>,
        #[command(flatten)]
        state: StateArgs,
    },

    /// Show locked profiles per platform
    Status { platform: Option<String> },

    /// Rebuild a corrupted profile's metadata
    Recover {
        platform: String,
        profile: String,
        #[arg(long, value_enum, default_value = "soft")]
        mode: ModeArg,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("tweakctl={log_level},tweakio_profile_store={log_level}").into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match execute_command(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            ExitCode::from(error::exit_code(&e))
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    let store = StoreOptions {
        root: cli.root.clone(),
        config: cli.config.clone(),
        lock_timeout: cli.lock_timeout,
    };

    match &cli.command {
        Commands::Create { platform, profile } => {
            commands::profile::create(&store, platform, profile, cli.json).await
        }
        Commands::Activate {
            platform,
            profile,
            hold,
        } => commands::profile::activate(&store, platform, profile, *hold, cli.json).await,
        Commands::Deactivate { platform } => {
            commands::profile::deactivate(&store, platform, cli.json).await
        }
        Commands::Delete {
            platform,
            profile,
            force,
        } => commands::profile::delete(&store, platform, profile, *force, cli.json).await,
        Commands::List { platform, state } => {
            commands::profile::list(&store, platform.as_deref(), state, cli.json).await
        }
        Commands::Status { platform } => {
            commands::status::execute(&store, platform.as_deref(), cli.json).await
        }
        Commands::Recover {
            platform,
            profile,
            mode,
        } => commands::profile::recover(&store, platform, profile, *mode, cli.json).await,
        Commands::Completion { shell } => {
            completion::generate_completion(*shell);
            Ok(())
        }
    }
}
