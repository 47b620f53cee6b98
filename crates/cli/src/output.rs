//! Output formatting for CLI responses

use anyhow::Error;
use colored::*;
use serde::Serialize;
use serde_json::{Value, json};
use tweakio_profile_store::prelude::*;

use crate::error::{error_kind, error_severity, is_retryable};

fn print_json(document: &Value) {
    match serde_json::to_string_pretty(document) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format output as JSON: {e}"),
    }
}

fn success_with(key: &str, value: impl Serialize) -> Value {
    let mut document = json!({ "success": true });
    if let (Value::Object(map), Ok(value)) = (&mut document, serde_json::to_value(value)) {
        map.insert(key.to_string(), value);
    }
    document
}

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    print_json(&json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "type": error_kind(error),
            "severity": error_severity(error).to_string(),
            "retryable": is_retryable(error),
        }
    }));
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    let label = match error_severity(error) {
        ErrorSeverity::Warning => "Warning:".yellow().bold(),
        ErrorSeverity::Critical => "Critical:".red().bold(),
        ErrorSeverity::Info | ErrorSeverity::Error => "Error:".red().bold(),
    };
    eprintln!("{label} {error}");

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
    if is_retryable(error) {
        eprintln!("  {} the command may succeed if retried later", "Hint:".cyan());
    }
}

/// Print success message
pub fn print_success(message: &str, json: bool) {
    if json {
        print_json(&json!({ "success": true, "message": message }));
    } else {
        println!("{} {}", "✓".green(), message);
    }
}

/// Print warning message
pub fn print_warning(message: &str, json: bool) {
    if json {
        print_json(&json!({ "success": true, "warning": message }));
    } else {
        println!("{} {}", "⚠".yellow(), message);
    }
}

fn status_label(status: ProfileStatus) -> ColoredString {
    match status {
        ProfileStatus::Active => "active".green(),
        ProfileStatus::Inactive => "inactive".normal(),
        ProfileStatus::Corrupted => "corrupted".red(),
    }
}

/// Print a profile's metadata after a lifecycle command.
pub fn print_profile(message: &str, metadata: &ProfileMetadata, json: bool) {
    if json {
        let mut document = success_with("profile", metadata);
        if let Value::Object(map) = &mut document {
            map.insert("message".to_string(), json!(message));
        }
        print_json(&document);
        return;
    }

    println!("{} {}", "✓".green(), message);
    println!(
        "  {}:{} {}",
        metadata.platform.as_str().cyan(),
        metadata.profile_id.as_str().bold(),
        status_label(metadata.status)
    );
    println!(
        "  Created: {}",
        metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Last used: {}",
        metadata.last_used.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(pid) = metadata.lock_pid {
        println!("  Lock pid: {pid}");
    }
}

/// Print profile list
pub fn print_profile_list(profiles: &[ProfileSummary], json: bool) {
    if json {
        print_json(&success_with("profiles", profiles));
        return;
    }

    if profiles.is_empty() {
        println!("{}", "No profiles found".yellow());
        return;
    }

    println!("{}", "Profiles:".bold());
    let mut current = None;
    for summary in profiles {
        if current != Some(summary.platform) {
            println!("  {}", summary.platform.display_name().cyan().bold());
            current = Some(summary.platform);
        }

        let marker = match summary.status {
            ProfileStatus::Active => "●".green(),
            ProfileStatus::Inactive => "○".normal(),
            ProfileStatus::Corrupted => "✗".red(),
        };
        print!(
            "    {} {} {}",
            marker,
            summary.profile_id.as_str().bold(),
            status_label(summary.status)
        );
        if let Some(pid) = summary.lock_holder {
            print!(" {}", format!("(pid {pid})").dimmed());
        }
        println!();

        if let Some(problem) = &summary.problem {
            println!("      {}", problem.red());
        } else if let Some(metadata) = &summary.metadata {
            println!(
                "      {}",
                format!(
                    "last used {}",
                    metadata.last_used.format("%Y-%m-%d %H:%M:%S UTC")
                )
                .dimmed()
            );
        }
    }
}

/// Print per-platform lock status
pub fn print_status(statuses: &[PlatformStatus], json: bool) {
    if json {
        print_json(&success_with("platforms", statuses));
        return;
    }

    for status in statuses {
        println!("{}", status.platform.display_name().bold());
        if status.locked.is_empty() {
            println!("  {}", "No active profile".dimmed());
        }
        for locked in &status.locked {
            let holder = locked
                .holder_pid
                .map_or_else(|| "unknown holder".to_string(), |pid| format!("pid {pid}"));
            println!(
                "  {} {} ({})",
                "●".green(),
                locked.profile_id.as_str().bold(),
                holder
            );
        }
    }
}
