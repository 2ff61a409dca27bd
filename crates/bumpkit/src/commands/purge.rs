//! Purge command: drop backups past the retention window.

use anyhow::Context;
use camino::Utf8Path;
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use bumpkit_core::backup::BackupManager;
use bumpkit_core::config::Config;

use crate::exit::Exit;

/// Arguments for the `purge` subcommand.
#[derive(Args, Debug, Default)]
pub struct PurgeArgs {
    /// Keep backups newer than DAYS (overrides `backup.retention_days`)
    #[arg(long, value_name = "DAYS", value_parser = clap::value_parser!(u32).range(1..))]
    pub retention_days: Option<u32>,
}

#[derive(Serialize)]
struct PurgeReport {
    backup_dir: String,
    retention_days: u32,
    purged: usize,
}

/// Execute the purge command.
#[instrument(name = "cmd_purge", skip_all, fields(json_output))]
pub fn cmd_purge(
    args: PurgeArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<Exit> {
    debug!(json_output = global_json, "executing purge command");

    let retention_days = args.retention_days.unwrap_or(config.backup.retention_days);
    let backups = BackupManager::new(config.backup_dir(cwd));
    let purged = backups
        .purge_expired(chrono::Duration::days(i64::from(retention_days)))
        .context("failed to purge backups")?;

    let report = PurgeReport {
        backup_dir: backups.root().to_string(),
        retention_days,
        purged,
    };
    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if purged == 0 {
        println!(
            "  {} Nothing older than {retention_days} day(s) in {}",
            "○".dimmed(),
            report.backup_dir.cyan()
        );
    } else {
        println!(
            "  {} Purged {purged} backup record(s) from {}",
            "✓".green(),
            report.backup_dir.cyan()
        );
    }
    Ok(Exit::Success)
}
