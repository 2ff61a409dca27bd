//! Audit command: query the audit trail.

use camino::Utf8Path;
use chrono::NaiveDate;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument, warn};

use bumpkit_core::audit::{Action, AuditEntry, AuditError, AuditFilter, FileAuditLog, Outcome};
use bumpkit_core::config::Config;

use crate::exit::Exit;

/// Arguments for the `audit` subcommand.
#[derive(Args, Debug, Default)]
pub struct AuditArgs {
    /// First day to include (UTC, YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    pub since: Option<NaiveDate>,

    /// Last day to include (UTC, YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    pub until: Option<NaiveDate>,

    /// Only entries with this result
    #[arg(long, value_enum, value_name = "RESULT")]
    pub result: Option<Outcome>,

    /// Stop after N entries
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,
}

/// Execute the audit command.
///
/// With `--json` entries are printed one per line, in the same format as the
/// partition files.
#[instrument(name = "cmd_audit", skip_all, fields(json_output))]
pub fn cmd_audit(
    args: AuditArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<Exit> {
    debug!(json_output = global_json, "executing audit command");

    let log = FileAuditLog::new(config.audit_dir(cwd));
    let query = log.query(AuditFilter {
        since: args.since,
        until: args.until,
        result: args.result,
    });

    let limit = args.limit.unwrap_or(usize::MAX);
    let mut shown = 0;
    for item in &query {
        if shown >= limit {
            break;
        }
        match item {
            Ok(entry) => {
                if global_json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    print_entry(&entry);
                }
                shown += 1;
            }
            Err(e @ AuditError::Corrupt { .. }) => {
                warn!(error = %e, "skipping corrupt audit line");
                eprintln!("{} {e}", "warning:".yellow().bold());
            }
            Err(e) => return Err(e.into()),
        }
    }

    if shown == 0 && !global_json {
        println!("  {} No audit entries in {}", "○".yellow(), log.dir().cyan());
    }
    Ok(Exit::Success)
}

fn print_entry(entry: &AuditEntry) {
    let result = match entry.result {
        Outcome::Success => entry.result.to_string().green().to_string(),
        Outcome::Failed => entry.result.to_string().red().to_string(),
        Outcome::RolledBack => entry.result.to_string().yellow().to_string(),
    };
    let summary = match entry.action {
        Action::Apply => {
            let versions = match (&entry.previous_version, &entry.new_version) {
                (Some(prev), Some(next)) => format!("{prev} → {next}"),
                (Some(prev), None) => prev.clone(),
                _ => String::new(),
            };
            format!("apply {} {versions}", entry.decision.kind)
        }
        Action::Rollback => format!(
            "rollback of {}",
            entry.reverts.as_deref().unwrap_or("unknown")
        ),
    };
    println!(
        "{} {} {} {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        entry.operation_id.cyan(),
        result,
        summary.trim_end()
    );
    if let Some(error) = &entry.error {
        println!("    {} {error}", "→".dimmed());
    }
}
