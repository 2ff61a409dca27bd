//! Bump command: thin CLI layer over `bumpkit_core::run`.

use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use bumpkit_core::audit::{FileAuditLog, Outcome};
use bumpkit_core::backup::BackupManager;
use bumpkit_core::classify::BumpKind;
use bumpkit_core::config::Config;
use bumpkit_core::input::InputSource;
use bumpkit_core::run::{AuditStatus, Mode, Pipeline, RunError, RunReport, RunRequest};

use crate::exit::{self, Exit};

/// Arguments for the `bump` subcommand.
#[derive(Args, Debug, Default)]
pub struct BumpArgs {
    /// Read the change description from FILE
    #[arg(long, value_name = "FILE")]
    pub file: Option<Utf8PathBuf>,

    /// Read the change description from standard input
    #[arg(long)]
    pub stdin: bool,

    /// Use TEXT as the change description
    #[arg(long, value_name = "TEXT")]
    pub text: Option<String>,

    /// PR checklist, as markdown or a comma-separated list of ticked items
    #[arg(long, value_name = "LIST")]
    pub checkboxes: Option<String>,

    /// Skip classification and use this bump
    #[arg(long, value_enum, value_name = "KIND")]
    pub bump_type: Option<BumpKind>,

    /// Document holding the version token (defaults to `version.file`)
    #[arg(long, value_name = "FILE")]
    pub target: Option<Utf8PathBuf>,

    /// Write the new version to the target
    #[arg(long)]
    pub apply: bool,

    /// Show the new version without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Snapshot the target before writing (default from config)
    #[arg(long, overrides_with = "no_backup")]
    pub backup: bool,

    /// Write without a snapshot; a failed write cannot be undone
    #[arg(long, overrides_with = "backup")]
    pub no_backup: bool,

    /// Record the outcome in the audit trail (default from config)
    #[arg(long, overrides_with = "no_audit_log")]
    pub audit_log: bool,

    /// Do not record the outcome
    #[arg(long, overrides_with = "audit_log")]
    pub no_audit_log: bool,
}

/// Resolve a `--x` / `--no-x` pair against the configured default.
const fn toggle(on: bool, off: bool, default: bool) -> bool {
    match (on, off) {
        (true, _) => true,
        (_, true) => false,
        _ => default,
    }
}

/// Execute the bump command.
#[instrument(name = "cmd_bump", skip_all, fields(json_output))]
pub fn cmd_bump(
    args: BumpArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<Exit> {
    debug!(json_output = global_json, "executing bump command");

    let mode = Mode::from_flags(args.apply, args.dry_run)?;
    let source = InputSource::select(
        args.file.map(|path| cwd.join(path)),
        args.stdin,
        args.text,
        args.checkboxes,
    )?;
    let text = source
        .read(std::io::stdin().lock())
        .context("failed to read change description")?;

    let target = args
        .target
        .map(|path| cwd.join(path))
        .or_else(|| config.version_file(cwd));

    let mut pipeline = Pipeline::new(config.version.labels.clone());
    if toggle(args.backup, args.no_backup, config.backup.enabled) {
        pipeline = pipeline.with_backups(BackupManager::new(config.backup_dir(cwd)));
    }
    if toggle(args.audit_log, args.no_audit_log, config.audit.enabled) {
        pipeline = pipeline.with_audit(Arc::new(FileAuditLog::new(config.audit_dir(cwd))));
    }

    let request = RunRequest {
        text,
        bump_type: args.bump_type,
        mode,
        target,
    };

    let spinner = ProgressBar::new_spinner();
    if mode == Mode::Apply && !global_json {
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("valid template"),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    } else {
        spinner.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    let report = pipeline.run(&request, |state| spinner.set_message(state.to_string()));
    spinner.finish_and_clear();
    let report = report?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    print_warnings(&report);

    Ok(exit::for_report(&report))
}

fn print_report(report: &RunReport) {
    let decision = &report.decision;
    println!(
        "{}: {} {}",
        "Decision".bold(),
        decision.kind.to_string().to_uppercase().green().bold(),
        format!("(confidence {:.2})", decision.confidence).dimmed()
    );
    for rule in &decision.matched_rules {
        println!("  {} {} [{}]", "→".dimmed(), rule.rule.cyan(), rule.category);
    }

    if let (Some(previous), Some(next)) = (&report.previous_version, &report.new_version) {
        println!(
            "{}: {} → {}",
            "Version".bold(),
            previous.to_string().dimmed(),
            next.to_string().green().bold()
        );
    } else if let Some(previous) = &report.previous_version {
        println!("{}: {}", "Version".bold(), previous.to_string().dimmed());
    }

    match report.mode {
        Mode::Report => {}
        Mode::DryRun => {
            println!();
            println!("{}", "Dry run, no changes made.".yellow());
        }
        Mode::Apply => {
            println!();
            match report.result {
                Outcome::Success if report.mutated() => {
                    for change in &report.files_affected {
                        println!("  {} Updated {}", "✓".green(), change.path.cyan());
                    }
                    if !report.backups.is_empty() {
                        println!("  {} Backup kept as {}", "→".dimmed(), report.operation_id);
                    }
                }
                Outcome::Success => {
                    println!("  {} No bump needed, target unchanged", "○".yellow());
                }
                Outcome::RolledBack => {
                    println!("  {} Write failed, target restored", "○".yellow());
                }
                Outcome::Failed => {
                    println!("  {} Bump failed", "✗".red());
                }
            }
            println!("{}: {}", "Operation".dimmed(), report.operation_id);
        }
    }
}

fn print_warnings(report: &RunReport) {
    if let Some(failure) = &report.failure {
        eprintln!("{} {failure}", "error:".red().bold());
        if let RunError::Inconsistent {
            path,
            expected,
            backup_location,
            ..
        } = failure
        {
            eprintln!("  {}: {path}", "file".dimmed());
            eprintln!("  {}: {expected}", "expected hash".dimmed());
            eprintln!("  {}: {backup_location}", "backup".dimmed());
            eprintln!(
                "  {}",
                "restore the file from the backup by hand before retrying".yellow()
            );
        }
    }
    if let AuditStatus::Failed { message } = &report.audit {
        eprintln!(
            "{} audit entry for {} was not recorded: {message}",
            "warning:".yellow().bold(),
            report.operation_id
        );
    }
}
