//! Rollback command: restore the files an earlier `bump --apply` changed.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use clap::Args;
use inquire::Confirm;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use bumpkit_core::audit::FileAuditLog;
use bumpkit_core::backup::BackupManager;
use bumpkit_core::config::Config;
use bumpkit_core::run::{AuditStatus, Pipeline, RollbackReport};

use crate::exit::{self, Exit, UsageError};

/// Arguments for the `rollback` subcommand.
#[derive(Args, Debug, Default)]
pub struct RollbackArgs {
    /// Operation id printed by `bump --apply`
    #[arg(value_name = "OPERATION_ID")]
    pub operation_id: String,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Roll back even if the files changed after the operation
    #[arg(long)]
    pub force: bool,
}

/// Execute the rollback command.
#[instrument(name = "cmd_rollback", skip_all, fields(reverts = %args.operation_id))]
pub fn cmd_rollback(
    args: RollbackArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<Exit> {
    debug!(json_output = global_json, "executing rollback command");

    if !args.yes && !confirm(&args.operation_id)? {
        println!("{}", "Cancelled.".yellow());
        return Ok(Exit::Success);
    }

    let mut pipeline = Pipeline::new(config.version.labels.clone());
    if config.backup.enabled {
        pipeline = pipeline.with_backups(BackupManager::new(config.backup_dir(cwd)));
    }
    if config.audit.enabled {
        pipeline = pipeline.with_audit(Arc::new(FileAuditLog::new(config.audit_dir(cwd))));
    }

    let report = pipeline
        .rollback(&args.operation_id, args.force)
        .with_context(|| format!("cannot roll back {}", args.operation_id))?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if let Some(failure) = &report.failure {
        eprintln!("{} {failure}", "error:".red().bold());
        return Ok(exit::for_run_error(failure));
    }
    if let AuditStatus::Failed { message } = &report.audit {
        eprintln!(
            "{} audit entry for {} was not recorded: {message}",
            "warning:".yellow().bold(),
            report.operation_id
        );
    }
    Ok(exit::for_audit(&report.audit))
}

fn confirm(operation_id: &str) -> anyhow::Result<bool> {
    if !std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        return Err(UsageError(
            "refusing to roll back without confirmation; pass --yes".into(),
        )
        .into());
    }
    // An interrupted prompt counts as a no.
    Ok(Confirm::new(&format!("Restore the files changed by {operation_id}?"))
        .with_default(false)
        .prompt()
        .unwrap_or(false))
}

fn print_report(report: &RollbackReport) {
    for change in &report.files_restored {
        println!("  {} Restored {}", "✓".green(), change.path.cyan());
    }
    if report.failure.is_none() {
        println!(
            "{}: {} {}",
            "Reverted".bold(),
            report.reverts,
            format!("({} file(s))", report.files_restored.len()).dimmed()
        );
    }
    println!("{}: {}", "Operation".dimmed(), report.operation_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpkit_core::run::{Mode, RunRequest};
    use camino::Utf8PathBuf;

    fn apply(config: &Config, root: &Utf8Path, target: &Utf8Path, text: &str) -> String {
        Pipeline::new(config.version.labels.clone())
            .with_backups(BackupManager::new(config.backup_dir(root)))
            .run(
                &RunRequest {
                    text: text.into(),
                    bump_type: None,
                    mode: Mode::Apply,
                    target: Some(target.to_path_buf()),
                },
                |_| {},
            )
            .unwrap()
            .operation_id
    }

    #[test]
    fn restores_an_applied_bump() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let target = root.join("STANDARDS.md");
        std::fs::write(&target, "VERSION: 01.02.03\n").unwrap();

        let config = Config::default();
        let applied = apply(&config, &root, &target, "feat: add retry logic");
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "VERSION: 01.03.00\n"
        );

        let exit = cmd_rollback(
            RollbackArgs {
                operation_id: applied,
                yes: true,
                force: false,
            },
            true,
            &config,
            &root,
        )
        .unwrap();
        assert_eq!(exit, Exit::Success);
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "VERSION: 01.02.03\n"
        );
    }

    #[test]
    fn unknown_operation_is_a_usage_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let err = cmd_rollback(
            RollbackArgs {
                operation_id: "nope".into(),
                yes: true,
                force: false,
            },
            true,
            &Config::default(),
            &root,
        )
        .unwrap_err();
        assert_eq!(exit::for_error(&err), Exit::Usage);
    }

    #[test]
    fn later_change_blocks_rollback_until_forced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let target = root.join("STANDARDS.md");
        std::fs::write(&target, "VERSION: 1.0.0\n").unwrap();
        let config = Config::default();
        let first = apply(&config, &root, &target, "feat: a");
        apply(&config, &root, &target, "fix: b");

        let args = |force| RollbackArgs {
            operation_id: first.clone(),
            yes: true,
            force,
        };

        let err = cmd_rollback(args(false), true, &config, &root).unwrap_err();
        assert_eq!(exit::for_error(&err), Exit::Usage);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "VERSION: 1.1.1\n");

        let exit = cmd_rollback(args(true), true, &config, &root).unwrap();
        assert_eq!(exit, Exit::Success);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "VERSION: 1.0.0\n");
    }
}
