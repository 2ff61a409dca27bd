//! Process exit codes.
//!
//! | Code | Meaning                                                   |
//! |------|-----------------------------------------------------------|
//! | 0    | Success, including a `none` decision                      |
//! | 1    | Version token missing, ambiguous, or malformed            |
//! | 2    | Backup, write, or rollback failure                        |
//! | 3    | Configuration or input error                              |
//! | 4    | The write succeeded but the audit trail was not updated   |

use std::process::ExitCode;

use bumpkit_core::backup::BackupError;
use bumpkit_core::error::ConfigError;
use bumpkit_core::input::InputError;
use bumpkit_core::run::{AuditStatus, RunError, RunReport};
use bumpkit_core::version::VersionError;

/// Exit status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Exit {
    /// Everything worked.
    Success = 0,
    /// The version token could not be used.
    Token = 1,
    /// A backup, write, or rollback failed.
    Mutation = 2,
    /// Bad configuration or bad arguments.
    Usage = 3,
    /// The audit trail may be incomplete.
    AuditIncomplete = 4,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        Self::from(exit as u8)
    }
}

/// A command line that cannot be acted on.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct UsageError(pub String);

/// Exit status for a failed run.
pub const fn for_run_error(err: &RunError) -> Exit {
    match err {
        RunError::ConflictingModes | RunError::MissingTarget | RunError::BackupsDisabled => {
            Exit::Usage
        }
        RunError::Version(version) if version.is_token_problem() => Exit::Token,
        RunError::Rollback(BackupError::NotFound(_)) | RunError::Diverged { .. } => Exit::Usage,
        _ => Exit::Mutation,
    }
}

/// Exit status for a finished run.
pub fn for_report(report: &RunReport) -> Exit {
    if let Some(failure) = &report.failure {
        return for_run_error(failure);
    }
    for_audit(&report.audit)
}

/// Exit status implied by the audit outcome of an otherwise successful run.
pub const fn for_audit(status: &AuditStatus) -> Exit {
    match status {
        AuditStatus::Failed { .. } => Exit::AuditIncomplete,
        _ => Exit::Success,
    }
}

/// Exit status for an error that ended a command, found by walking its
/// cause chain.
pub fn for_error(err: &anyhow::Error) -> Exit {
    for cause in err.chain() {
        if let Some(run) = cause.downcast_ref::<RunError>() {
            return for_run_error(run);
        }
        if let Some(version) = cause.downcast_ref::<VersionError>() {
            return if version.is_token_problem() {
                Exit::Token
            } else {
                Exit::Mutation
            };
        }
        if cause.is::<InputError>()
            || cause.is::<ConfigError>()
            || cause.is::<UsageError>()
            || cause.is::<clap::Error>()
        {
            return Exit::Usage;
        }
    }
    Exit::Mutation
}
