//! One classify-then-apply run, start to finish.
//!
//! [`Pipeline::run`] drives a [`StateMachine`] through
//! `pending → classified → decided → backed_up → written → logged → done`.
//! Before each destructive step the matching [`Compensation`] is recorded;
//! a failure after `backed_up` replays them in reverse before the outcome is
//! logged.
//!
//! Dry runs and report-only runs stop after `decided` and never touch the
//! backup directory, the target, or the audit sink.

pub mod state;

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::field::{Empty, display};
use tracing::{Span, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{Action, AuditEntry, AuditSink, FileChange, Outcome};
use crate::backup::{BackupError, BackupManager, BackupRecord};
use crate::classify::{BumpDecision, BumpKind, classify};
use crate::digest::content_hash;
use crate::lock::{LockError, TargetLock};
use crate::version::{
    AtomicFileWriter, DocumentWriter, SemanticVersion, VersionDocument, VersionError,
};

pub use state::{Compensation, Compensations, IllegalTransition, RunState, StateMachine};

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum RunError {
    /// Both `--apply` and `--dry-run` were requested.
    #[error("--apply and --dry-run are mutually exclusive")]
    ConflictingModes,

    /// `--apply` without a document to apply to.
    #[error("nothing to apply to: pass --target or set version.file")]
    MissingTarget,

    /// Explicit rollback with backups turned off.
    #[error("backups are disabled; nothing to roll back from")]
    BackupsDisabled,

    /// The target could not be read, or its token was missing or malformed.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Another process holds the target.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The snapshot failed; nothing was changed.
    #[error("backup failed, target left unchanged: {0}")]
    Backup(#[source] BackupError),

    /// The write failed and there was no backup to undo it with.
    #[error("{0} (no backup was taken)")]
    Write(#[source] VersionError),

    /// The write failed and the target was restored.
    #[error("{0}; target restored from backup")]
    RolledBack(#[source] VersionError),

    /// Undoing a failed write failed too. The target may be inconsistent.
    #[error(
        "rollback failed: {path} may be inconsistent (expected hash {expected}, backup at {backup_location}): {source}"
    )]
    Inconsistent {
        /// File that could not be restored.
        path: Utf8PathBuf,
        /// Hash the file should have.
        expected: String,
        /// Blob holding the good content.
        backup_location: Utf8PathBuf,
        /// Why the restore failed.
        #[source]
        source: BackupError,
    },

    /// An explicit rollback could not start.
    #[error("rollback failed: {0}")]
    Rollback(#[source] BackupError),

    /// A file was changed after the operation being rolled back wrote it.
    #[error(
        "{path} has changed since operation {operation_id} (expected {expected}, found {actual}); pass --force to roll back anyway"
    )]
    Diverged {
        /// Operation being rolled back.
        operation_id: String,
        /// File whose contents moved on.
        path: Utf8PathBuf,
        /// Hash the operation left the file with.
        expected: String,
        /// Hash the file has now; empty when it is missing.
        actual: String,
    },

    /// Internal sequencing bug.
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

impl RunError {
    fn inconsistent(record: BackupRecord, source: BackupError) -> Self {
        Self::Inconsistent {
            path: record.path,
            expected: record.original_content_hash,
            backup_location: record.backup_location,
            source,
        }
    }
}

/// Result alias for runs.
pub type RunResult<T> = Result<T, RunError>;

/// What a run is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Classify and report only.
    Report,
    /// Classify and compute the next version without mutating anything.
    DryRun,
    /// Mutate the target, back it up, and log the outcome.
    Apply,
}

impl Mode {
    /// Mode from the `--apply` / `--dry-run` flags.
    pub fn from_flags(apply: bool, dry_run: bool) -> RunResult<Self> {
        match (apply, dry_run) {
            (true, true) => Err(RunError::ConflictingModes),
            (true, false) => Ok(Self::Apply),
            (false, true) => Ok(Self::DryRun),
            (false, false) => Ok(Self::Report),
        }
    }
}

/// Input to [`Pipeline::run`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Text to classify.
    pub text: String,
    /// Explicit bump kind; skips classification.
    pub bump_type: Option<BumpKind>,
    /// What the run may do.
    pub mode: Mode,
    /// Document holding the version token.
    pub target: Option<Utf8PathBuf>,
}

/// Whether the outcome reached the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AuditStatus {
    /// Only apply and rollback runs are audited.
    Skipped,
    /// Auditing is turned off.
    Disabled,
    /// One entry was appended.
    Recorded,
    /// The append failed; the trail may be incomplete.
    Failed {
        /// Why the append failed.
        message: String,
    },
}

/// Everything a run did.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Unique id of this run.
    pub operation_id: String,
    /// Mode the run executed in.
    pub mode: Mode,
    /// The classification.
    pub decision: BumpDecision,
    /// Target document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Utf8PathBuf>,
    /// Version found in the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<SemanticVersion>,
    /// Version written, or that would be written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<SemanticVersion>,
    /// Files mutated by the run.
    pub files_affected: Vec<FileChange>,
    /// Snapshots taken before mutating.
    pub backups: Vec<BackupRecord>,
    /// Final state.
    pub result: Outcome,
    /// Rendered failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Audit outcome.
    pub audit: AuditStatus,
    /// States entered, in order.
    pub states: Vec<RunState>,
    /// The failure itself, for callers that need to inspect it.
    #[serde(skip)]
    pub failure: Option<RunError>,
}

impl RunReport {
    /// Whether the run changed the target and kept the change.
    pub fn mutated(&self) -> bool {
        self.result == Outcome::Success && !self.files_affected.is_empty()
    }
}

/// Result of [`Pipeline::rollback`].
#[derive(Debug, Serialize)]
pub struct RollbackReport {
    /// Id of the rollback itself.
    pub operation_id: String,
    /// Operation that was undone.
    pub reverts: String,
    /// Files put back.
    pub files_restored: Vec<FileChange>,
    /// Final state.
    pub result: Outcome,
    /// Rendered failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Audit outcome.
    pub audit: AuditStatus,
    /// The failure itself.
    #[serde(skip)]
    pub failure: Option<RunError>,
}

/// Runs bumps against documents.
///
/// Every collaborator is a port: the writer, the backup store, and the
/// audit sink can all be swapped, which is how the tests simulate failures.
pub struct Pipeline {
    labels: Vec<String>,
    writer: Box<dyn DocumentWriter>,
    backups: Option<BackupManager>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("labels", &self.labels)
            .field("backups", &self.backups)
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// A pipeline that looks for tokens introduced by `labels`, writes
    /// atomically, and has neither backups nor auditing.
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            writer: Box::new(AtomicFileWriter),
            backups: None,
            audit: None,
        }
    }

    /// Use `writer` for the destructive step.
    #[must_use]
    pub fn with_writer(mut self, writer: impl DocumentWriter + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    /// Snapshot targets into `backups` before writing.
    #[must_use]
    pub fn with_backups(mut self, backups: BackupManager) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Record apply and rollback outcomes in `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// The backup store, when enabled.
    pub fn backups(&self) -> Option<&BackupManager> {
        self.backups.as_ref()
    }

    /// Execute one run.
    ///
    /// Returns `Err` only when the request itself is unusable. Failures
    /// during the run are carried in [`RunReport::failure`] so the caller
    /// always gets the full account of what happened.
    #[instrument(
        skip(self, request, on_state),
        fields(mode = ?request.mode, target = ?request.target, operation_id = Empty, state = Empty)
    )]
    pub fn run(
        &self,
        request: &RunRequest,
        on_state: impl FnMut(RunState),
    ) -> RunResult<RunReport> {
        if request.mode == Mode::Apply && request.target.is_none() {
            return Err(RunError::MissingTarget);
        }

        let operation_id = Uuid::new_v4().to_string();
        let span = Span::current();
        span.record("operation_id", operation_id.as_str());

        let mut run = Execution {
            pipeline: self,
            machine: StateMachine::new(),
            compensations: Compensations::default(),
            on_state,
            span,
            input_digest: content_hash(&request.text),
            report: RunReport {
                operation_id,
                mode: request.mode,
                decision: BumpDecision::none(),
                target: request.target.clone(),
                previous_version: None,
                new_version: None,
                files_affected: Vec::new(),
                backups: Vec::new(),
                result: Outcome::Success,
                error: None,
                audit: AuditStatus::Skipped,
                states: Vec::new(),
                failure: None,
            },
        };

        run.report.decision = classify(&request.text, request.bump_type);
        run.advance(RunState::Classified)?;

        match (request.mode, request.target.as_deref()) {
            (Mode::Apply, Some(target)) => run.apply(target)?,
            (_, Some(target)) => run.preview(target)?,
            (_, None) => run.advance(RunState::Done)?,
        }

        Ok(run.finish())
    }

    /// Undo an earlier apply from its persisted snapshot.
    ///
    /// Each file must still hold what the operation wrote, or already be back
    /// at its snapshot. Anything else means a later change would be lost, and
    /// the rollback is refused with [`RunError::Diverged`] unless `force` is
    /// set.
    #[instrument(
        skip_all,
        fields(reverts = %operation_id, force = force, operation_id = Empty)
    )]
    pub fn rollback(&self, operation_id: &str, force: bool) -> RunResult<RollbackReport> {
        let backups = self.backups.as_ref().ok_or(RunError::BackupsDisabled)?;
        let manifest = backups.load(operation_id).map_err(RunError::Rollback)?;

        let mut locks = Vec::with_capacity(manifest.records.len());
        for record in &manifest.records {
            locks.push(TargetLock::acquire(&record.path)?);
        }
        let hashes_before: Vec<String> = manifest
            .records
            .iter()
            .map(|record| current_hash(&record.path))
            .collect();

        for (record, actual) in manifest.records.iter().zip(&hashes_before) {
            let expected = record
                .written_hash
                .as_deref()
                .unwrap_or(&record.original_content_hash);
            let untouched = actual == expected || *actual == record.original_content_hash;
            if untouched {
                continue;
            }
            if force {
                warn!(path = %record.path, "file changed since the operation; rolling back anyway");
                continue;
            }
            return Err(RunError::Diverged {
                operation_id: operation_id.to_owned(),
                path: record.path.clone(),
                expected: expected.to_owned(),
                actual: actual.clone(),
            });
        }

        let rollback_id = Uuid::new_v4().to_string();
        Span::current().record("operation_id", rollback_id.as_str());
        let mut report = RollbackReport {
            operation_id: rollback_id,
            reverts: operation_id.to_owned(),
            files_restored: Vec::new(),
            result: Outcome::RolledBack,
            error: None,
            audit: AuditStatus::Skipped,
            failure: None,
        };

        match backups.consume(operation_id) {
            Ok(records) => {
                report.files_restored = records
                    .into_iter()
                    .zip(hashes_before)
                    .map(|(record, hash_before)| FileChange {
                        path: record.path,
                        hash_before,
                        hash_after: record.original_content_hash,
                    })
                    .collect();
                info!(files = report.files_restored.len(), "operation rolled back");
            }
            Err(e) => {
                let unverified = match &e {
                    BackupError::RestoreVerification {
                        path,
                        expected,
                        backup_location,
                        ..
                    } => Some((path.clone(), expected.clone(), backup_location.clone())),
                    _ => None,
                };
                let failure = match unverified {
                    Some((path, expected, backup_location)) => RunError::Inconsistent {
                        path,
                        expected,
                        backup_location,
                        source: e,
                    },
                    None => RunError::Rollback(e),
                };
                error!(error = %failure, "explicit rollback failed");
                report.result = Outcome::Failed;
                report.error = Some(failure.to_string());
                report.failure = Some(failure);
            }
        }
        drop(locks);

        report.audit = self.record(&AuditEntry {
            operation_id: report.operation_id.clone(),
            timestamp: Utc::now(),
            action: Action::Rollback,
            input_digest: content_hash(operation_id),
            decision: BumpDecision::none(),
            reverts: Some(operation_id.to_owned()),
            target: manifest.records.first().map(|r| r.path.clone()),
            previous_version: None,
            new_version: None,
            files_affected: report.files_restored.clone(),
            result: report.result,
            error: report.error.clone(),
        });
        Ok(report)
    }

    fn record(&self, entry: &AuditEntry) -> AuditStatus {
        let Some(sink) = &self.audit else {
            return AuditStatus::Disabled;
        };
        match sink.record(entry) {
            Ok(()) => AuditStatus::Recorded,
            Err(e) => {
                warn!(error = %e, operation_id = %entry.operation_id, "audit append failed");
                AuditStatus::Failed {
                    message: e.to_string(),
                }
            }
        }
    }
}

fn current_hash(path: &Utf8Path) -> String {
    std::fs::read(path).map(content_hash).unwrap_or_default()
}

// ──────────────────────────────────────────────
// Execution
// ──────────────────────────────────────────────

struct Execution<'p, F> {
    pipeline: &'p Pipeline,
    machine: StateMachine,
    compensations: Compensations,
    on_state: F,
    span: Span,
    input_digest: String,
    report: RunReport,
}

impl<F: FnMut(RunState)> Execution<'_, F> {
    fn advance(&mut self, next: RunState) -> RunResult<()> {
        self.machine.advance(next)?;
        self.span.record("state", display(next));
        (self.on_state)(next);
        Ok(())
    }

    fn document(&self, target: &Utf8Path) -> VersionDocument {
        VersionDocument::new(target, self.pipeline.labels.clone())
    }

    /// Dry run or report: compute the would-be version, change nothing.
    fn preview(&mut self, target: &Utf8Path) -> RunResult<()> {
        match self.document(target).load() {
            Ok(loaded) => {
                self.report.previous_version = Some(loaded.token.version);
                if !self.report.decision.is_none() {
                    match loaded.plan(self.report.decision.kind) {
                        Ok(planned) => self.report.new_version = Some(planned.next),
                        Err(e) => {
                            self.fail(RunError::Version(e));
                            return self.advance(RunState::Done);
                        }
                    }
                }
                self.advance(RunState::Decided)?;
            }
            Err(e) => self.fail(RunError::Version(e)),
        }
        self.advance(RunState::Done)
    }

    fn apply(&mut self, target: &Utf8Path) -> RunResult<()> {
        let pipeline = self.pipeline;
        if self.report.decision.is_none() {
            info!("no bump, nothing to apply");
            return self.log_and_finish();
        }

        let _lock = match TargetLock::acquire(target) {
            Ok(lock) => lock,
            Err(e) => {
                self.fail(RunError::Lock(e));
                return self.log_and_finish();
            }
        };

        let planned = match self
            .document(target)
            .load()
            .and_then(|loaded| loaded.plan(self.report.decision.kind))
        {
            Ok(planned) => planned,
            Err(e) => {
                self.fail(RunError::Version(e));
                return self.log_and_finish();
            }
        };
        self.report.previous_version = Some(planned.previous);
        self.report.new_version = Some(planned.next);
        self.advance(RunState::Decided)?;

        if let Some(backups) = &pipeline.backups {
            let paths = [target.to_path_buf()];
            match backups.snapshot_for(&self.report.operation_id, &paths) {
                Ok(records) => {
                    for record in &records {
                        self.compensations.push(Compensation::Restore(record.clone()));
                    }
                    self.report.backups = records;
                    self.advance(RunState::BackedUp)?;
                }
                Err(e) => {
                    self.fail(RunError::Backup(e));
                    return self.log_and_finish();
                }
            }
        }

        match planned.write(pipeline.writer.as_ref()) {
            Ok(written) => {
                self.mark_written(&written.hash_after);
                self.report.files_affected.push(FileChange {
                    path: written.path,
                    hash_before: written.hash_before,
                    hash_after: written.hash_after,
                });
                self.advance(RunState::Written)?;
            }
            Err(e) => self.recover(e)?,
        }

        self.log_and_finish()
    }

    /// Record in the manifest what the write left behind, so a later explicit
    /// rollback can tell whether anything changed since.
    fn mark_written(&mut self, hash_after: &str) {
        let pipeline = self.pipeline;
        let Some(backups) = &pipeline.backups else {
            return;
        };
        for record in &mut self.report.backups {
            match backups.mark_written(&self.report.operation_id, &record.path, hash_after) {
                Ok(()) => record.written_hash = Some(hash_after.to_owned()),
                Err(e) => warn!(path = %record.path, error = %e, "could not record written hash"),
            }
        }
    }

    /// Undo a failed write, if there is anything to undo it with.
    fn recover(&mut self, write_error: VersionError) -> RunResult<()> {
        let pipeline = self.pipeline;
        let (Some(backups), false) = (&pipeline.backups, self.compensations.is_empty()) else {
            self.fail(RunError::Write(write_error));
            return Ok(());
        };

        self.advance(RunState::RollingBack)?;
        warn!(error = %write_error, "write failed, rolling back");
        match std::mem::take(&mut self.compensations).unwind(backups) {
            Ok(restored) => {
                info!(restored, "target restored");
                self.advance(RunState::RolledBack)?;
                self.fail(RunError::RolledBack(write_error));
                self.report.result = Outcome::RolledBack;
            }
            Err(failed) => {
                let (record, source) = *failed;
                let failure = RunError::inconsistent(record, source);
                error!(error = %failure, "rollback failed");
                self.fail(failure);
            }
        }
        Ok(())
    }

    fn fail(&mut self, failure: RunError) {
        self.report.result = Outcome::Failed;
        self.report.error = Some(failure.to_string());
        self.report.failure = Some(failure);
    }

    fn log_and_finish(&mut self) -> RunResult<()> {
        if self.pipeline.audit.is_none() {
            self.report.audit = AuditStatus::Disabled;
            return self.advance(RunState::Done);
        }

        let report = &self.report;
        let entry = AuditEntry {
            operation_id: report.operation_id.clone(),
            timestamp: Utc::now(),
            action: Action::Apply,
            input_digest: self.input_digest.clone(),
            decision: report.decision.clone(),
            reverts: None,
            target: report.target.clone(),
            previous_version: report.previous_version.map(|v| v.to_string()),
            new_version: report.new_version.map(|v| v.to_string()),
            files_affected: report.files_affected.clone(),
            result: report.result,
            error: report.error.clone(),
        };
        self.report.audit = self.pipeline.record(&entry);
        self.advance(RunState::Logged)?;
        self.advance(RunState::Done)
    }

    fn finish(mut self) -> RunReport {
        self.report.states = self.machine.trail().to_vec();
        self.report
    }
}
