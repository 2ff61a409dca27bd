//! Run states and the compensations recorded along the way.

use serde::Serialize;
use thiserror::Error;

use crate::backup::{BackupError, BackupManager, BackupRecord};

/// States of one classify-then-apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Nothing has happened yet.
    Pending,
    /// The text has been classified.
    Classified,
    /// The target was read and the next version computed.
    Decided,
    /// Every file about to change has a verified snapshot.
    BackedUp,
    /// The target holds the new version.
    Written,
    /// A failure after backup is being undone.
    RollingBack,
    /// The target is back to its snapshot.
    RolledBack,
    /// The outcome was handed to the audit sink.
    Logged,
    /// Terminal.
    Done,
}

impl RunState {
    /// Whether a run in `self` may move to `next`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        use RunState::{
            BackedUp, Classified, Decided, Done, Logged, Pending, RolledBack, RollingBack, Written,
        };
        matches!(
            (self, next),
            (Pending, Classified)
                | (Classified, Decided | Logged | Done)
                | (Decided, BackedUp | Written | Logged | Done)
                | (BackedUp, Written | RollingBack)
                | (Written, Logged | RollingBack | Done)
                | (RollingBack, RolledBack | Logged | Done)
                | (RolledBack, Logged | Done)
                | (Logged, Done)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Classified => "classified",
            Self::Decided => "decided",
            Self::BackedUp => "backed_up",
            Self::Written => "written",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Logged => "logged",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// A transition the state table does not allow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal run transition {from} -> {to}")]
pub struct IllegalTransition {
    /// State the run was in.
    pub from: RunState,
    /// State that was requested.
    pub to: RunState,
}

/// Tracks the current state and every state entered so far.
#[derive(Debug, Clone)]
pub struct StateMachine {
    trail: Vec<RunState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            trail: vec![RunState::Pending],
        }
    }
}

impl StateMachine {
    /// A machine in [`RunState::Pending`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state.
    pub fn state(&self) -> RunState {
        self.trail.last().copied().unwrap_or(RunState::Pending)
    }

    /// Every state entered, in order.
    pub fn trail(&self) -> &[RunState] {
        &self.trail
    }

    /// Move to `next`, refusing anything the table does not allow.
    pub fn advance(&mut self, next: RunState) -> Result<(), IllegalTransition> {
        let from = self.state();
        if !from.can_advance_to(next) {
            return Err(IllegalTransition { from, to: next });
        }
        self.trail.push(next);
        Ok(())
    }
}

/// The undo action for one destructive step.
#[derive(Debug, Clone)]
pub enum Compensation {
    /// Put a file back from its snapshot.
    Restore(BackupRecord),
}

/// Compensations in the order their steps ran.
#[derive(Debug, Clone, Default)]
pub struct Compensations(Vec<Compensation>);

impl Compensations {
    /// Record the undo action for a step about to run.
    pub fn push(&mut self, compensation: Compensation) {
        self.0.push(compensation);
    }

    /// Whether anything can be undone.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replay every compensation, most recent first.
    ///
    /// Stops at the first failure and returns the record it was restoring.
    pub fn unwind(
        self,
        backups: &BackupManager,
    ) -> Result<usize, Box<(BackupRecord, BackupError)>> {
        let count = self.0.len();
        for compensation in self.0.into_iter().rev() {
            match compensation {
                Compensation::Restore(record) => {
                    if let Err(e) = backups.restore(std::slice::from_ref(&record)) {
                        return Err(Box::new((record, e)));
                    }
                }
            }
        }
        Ok(count)
    }
}
