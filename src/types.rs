//! Core domain types for objsync

use crate::error::Error;
use crate::storage::ObjectRef;
use std::fmt;
use std::time::Duration;

/// Why a path was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Same digest on both sides
    Identical,
    /// Directory marker present on both sides
    DirectoryExists,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Identical => f.write_str("identical"),
            SkipReason::DirectoryExists => f.write_str("directory exists"),
        }
    }
}

/// Action planned by the diff engine
#[derive(Debug, Clone)]
pub enum SyncAction {
    /// Write the source object at `dest_path` in the destination
    Copy { source: ObjectRef, dest_path: String },

    /// Remove an extraneous object from the destination
    Delete { path: String },

    /// Nothing to do
    Skip { path: String, reason: SkipReason },
}

impl SyncAction {
    /// The destination-relative path this action targets
    pub fn path(&self) -> &str {
        match self {
            SyncAction::Copy { dest_path, .. } => dest_path,
            SyncAction::Delete { path } => path,
            SyncAction::Skip { path, .. } => path,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            SyncAction::Copy { .. } => ActionKind::Copy,
            SyncAction::Delete { .. } => ActionKind::Delete,
            SyncAction::Skip { .. } => ActionKind::Skip,
        }
    }

    /// Check if this action transfers data
    pub fn transfers_data(&self) -> bool {
        matches!(self, SyncAction::Copy { source, .. } if !source.is_dir())
    }
}

/// Action variant without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    Copy,
    Delete,
    Skip,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Copy => f.write_str("copy"),
            ActionKind::Delete => f.write_str("delete"),
            ActionKind::Skip => f.write_str("skip"),
        }
    }
}

/// How a single action ended
#[derive(Debug)]
pub enum Outcome {
    Applied,
    Skipped,
    Failed(Error),
}

/// Result of one action
#[derive(Debug)]
pub struct ActionOutcome {
    pub path: String,
    pub kind: ActionKind,
    pub outcome: Outcome,
    /// Payload bytes moved (0 for deletes, skips and dry runs)
    pub bytes: u64,
}

impl ActionOutcome {
    pub fn applied(path: impl Into<String>, kind: ActionKind, bytes: u64) -> Self {
        Self {
            path: path.into(),
            kind,
            outcome: Outcome::Applied,
            bytes,
        }
    }

    pub fn skipped(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ActionKind::Skip,
            outcome: Outcome::Skipped,
            bytes: 0,
        }
    }

    pub fn failed(path: impl Into<String>, kind: ActionKind, error: Error) -> Self {
        Self {
            path: path.into(),
            kind,
            outcome: Outcome::Failed(error),
            bytes: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Final report of a sync run
#[derive(Debug, Default)]
pub struct SyncReport {
    /// One entry per action, in completion order
    pub outcomes: Vec<ActionOutcome>,

    /// Run-level failures such as enumeration errors
    pub fatal: Vec<Error>,

    /// Path whose failure stopped dispatch, when errors are not ignored
    pub halted_by: Option<String>,

    /// Whether the run was a dry run
    pub dry_run: bool,

    /// Interrupted before every action was dispatched
    pub cancelled: bool,

    /// Wall-clock duration
    pub duration: Duration,
}

impl SyncReport {
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o.outcome, Outcome::Applied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o.outcome, Outcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(ActionOutcome::is_failed)
    }

    /// Applied actions of one kind
    pub fn applied_of(&self, kind: ActionKind) -> usize {
        self.count(|o| o.kind == kind && matches!(o.outcome, Outcome::Applied))
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes).sum()
    }

    /// Failed actions, including those masked by `ignore_errors`
    pub fn failures(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    /// Non-zero failure indicator: any fatal condition, any failed action or
    /// an interrupted run
    pub fn has_failures(&self) -> bool {
        !self.fatal.is_empty() || self.halted_by.is_some() || self.cancelled || self.failed() > 0
    }

    /// Outcome recorded for `path`, if any
    pub fn outcome_for(&self, path: &str) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| o.path == path)
    }

    /// Calculate transfer rate in bytes per second
    pub fn transfer_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_transferred() as f64 / secs
        }
    }

    fn count(&self, pred: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_tally() {
        let mut report = SyncReport::default();
        report.outcomes.push(ActionOutcome::applied("a.txt", ActionKind::Copy, 10));
        report.outcomes.push(ActionOutcome::skipped("b.txt"));
        report.outcomes.push(ActionOutcome::applied("c.txt", ActionKind::Delete, 0));
        report.outcomes.push(ActionOutcome::failed(
            "d.txt",
            ActionKind::Copy,
            Error::storage("nope"),
        ));

        assert_eq!(report.applied(), 2);
        assert_eq!(report.applied_of(ActionKind::Delete), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.bytes_transferred(), 10);
        assert!(report.has_failures());
        assert_eq!(report.failures().next().unwrap().path, "d.txt");
    }

    #[test]
    fn test_clean_report_has_no_failures() {
        let mut report = SyncReport::default();
        report.outcomes.push(ActionOutcome::skipped("b.txt"));
        assert!(!report.has_failures());

        report.fatal.push(Error::Cancelled);
        assert!(report.has_failures());
    }
}
