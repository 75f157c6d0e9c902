//! Run state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::TaskRef;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    PrOpen,
    CiFailed,
    CiPassed,
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::PrOpen => "pr_open",
            RunStatus::CiFailed => "ci_failed",
            RunStatus::CiPassed => "ci_passed",
            RunStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::CiPassed | RunStatus::Abandoned)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `abandoned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AbandonReason {
    /// The model found nothing to change.
    NoChangeNeeded,
    Cancelled,
    DeadlineExceeded,
    /// Every allowed attempt failed.
    RetriesExhausted,
    /// Credentials, repository access or the Issue itself could not be read.
    SetupFailed(String),
    /// An error no new attempt can fix.
    Unrecoverable(String),
    /// The feedback channel closed while waiting for CI.
    SignalsClosed,
}

impl AbandonReason {
    /// Human readable explanation for status comments.
    pub fn describe(&self) -> String {
        match self {
            AbandonReason::NoChangeNeeded => {
                "the repository already satisfies the issue, no changes needed".to_string()
            }
            AbandonReason::Cancelled => "the run was cancelled".to_string(),
            AbandonReason::DeadlineExceeded => "the run exceeded its deadline".to_string(),
            AbandonReason::RetriesExhausted => "every allowed attempt failed".to_string(),
            AbandonReason::SetupFailed(detail) => format!("setup failed: {}", detail),
            AbandonReason::Unrecoverable(detail) => format!("unrecoverable error: {}", detail),
            AbandonReason::SignalsClosed => "CI feedback stopped arriving".to_string(),
        }
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RunStatus,
    pub to: RunStatus,
    pub attempt_count: u32,
    pub at: DateTime<Utc>,
}

/// State of one run. Changed only through [`RunState::transition`] and
/// [`RunState::begin_attempt`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    task_ref: TaskRef,
    attempt_count: u32,
    max_attempts: u32,
    status: RunStatus,
    history: Vec<TransitionRecord>,
}

impl RunState {
    pub fn new(task_ref: TaskRef, max_attempts: u32) -> Self {
        Self {
            task_ref,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            status: RunStatus::Pending,
            history: Vec::new(),
        }
    }

    pub fn task_ref(&self) -> &TaskRef {
        &self.task_ref
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// True while another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Whether `from → to` is allowed given the attempts used so far.
    pub fn allows(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        match (self.status, to) {
            (Pending, InProgress) | (Pending, Abandoned) => true,
            (InProgress, InProgress) => self.attempt_count > 0 && self.can_retry(),
            (InProgress, PrOpen) | (InProgress, Abandoned) => true,
            (PrOpen, CiFailed) | (PrOpen, CiPassed) | (PrOpen, Abandoned) => true,
            (CiFailed, InProgress) => self.can_retry(),
            (CiFailed, Abandoned) => true,
            _ => false,
        }
    }

    /// Moves to `to`, or fails with [`Error::InvalidTransition`].
    pub fn transition(&mut self, to: RunStatus) -> Result<()> {
        if !self.allows(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        tracing::info!(
            task = %self.task_ref,
            from = %self.status,
            to = %to,
            attempt = self.attempt_count,
            "run transition"
        );
        self.history.push(TransitionRecord {
            from: self.status,
            to,
            attempt_count: self.attempt_count,
            at: Utc::now(),
        });
        self.status = to;
        Ok(())
    }

    /// Counts a new attempt. Only valid while `in_progress` with attempts left.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        if self.status != RunStatus::InProgress || !self.can_retry() {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: format!("attempt {}", self.attempt_count + 1),
            });
        }
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }
}
