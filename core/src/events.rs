//! Feedback signals and the events the run controller reacts to.
//!
//! A [`Signal`] is what arrives on the feedback channel: a snapshot of the
//! check runs for a commit, or a pull request review. The PR orchestrator
//! normalizes it into a [`RunEvent`].

use serde::{Deserialize, Serialize};

use crate::github::CheckRun;

/// Check runs reported for one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiSignal {
    pub head_sha: String,
    #[serde(default)]
    pub checks: Vec<CheckRun>,
    /// Set once the watcher stopped expecting new checks to appear.
    #[serde(default)]
    pub settled: bool,
}

/// A pull request review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSignal {
    /// Commit the review was left on, when the host reports it.
    #[serde(default)]
    pub head_sha: Option<String>,
    pub state: String,
    #[serde(default)]
    pub body: String,
}

/// Raw CI or reviewer callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Ci(CiSignal),
    Review(ReviewSignal),
}

impl Signal {
    /// Commit the signal refers to, if known.
    pub fn head_sha(&self) -> Option<&str> {
        match self {
            Signal::Ci(ci) => Some(&ci.head_sha),
            Signal::Review(review) => review.head_sha.as_deref(),
        }
    }

    /// True when the signal is about a commit other than `head`.
    ///
    /// Reviews without a commit are never stale.
    pub fn is_stale(&self, head: &str) -> bool {
        self.head_sha().is_some_and(|sha| sha != head)
    }
}

/// Normalized feedback consumed by the run controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// Checks are still queued or running.
    CiPending,
    /// Every check succeeded, or the repository has no CI.
    CiPassed,
    CiFailed { feedback: String },
    ChangesRequested { feedback: String },
    /// Approvals and plain review comments; nothing to do.
    Noted,
}

impl RunEvent {
    /// Feedback for the next attempt, if this event asks for one.
    pub fn feedback(&self) -> Option<&str> {
        match self {
            RunEvent::CiFailed { feedback } | RunEvent::ChangesRequested { feedback } => {
                Some(feedback)
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::CiPending => "ci_pending",
            RunEvent::CiPassed => "ci_passed",
            RunEvent::CiFailed { .. } => "ci_failed",
            RunEvent::ChangesRequested { .. } => "changes_requested",
            RunEvent::Noted => "noted",
        }
    }
}
