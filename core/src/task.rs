//! Tasks and attempts.
//!
//! A [`Task`] is the Issue the run works on; it is read once and never
//! changes. Each pass of prompt → model → patch → apply is recorded as an
//! [`Attempt`], which is assembled through a [`PendingAttempt`] and frozen
//! when its outcome is known.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RepoRef;
use crate::error::Error;
use crate::model::{ModelRequest, ModelResponse};
use crate::patch::PatchSet;
use crate::repo::CommitRef;

/// Identifies the Issue a run works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub repository: RepoRef,
    pub issue_id: u64,
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.issue_id)
    }
}

/// The Issue being worked on. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    issue_id: u64,
    title: String,
    body: String,
    repository: RepoRef,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        repository: RepoRef,
        issue_id: u64,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            issue_id,
            title: title.into(),
            body: body.into(),
            repository,
            created_at,
        }
    }

    pub fn issue_id(&self) -> u64 {
        self.issue_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn repository(&self) -> &RepoRef {
        &self.repository
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            repository: self.repository.clone(),
            issue_id: self.issue_id,
        }
    }

    /// Title and body joined, as used for ranking repository files.
    pub fn issue_text(&self) -> String {
        format!("{}\n{}", self.title, self.body).trim().to_string()
    }
}

/// Final outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    /// The patch landed in a commit.
    Applied,
    /// The model answered, but its output could not be turned into a commit.
    Rejected,
    /// The attempt failed before a usable model answer existed.
    Error,
}

impl AttemptOutcome {
    /// Classifies a failure: patch-level problems reject, everything else errors.
    pub fn for_error(error: &Error) -> Self {
        match error {
            Error::UnparsablePatch(_) | Error::ApplyConflict { .. } => AttemptOutcome::Rejected,
            _ => AttemptOutcome::Error,
        }
    }
}

/// Error recorded on an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: String,
    pub message: String,
}

/// A finalized attempt. Retained for audit and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    number: u32,
    task_ref: TaskRef,
    model_request: Option<ModelRequest>,
    model_response: Option<ModelResponse>,
    patch_set: Option<PatchSet>,
    commit: Option<CommitRef>,
    outcome: AttemptOutcome,
    error: Option<AttemptError>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl Attempt {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn task_ref(&self) -> &TaskRef {
        &self.task_ref
    }

    pub fn model_request(&self) -> Option<&ModelRequest> {
        self.model_request.as_ref()
    }

    pub fn model_response(&self) -> Option<&ModelResponse> {
        self.model_response.as_ref()
    }

    pub fn patch_set(&self) -> Option<&PatchSet> {
        self.patch_set.as_ref()
    }

    pub fn commit(&self) -> Option<&CommitRef> {
        self.commit.as_ref()
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    pub fn error(&self) -> Option<&AttemptError> {
        self.error.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}

/// An attempt in progress. Consumed by one of the `finish_*` methods.
#[derive(Debug)]
pub struct PendingAttempt {
    number: u32,
    task_ref: TaskRef,
    model_request: Option<ModelRequest>,
    model_response: Option<ModelResponse>,
    patch_set: Option<PatchSet>,
    started_at: DateTime<Utc>,
}

impl PendingAttempt {
    pub fn start(number: u32, task_ref: TaskRef) -> Self {
        Self {
            number,
            task_ref,
            model_request: None,
            model_response: None,
            patch_set: None,
            started_at: Utc::now(),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn record_request(&mut self, request: ModelRequest) {
        self.model_request = Some(request);
    }

    pub fn record_response(&mut self, response: ModelResponse) {
        self.model_response = Some(response);
    }

    pub fn record_patch(&mut self, patch_set: PatchSet) {
        self.patch_set = Some(patch_set);
    }

    /// Finalizes an attempt whose patch was committed.
    pub fn finish_applied(self, commit: CommitRef) -> Attempt {
        self.finish(AttemptOutcome::Applied, Some(commit), None)
    }

    /// Finalizes an attempt whose model answer asked for no change.
    pub fn finish_no_change(self) -> Attempt {
        let error = AttemptError {
            kind: "no_change_needed".to_string(),
            message: "the model reported that no change is needed".to_string(),
        };
        self.finish(AttemptOutcome::Rejected, None, Some(error))
    }

    /// Finalizes a failed attempt, classifying the error.
    pub fn finish_failed(self, error: &Error) -> Attempt {
        let recorded = AttemptError {
            kind: error.kind().to_string(),
            message: error.to_string(),
        };
        self.finish(AttemptOutcome::for_error(error), None, Some(recorded))
    }

    fn finish(
        self,
        outcome: AttemptOutcome,
        commit: Option<CommitRef>,
        error: Option<AttemptError>,
    ) -> Attempt {
        Attempt {
            number: self.number,
            task_ref: self.task_ref,
            model_request: self.model_request,
            model_response: self.model_response,
            patch_set: self.patch_set,
            commit,
            outcome,
            error,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
