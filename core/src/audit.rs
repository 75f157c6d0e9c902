//! Per-run audit log.
//!
//! Each run gets `<logs_dir>/<run_id>/` holding `state.json` (rewritten on
//! every status change) and `attempts.jsonl` (one finalized attempt per
//! line).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::state::{AbandonReason, RunState};
use crate::error::{Error, Result};
use crate::github::PullRequestRef;
use crate::task::Attempt;

#[derive(Debug, Serialize)]
struct StateSnapshot<'a> {
    run_id: &'a str,
    state: &'a RunState,
    pull_request: Option<&'a PullRequestRef>,
    reason: Option<&'a AbandonReason>,
    updated_at: DateTime<Utc>,
}

/// Writes the audit trail of one run.
#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: String,
    dir: PathBuf,
}

impl RunLog {
    /// Creates a fresh run directory under `logs_dir`.
    pub fn create(logs_dir: &Path) -> Result<Self> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let dir = logs_dir.join(&run_id);
        fs::create_dir_all(&dir)?;
        tracing::info!(run_id = %run_id, dir = ?dir, "audit log created");
        Ok(Self { run_id, dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn attempts_path(&self) -> PathBuf {
        self.dir.join("attempts.jsonl")
    }

    /// Rewrites `state.json`.
    pub fn write_state(
        &self,
        state: &RunState,
        pull_request: Option<&PullRequestRef>,
        reason: Option<&AbandonReason>,
    ) -> Result<()> {
        let snapshot = StateSnapshot {
            run_id: &self.run_id,
            state,
            pull_request,
            reason,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Config(format!("failed to serialize run state: {}", e)))?;
        // Write then rename so readers never see a half-written file.
        let tmp = self.dir.join("state.json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.state_path())?;
        Ok(())
    }

    /// Appends one attempt to `attempts.jsonl`.
    pub fn append_attempt(&self, attempt: &Attempt) -> Result<()> {
        let line = serde_json::to_string(attempt)
            .map_err(|e| Error::Config(format!("failed to serialize attempt: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.attempts_path())?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}
