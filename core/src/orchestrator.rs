//! Pull request management and feedback normalization.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::events::{RunEvent, Signal};
use crate::github::{CheckRun, CodeHost, PullRequestRef};
use crate::patch::content_digest;
use crate::repo::{CommitRef, FileChange};
use crate::task::Task;

/// GitHub rejects bodies above 65 536 characters.
pub const PR_BODY_MAX_CHARS: usize = 65_000;

const STATUS_MARKER_PREFIX: &str = "<!-- code-agent:status";

/// Check conclusions that fail the run.
const FAILING_CONCLUSIONS: &[&str] = &["failure", "timed_out", "cancelled", "action_required"];

/// Per-check summary cap in feedback.
const CHECK_SUMMARY_CHARS: usize = 2_000;

/// What the branch contains, for the pull request body.
#[derive(Debug, Clone, Default)]
pub struct BranchSummary {
    /// (hash, subject) pairs.
    pub commits: Vec<(String, String)>,
    pub files: Vec<FileChange>,
}

/// Hidden marker identifying one status comment.
pub fn status_marker(attempt: u32, message: &str) -> String {
    format!(
        "{} attempt={} digest={} -->",
        STATUS_MARKER_PREFIX,
        attempt,
        content_digest(message)
    )
}

pub fn pull_request_title(task: &Task) -> String {
    format!("Auto-fix for issue #{}: {}", task.issue_id(), task.title().trim())
}

/// Renders the pull request body, capped at [`PR_BODY_MAX_CHARS`].
pub fn pull_request_body(
    task: &Task,
    attempt: u32,
    commit: &CommitRef,
    summary: &BranchSummary,
) -> String {
    let mut body = String::new();

    body.push_str("## Summary\n\n");
    body.push_str(&format!(
        "Automated change for #{}: {}\n\n",
        task.issue_id(),
        task.title().trim()
    ));
    body.push_str(&format!("**Attempt:** {}\n", attempt));
    body.push_str(&format!("**Head:** `{}`\n\n", short_sha(&commit.sha)));

    if !summary.commits.is_empty() {
        body.push_str(&format!("## Commits ({})\n\n", summary.commits.len()));
        body.push_str("| Hash | Message |\n");
        body.push_str("|------|--------|\n");
        for (hash, message) in &summary.commits {
            body.push_str(&format!("| `{}` | {} |\n", short_sha(hash), message));
        }
        body.push('\n');
    }

    if !summary.files.is_empty() {
        body.push_str(&format!("## Files Changed ({})\n\n", summary.files.len()));
        for file in &summary.files {
            body.push_str(&format!(
                "- `{}` (+{}, -{})\n",
                file.path.display(),
                file.additions,
                file.deletions
            ));
        }
        body.push('\n');
    } else if !commit.paths.is_empty() {
        body.push_str(&format!("## Files Changed ({})\n\n", commit.paths.len()));
        for path in &commit.paths {
            body.push_str(&format!("- `{}`\n", path.display()));
        }
        body.push('\n');
    }

    if !task.body().trim().is_empty() {
        body.push_str("<details>\n<summary>Issue</summary>\n\n");
        body.push_str(task.body().trim());
        body.push_str("\n\n</details>\n\n");
    }

    let footer = format!(
        "---\nCloses #{}\n*Created by code-agent*\n",
        task.issue_id()
    );
    cap_with_footer(body, &footer, PR_BODY_MAX_CHARS)
}

/// Cuts `body` so that `body + footer` fits in `max_chars`; the footer is always kept.
fn cap_with_footer(body: String, footer: &str, max_chars: usize) -> String {
    const CUT: &str = "\n\n*[... truncated ...]*\n\n";
    let footer_len = footer.chars().count();
    if body.chars().count() + footer_len <= max_chars {
        return body + footer;
    }
    let keep = max_chars.saturating_sub(footer_len + CUT.chars().count());
    let mut out: String = body.chars().take(keep).collect();
    out.push_str(CUT);
    out.push_str(footer);
    out
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn is_failing(check: &CheckRun) -> bool {
    check
        .conclusion
        .as_deref()
        .is_some_and(|c| FAILING_CONCLUSIONS.contains(&c))
}

fn is_settled(check: &CheckRun) -> bool {
    check.status == "completed" && check.conclusion.is_some()
}

fn ci_feedback(head_sha: &str, failing: &[&CheckRun]) -> String {
    let mut feedback = format!("CI failed for commit {}:\n", short_sha(head_sha));
    for check in failing {
        feedback.push_str(&format!(
            "- {}: {}\n",
            check.name,
            check.conclusion.as_deref().unwrap_or("failure")
        ));
        if let Some(summary) = check.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            for line in truncate(summary, CHECK_SUMMARY_CHARS).lines() {
                feedback.push_str("  ");
                feedback.push_str(line);
                feedback.push('\n');
            }
        }
    }
    feedback
}

/// Opens and updates the run's pull request, posts status comments and
/// normalizes feedback signals.
pub struct PrOrchestrator {
    host: Arc<dyn CodeHost>,
    issue_number: u64,
    branch: String,
    base_branch: String,
    pull_request: Option<PullRequestRef>,
    posted: HashSet<String>,
}

impl PrOrchestrator {
    pub fn new(
        host: Arc<dyn CodeHost>,
        issue_number: u64,
        branch: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            host,
            issue_number,
            branch: branch.into(),
            base_branch: base_branch.into(),
            pull_request: None,
            posted: HashSet::new(),
        }
    }

    pub fn pull_request(&self) -> Option<&PullRequestRef> {
        self.pull_request.as_ref()
    }

    /// Looks up an open pull request left by an earlier run of the same Issue.
    pub async fn discover(&mut self) -> Result<Option<&PullRequestRef>> {
        if self.pull_request.is_none() {
            self.pull_request = self.host.find_open_pull_request(&self.branch).await?;
            if let Some(pr) = &self.pull_request {
                tracing::info!(pr = pr.number, branch = %self.branch, "found existing pull request");
            }
        }
        Ok(self.pull_request.as_ref())
    }

    /// Creates the pull request for the run branch, or refreshes the body of
    /// the one already open.
    pub async fn open_or_update(
        &mut self,
        task: &Task,
        commit: &CommitRef,
        attempt: u32,
        summary: &BranchSummary,
    ) -> Result<PullRequestRef> {
        let body = pull_request_body(task, attempt, commit, summary);

        let existing = match self.pull_request.clone() {
            Some(pr) => Some(pr),
            None => self.host.find_open_pull_request(&self.branch).await?,
        };

        let pr = match existing {
            Some(pr) => {
                self.host.update_pull_request(pr.number, &body).await?;
                tracing::info!(pr = pr.number, attempt, "updated pull request");
                pr
            }
            None => {
                let pr = self
                    .host
                    .create_pull_request(
                        &pull_request_title(task),
                        &body,
                        &self.branch,
                        &self.base_branch,
                    )
                    .await?;
                tracing::info!(pr = pr.number, url = %pr.url, attempt, "opened pull request");
                pr
            }
        };

        self.pull_request = Some(pr.clone());
        Ok(pr)
    }

    /// Posts a status comment unless one with the same marker already exists.
    ///
    /// Returns true when a comment was posted. Targets the pull request if
    /// one is open, otherwise the Issue.
    pub async fn post_status(&mut self, attempt: u32, message: &str) -> Result<bool> {
        let marker = status_marker(attempt, message);
        let target = self
            .pull_request
            .as_ref()
            .map(|pr| pr.number)
            .unwrap_or(self.issue_number);

        if self.posted.contains(&marker) {
            tracing::debug!(attempt, target, "status already posted (cached)");
            return Ok(false);
        }

        let existing = self.host.list_issue_comments(target).await?;
        if existing.iter().any(|c| c.body.contains(&marker)) {
            tracing::debug!(attempt, target, "status already posted");
            self.posted.insert(marker);
            return Ok(false);
        }

        let body = format!("{}\n\n{}", message.trim(), marker);
        self.host.create_issue_comment(target, &body).await?;
        tracing::info!(attempt, target, "posted status comment");
        self.posted.insert(marker);
        Ok(true)
    }

    /// Normalizes a CI or review callback.
    pub fn on_signal(&self, signal: Signal) -> RunEvent {
        let event = match signal {
            Signal::Ci(ci) => {
                let failing: Vec<&CheckRun> = ci.checks.iter().filter(|c| is_failing(c)).collect();
                if !failing.is_empty() {
                    RunEvent::CiFailed {
                        feedback: ci_feedback(&ci.head_sha, &failing),
                    }
                } else if ci.settled && ci.checks.iter().all(is_settled) {
                    RunEvent::CiPassed
                } else {
                    RunEvent::CiPending
                }
            }
            Signal::Review(review) => {
                if review.state.eq_ignore_ascii_case("changes_requested") {
                    let body = review.body.trim();
                    RunEvent::ChangesRequested {
                        feedback: if body.is_empty() {
                            "A reviewer requested changes.".to_string()
                        } else {
                            format!("A reviewer requested changes:\n{}", body)
                        },
                    }
                } else {
                    RunEvent::Noted
                }
            }
        };
        tracing::debug!(event = event.name(), "normalized signal");
        event
    }
}
