//! In-memory code host.
//!
//! Used by tests and for dry runs. Check runs and reviews are set by the
//! caller; everything the agent writes is recorded for inspection.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};

use super::{CheckRun, CodeHost, Comment, Issue, PullRequestRef, Review};

#[derive(Debug, Default)]
struct State {
    issues: HashMap<u64, Issue>,
    pulls: Vec<(PullRequestRef, String)>,
    comments: HashMap<u64, Vec<Comment>>,
    check_runs: HashMap<String, Vec<CheckRun>>,
    reviews: HashMap<u64, Vec<Review>>,
    next_id: u64,
    unreachable: bool,
    calls: Vec<String>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A [`CodeHost`] that keeps everything in memory.
#[derive(Debug)]
pub struct MemoryHost {
    repo_url: String,
    state: Mutex<State>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new("https://github.com/acme/site")
    }
}

impl MemoryHost {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            state: Mutex::new(State {
                // Leave room below for issue numbers used by tests.
                next_id: 1000,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an Issue.
    pub fn with_issue(self, number: u64, title: &str, body: &str) -> Self {
        self.state().issues.insert(
            number,
            Issue {
                number,
                title: title.to_string(),
                body: body.to_string(),
                created_at: Utc::now(),
            },
        );
        self
    }

    /// Makes `get_repository` fail as if the token had no access.
    pub fn unreachable(self) -> Self {
        self.state().unreachable = true;
        self
    }

    /// Replaces the check runs reported for `sha`.
    pub fn set_check_runs(&self, sha: &str, runs: Vec<CheckRun>) {
        self.state().check_runs.insert(sha.to_string(), runs);
    }

    /// Adds a review to pull request `pull_number`.
    pub fn add_review(&self, pull_number: u64, state: &str, body: &str, commit_id: Option<&str>) {
        let mut guard = self.state();
        let id = guard.next_id();
        guard.reviews.entry(pull_number).or_default().push(Review {
            id,
            state: state.to_string(),
            body: body.to_string(),
            commit_id: commit_id.map(str::to_string),
        });
    }

    /// Comments posted on Issue or pull request `number`.
    pub fn comments(&self, number: u64) -> Vec<Comment> {
        self.state().comments.get(&number).cloned().unwrap_or_default()
    }

    /// Open pull requests with their current bodies.
    pub fn pull_requests(&self) -> Vec<(PullRequestRef, String)> {
        self.state().pulls.clone()
    }

    /// Names of the write operations performed, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl CodeHost for MemoryHost {
    async fn get_repository(&self) -> Result<()> {
        if self.state().unreachable {
            return Err(Error::RepositoryUnreachable(format!(
                "{} (status 404)",
                self.repo_url
            )));
        }
        Ok(())
    }

    async fn get_issue(&self, number: u64) -> Result<Issue> {
        self.state()
            .issues
            .get(&number)
            .cloned()
            .ok_or_else(|| Error::GitHub(format!("issue #{} not found", number)))
    }

    async fn find_open_pull_request(&self, head_branch: &str) -> Result<Option<PullRequestRef>> {
        Ok(self
            .state()
            .pulls
            .iter()
            .map(|(pr, _)| pr)
            .find(|pr| pr.head_branch == head_branch)
            .cloned())
    }

    async fn create_pull_request(
        &self,
        _title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> Result<PullRequestRef> {
        let mut state = self.state();
        if let Some((existing, _)) = state.pulls.iter().find(|(pr, _)| pr.head_branch == head_branch) {
            return Ok(existing.clone());
        }
        let number = state.next_id();
        let pr = PullRequestRef {
            number,
            url: format!("{}/pull/{}", self.repo_url, number),
            head_branch: head_branch.to_string(),
            base_branch: base_branch.to_string(),
        };
        state.pulls.push((pr.clone(), body.to_string()));
        state.calls.push(format!("create_pull_request {}", number));
        Ok(pr)
    }

    async fn update_pull_request(&self, number: u64, body: &str) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .pulls
            .iter_mut()
            .find(|(pr, _)| pr.number == number)
            .ok_or_else(|| Error::GitHub(format!("pull request #{} not found", number)))?;
        entry.1 = body.to_string();
        state.calls.push(format!("update_pull_request {}", number));
        Ok(())
    }

    async fn list_issue_comments(&self, number: u64) -> Result<Vec<Comment>> {
        Ok(self.comments(number))
    }

    async fn create_issue_comment(&self, number: u64, body: &str) -> Result<Comment> {
        let mut state = self.state();
        let comment = Comment {
            id: state.next_id(),
            body: body.to_string(),
        };
        state.comments.entry(number).or_default().push(comment.clone());
        state.calls.push(format!("create_issue_comment {}", number));
        Ok(comment)
    }

    async fn list_check_runs(&self, sha: &str) -> Result<Vec<CheckRun>> {
        Ok(self.state().check_runs.get(sha).cloned().unwrap_or_default())
    }

    async fn list_reviews(&self, pull_number: u64) -> Result<Vec<Review>> {
        Ok(self.state().reviews.get(&pull_number).cloned().unwrap_or_default())
    }
}
