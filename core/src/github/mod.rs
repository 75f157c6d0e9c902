//! Code host access.
//!
//! [`CodeHost`] is the narrow slice of the GitHub REST API the agent needs.
//! [`GitHubClient`] implements it over reqwest; [`MemoryHost`] keeps
//! everything in memory for tests and offline runs.

mod client;
pub mod memory;

pub use client::GitHubClient;
pub use memory::MemoryHost;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An Issue as read from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// An open pull request for the run branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
    pub base_branch: String,
}

/// A comment on an Issue or pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

/// One CI check run reported for a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    /// `queued`, `in_progress` or `completed`.
    pub status: String,
    /// Set once completed: `success`, `failure`, `neutral`, `cancelled`,
    /// `skipped`, `timed_out` or `action_required`.
    pub conclusion: Option<String>,
    pub summary: Option<String>,
}

/// A pull request review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: u64,
    /// `APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`, ...
    pub state: String,
    pub body: String,
    pub commit_id: Option<String>,
}

/// Operations the agent performs against the code host.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Checks the repository is reachable with the configured credentials.
    async fn get_repository(&self) -> Result<()>;

    async fn get_issue(&self, number: u64) -> Result<Issue>;

    /// Finds the open pull request whose head is `head_branch`.
    async fn find_open_pull_request(&self, head_branch: &str) -> Result<Option<PullRequestRef>>;

    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> Result<PullRequestRef>;

    async fn update_pull_request(&self, number: u64, body: &str) -> Result<()>;

    /// Comments on an Issue or pull request (pull requests share the Issue number space).
    async fn list_issue_comments(&self, number: u64) -> Result<Vec<Comment>>;

    async fn create_issue_comment(&self, number: u64, body: &str) -> Result<Comment>;

    /// Check runs reported for commit `sha`.
    async fn list_check_runs(&self, sha: &str) -> Result<Vec<CheckRun>>;

    async fn list_reviews(&self, pull_number: u64) -> Result<Vec<Review>>;
}
