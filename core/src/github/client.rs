//! GitHub REST client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::backoff::ExponentialBackoff;
use crate::config::{AgentConfig, RepoRef};
use crate::error::{Error, Result};
use crate::secrets::Secret;

use super::{CheckRun, CodeHost, Comment, Issue, PullRequestRef, Review};

const API_VERSION: &str = "2022-11-28";
const PER_PAGE: usize = 100;
const MAX_ATTEMPTS: u32 = 4;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_CHARS: usize = 800;

/// Failure of a single API call, before it is mapped to [`Error`].
#[derive(Debug)]
enum ApiError {
    Status { status: u16, body: String },
    Transport(String),
    Decode(String),
}

impl ApiError {
    fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn into_error(self, operation: &str) -> Error {
        match self {
            ApiError::Status { status, body } => Error::GitHub(format!(
                "{} failed with status {}: {}",
                operation,
                status,
                truncate(&body, ERROR_BODY_CHARS)
            )),
            ApiError::Transport(message) => {
                Error::GitHub(format!("{} request failed: {}", operation, message))
            }
            ApiError::Decode(message) => {
                Error::GitHub(format!("failed to decode {}: {}", operation, message))
            }
        }
    }
}

/// Whether a failed status is worth another try.
///
/// A 403 is only retried when GitHub says when to come back, which is how
/// secondary rate limits are reported.
fn is_retryable_status(status: u16, retry_after: Option<Duration>) -> bool {
    status == 429 || status >= 500 || (status == 403 && retry_after.is_some())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BranchPayload {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullPayload {
    number: u64,
    html_url: String,
    head: BranchPayload,
    base: BranchPayload,
}

impl From<PullPayload> for PullRequestRef {
    fn from(pull: PullPayload) -> Self {
        PullRequestRef {
            number: pull.number,
            url: pull.html_url,
            head_branch: pull.head.name,
            base_branch: pull.base.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    id: u64,
    #[serde(default)]
    body: Option<String>,
}

impl From<CommentPayload> for Comment {
    fn from(comment: CommentPayload) -> Self {
        Comment {
            id: comment.id,
            body: comment.body.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunsPayload {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    check_runs: Vec<CheckRunPayload>,
}

#[derive(Debug, Deserialize)]
struct CheckRunPayload {
    name: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    output: Option<CheckOutputPayload>,
}

#[derive(Debug, Deserialize)]
struct CheckOutputPayload {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

impl From<CheckRunPayload> for CheckRun {
    fn from(run: CheckRunPayload) -> Self {
        let summary = run.output.and_then(|o| match (o.title, o.summary) {
            (Some(title), Some(summary)) if !summary.is_empty() => {
                Some(format!("{}: {}", title, summary))
            }
            (_, Some(summary)) if !summary.is_empty() => Some(summary),
            (title, _) => title.filter(|t| !t.is_empty()),
        });
        CheckRun {
            name: run.name,
            status: run.status,
            conclusion: run.conclusion,
            summary,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReviewPayload {
    id: u64,
    state: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    commit_id: Option<String>,
}

impl From<ReviewPayload> for Review {
    fn from(review: ReviewPayload) -> Self {
        Review {
            id: review.id,
            state: review.state,
            body: review.body.unwrap_or_default(),
            commit_id: review.commit_id,
        }
    }
}

/// [`CodeHost`] over the GitHub REST API.
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: &Secret, repo: RepoRef) -> Result<Self> {
        Self::with_builder(api_base, token, repo, reqwest::Client::builder())
    }

    fn with_builder(
        api_base: &str,
        token: &Secret,
        repo: RepoRef,
        builder: reqwest::ClientBuilder,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("code-agent/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.expose().trim()))
            .map_err(|_| Error::Config(format!("{} is not a valid header value", token.name())))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = builder
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build GitHub client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::new(
            &config.github_api_url,
            &config.github_token,
            config.repository.clone(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.api_base, self.repo.owner, self.repo.name, path
        )
    }

    /// Sends a request, retrying rate limits, server errors and transport
    /// failures with backoff, and decodes the JSON body.
    async fn request_json<T, F>(&self, operation: &str, mut build: F) -> std::result::Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: FnMut() -> RequestBuilder,
    {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .map_err(|e| ApiError::Decode(e.without_url().to_string()));
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < MAX_ATTEMPTS && is_retryable_status(status.as_u16(), retry_after) {
                        let delay = backoff.step_with_hint(retry_after);
                        tracing::warn!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "GitHub request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect() || e.is_request();
                    if attempt < MAX_ATTEMPTS && retryable {
                        let delay = backoff.step();
                        tracing::warn!(
                            operation,
                            attempt,
                            error = %e.without_url(),
                            "GitHub transport error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(ApiError::Transport(e.without_url().to_string()));
                }
            }
        }
    }

    async fn fetch_pulls(&self, head_branch: &str) -> Result<Vec<PullPayload>> {
        let head = format!("{}:{}", self.repo.owner, head_branch);
        let url = self.url("/pulls");
        self.request_json("list pull requests", || {
            self.http
                .get(&url)
                .query(&[("state", "open"), ("head", head.as_str())])
        })
        .await
        .map_err(|e| e.into_error("list pull requests"))
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn get_repository(&self) -> Result<()> {
        let url = self.url("");
        match self
            .request_json::<serde_json::Value, _>("get repository", || self.http.get(&url))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.status(), Some(401 | 403 | 404)) => {
                Err(Error::RepositoryUnreachable(format!(
                    "{} (status {})",
                    self.repo,
                    e.status().unwrap_or_default()
                )))
            }
            Err(ApiError::Transport(message)) => Err(Error::RepositoryUnreachable(format!(
                "{}: {}",
                self.repo, message
            ))),
            Err(e) => Err(e.into_error("get repository")),
        }
    }

    async fn get_issue(&self, number: u64) -> Result<Issue> {
        let url = self.url(&format!("/issues/{}", number));
        let issue: IssuePayload = self
            .request_json("get issue", || self.http.get(&url))
            .await
            .map_err(|e| match e.status() {
                Some(404) | Some(410) => {
                    Error::GitHub(format!("issue #{} not found in {}", number, self.repo))
                }
                _ => e.into_error("get issue"),
            })?;

        if issue.pull_request.is_some() {
            return Err(Error::Config(format!(
                "#{} is a pull request, not an issue",
                number
            )));
        }

        Ok(Issue {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            created_at: issue.created_at,
        })
    }

    async fn find_open_pull_request(&self, head_branch: &str) -> Result<Option<PullRequestRef>> {
        let pulls = self.fetch_pulls(head_branch).await?;
        Ok(pulls
            .into_iter()
            .map(PullRequestRef::from)
            .find(|pr| pr.head_branch == head_branch))
    }

    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> Result<PullRequestRef> {
        let url = self.url("/pulls");
        let payload = json!({
            "title": title,
            "body": body,
            "head": head_branch,
            "base": base_branch,
        });
        let created = self
            .request_json::<PullPayload, _>("create pull request", || {
                self.http.post(&url).json(&payload)
            })
            .await;

        match created {
            Ok(pull) => Ok(pull.into()),
            // Another run opened it between our lookup and the create.
            Err(e) if e.status() == Some(StatusCode::UNPROCESSABLE_ENTITY.as_u16()) => {
                match self.find_open_pull_request(head_branch).await? {
                    Some(existing) => Ok(existing),
                    None => Err(e.into_error("create pull request")),
                }
            }
            Err(e) => Err(e.into_error("create pull request")),
        }
    }

    async fn update_pull_request(&self, number: u64, body: &str) -> Result<()> {
        let url = self.url(&format!("/pulls/{}", number));
        let payload = json!({ "body": body });
        self.request_json::<serde_json::Value, _>("update pull request", || {
            self.http.patch(&url).json(&payload)
        })
        .await
        .map_err(|e| e.into_error("update pull request"))?;
        Ok(())
    }

    async fn list_issue_comments(&self, number: u64) -> Result<Vec<Comment>> {
        let url = self.url(&format!("/issues/{}/comments", number));
        let mut comments = Vec::new();
        let mut page = 1_u32;
        loop {
            let page_param = page.to_string();
            let chunk: Vec<CommentPayload> = self
                .request_json("list issue comments", || {
                    self.http.get(&url).query(&[
                        ("per_page", "100"),
                        ("page", page_param.as_str()),
                    ])
                })
                .await
                .map_err(|e| e.into_error("list issue comments"))?;
            let len = chunk.len();
            comments.extend(chunk.into_iter().map(Comment::from));
            if len < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(comments)
    }

    async fn create_issue_comment(&self, number: u64, body: &str) -> Result<Comment> {
        let url = self.url(&format!("/issues/{}/comments", number));
        let payload = json!({ "body": body });
        let comment: CommentPayload = self
            .request_json("create issue comment", || self.http.post(&url).json(&payload))
            .await
            .map_err(|e| e.into_error("create issue comment"))?;
        Ok(comment.into())
    }

    async fn list_check_runs(&self, sha: &str) -> Result<Vec<CheckRun>> {
        let url = self.url(&format!("/commits/{}/check-runs", sha));
        let mut runs = Vec::new();
        let mut page = 1_u32;
        loop {
            let page_param = page.to_string();
            let chunk: CheckRunsPayload = self
                .request_json("list check runs", || {
                    self.http.get(&url).query(&[
                        ("per_page", "100"),
                        ("page", page_param.as_str()),
                    ])
                })
                .await
                .map_err(|e| e.into_error("list check runs"))?;
            let len = chunk.check_runs.len();
            runs.extend(chunk.check_runs.into_iter().map(CheckRun::from));
            if len < PER_PAGE || runs.len() >= chunk.total_count {
                break;
            }
            page += 1;
        }
        Ok(runs)
    }

    async fn list_reviews(&self, pull_number: u64) -> Result<Vec<Review>> {
        let url = self.url(&format!("/pulls/{}/reviews", pull_number));
        let reviews: Vec<ReviewPayload> = self
            .request_json("list reviews", || {
                self.http.get(&url).query(&[("per_page", "100")])
            })
            .await
            .map_err(|e| e.into_error("list reviews"))?;
        Ok(reviews.into_iter().map(Review::from).collect())
    }
}
