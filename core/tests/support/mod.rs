//! Helpers shared by the integration tests: a throwaway site repository,
//! a controller wired to in-memory collaborators, and YAML scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use code_agent::audit::RunLog;
use code_agent::ci::WatchTarget;
use code_agent::config::{AgentConfig, TuningConfig};
use code_agent::controller::{RunController, RunReport, RunStatus};
use code_agent::events::{CiSignal, ReviewSignal, Signal};
use code_agent::github::{CheckRun, MemoryHost};
use code_agent::model::{ModelClient, ScriptedProvider};
use code_agent::repo::RepoMutator;

pub const OPENROUTER_KEY: &str = "sk-or-test-0123456789abcdef";
pub const GITHUB_TOKEN: &str = "ghs_test0123456789abcdef";

const WAIT: Duration = Duration::from_secs(30);

/// Runs git in `dir` and returns trimmed stdout, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A repository on `main` with a one-line homepage and a README.
pub fn create_site_repo() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    git(dir.path(), &["init", "--quiet"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    git(dir.path(), &["config", "commit.gpgsign", "false"]);
    git(dir.path(), &["checkout", "--quiet", "-b", "main"]);
    fs::write(dir.path().join("index.html"), "<h1>Old</h1>\n").unwrap();
    fs::write(dir.path().join("README.md"), "# Site\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "--quiet", "-m", "Initial commit"]);
    dir
}

/// Commits on `branch` that are not on `main`. Zero when the branch does not exist.
pub fn branch_commit_count(dir: &Path, branch: &str) -> usize {
    let exists = Command::new("git")
        .current_dir(dir)
        .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !exists {
        return 0;
    }
    git(dir, &["rev-list", "--count", &format!("main..{}", branch)])
        .parse()
        .unwrap()
}

/// Content of `path` at the tip of `branch`.
pub fn file_at(dir: &Path, branch: &str, path: &str) -> String {
    let out = Command::new("git")
        .current_dir(dir)
        .args(["show", &format!("{}:{}", branch, path)])
        .output()
        .expect("failed to run git");
    String::from_utf8_lossy(&out.stdout).to_string()
}

/// Tuning with no remote and no waiting.
pub fn fast_tuning(max_attempts: u32) -> TuningConfig {
    let mut tuning = TuningConfig::default();
    tuning.run.max_attempts = max_attempts;
    tuning.run.remote = None;
    tuning.run.lock_timeout_secs = 5;
    tuning
}

pub fn agent_config(workdir: &Path, issue_number: u64, tuning: TuningConfig) -> AgentConfig {
    let vars: HashMap<String, String> = [
        ("OPENROUTER_API_KEY", OPENROUTER_KEY.to_string()),
        ("GITHUB_TOKEN", GITHUB_TOKEN.to_string()),
        ("GITHUB_REPOSITORY", "acme/site".to_string()),
        ("ISSUE_NUMBER", issue_number.to_string()),
        ("MODEL", "test/model".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    AgentConfig::from_vars(&vars, workdir.to_path_buf(), tuning).expect("valid test config")
}

/// A running controller plus handles to everything around it.
pub struct Harness {
    pub repo: TempDir,
    pub logs: TempDir,
    pub host: Arc<MemoryHost>,
    pub provider: Arc<ScriptedProvider>,
    pub cancel: CancellationToken,
    pub signals: mpsc::Sender<Signal>,
    pub head: watch::Receiver<Option<WatchTarget>>,
    pub branch: String,
    run: JoinHandle<RunReport>,
}

impl Harness {
    /// Starts a run for `issue_number` on a fresh site repository.
    pub fn start(
        host: MemoryHost,
        issue_number: u64,
        provider: ScriptedProvider,
        tuning: TuningConfig,
    ) -> Self {
        let repo = create_site_repo();
        let logs = TempDir::new().expect("failed to create temp dir");
        let host = Arc::new(host);
        let provider = Arc::new(provider);

        let config = agent_config(repo.path(), issue_number, tuning);
        let branch = config.branch_name();
        let model = ModelClient::new(provider.clone())
            .with_max_calls_per_model(1)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        let mutator = RepoMutator::from_config(&config).expect("failed to open repo");
        let log = RunLog::create(logs.path()).expect("failed to create run log");

        let (signals, signal_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let controller = RunController::new(config, host.clone(), model, mutator, signal_rx)
            .with_cancellation(cancel.clone())
            .with_run_log(log);
        let head = controller.subscribe_head();
        let run = tokio::spawn(controller.run());

        Self {
            repo,
            logs,
            host,
            provider,
            cancel,
            signals,
            head,
            branch,
            run,
        }
    }

    /// Waits for the controller to publish a head other than `previous`.
    ///
    /// Returns `None` once the run is over.
    pub async fn next_head(&mut self, previous: Option<&str>) -> Option<WatchTarget> {
        let head = &mut self.head;
        let wait = async move {
            loop {
                let current = head.borrow_and_update().clone();
                if let Some(target) = current {
                    if previous != Some(target.sha.as_str()) {
                        return Some(target);
                    }
                }
                if head.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .expect("timed out waiting for a head commit")
    }

    /// Reports a settled CI run for `sha`.
    pub async fn send_checks(&self, sha: &str, checks: Vec<CheckRun>) {
        let _ = self
            .signals
            .send(Signal::Ci(CiSignal {
                head_sha: sha.to_string(),
                checks,
                settled: true,
            }))
            .await;
    }

    /// Waits for the run to end.
    pub async fn report(&mut self) -> RunReport {
        tokio::time::timeout(WAIT, &mut self.run)
            .await
            .expect("run did not finish in time")
            .expect("run task panicked")
    }

    /// Comments the run left on its Issue.
    pub fn issue_comments(&self, issue_number: u64) -> Vec<String> {
        self.host
            .comments(issue_number)
            .into_iter()
            .map(|c| c.body)
            .collect()
    }

    /// The single run directory created under the logs dir.
    pub fn run_dir(&self) -> PathBuf {
        let mut dirs: Vec<PathBuf> = fs::read_dir(self.logs.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(dirs.len(), 1, "expected one run directory");
        dirs.remove(0)
    }
}

pub fn check(name: &str, conclusion: &str, summary: Option<&str>) -> CheckRun {
    CheckRun {
        name: name.to_string(),
        status: "completed".to_string(),
        conclusion: Some(conclusion.to_string()),
        summary: summary.map(str::to_string),
    }
}

/// A heading edit as the model would write it.
pub fn heading_edit(from: &str, to: &str) -> String {
    format!(
        "Updating the heading.\n\n```modify index.html\n<<<<<<< SEARCH\n<h1>{}</h1>\n=======\n<h1>{}</h1>\n>>>>>>> REPLACE\n```\n",
        from, to
    )
}

/// One end-to-end run described in `tests/fixtures/*.yaml`.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub issue: IssueFixture,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Model answers, one per attempt.
    pub replies: Vec<String>,
    /// Feedback sent for each published head commit, in order.
    #[serde(default)]
    pub feedback: Vec<FeedbackStep>,
    pub expect: Expectation,
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
pub struct IssueFixture {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// Either settled check runs or a review.
#[derive(Debug, Deserialize)]
pub struct FeedbackStep {
    #[serde(default)]
    pub checks: Option<Vec<CheckRun>>,
    #[serde(default)]
    pub review: Option<ReviewFixture>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewFixture {
    pub state: String,
    #[serde(default)]
    pub body: String,
}

impl FeedbackStep {
    pub fn signal(&self, head_sha: &str) -> Signal {
        match &self.review {
            Some(review) => Signal::Review(ReviewSignal {
                head_sha: Some(head_sha.to_string()),
                state: review.state.clone(),
                body: review.body.clone(),
            }),
            None => Signal::Ci(CiSignal {
                head_sha: head_sha.to_string(),
                checks: self.checks.clone().unwrap_or_default(),
                settled: true,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Expectation {
    pub status: RunStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub attempts: usize,
    pub commits: usize,
    #[serde(default)]
    pub pull_requests: usize,
    /// Expected file contents at the tip of the run branch.
    #[serde(default)]
    pub files: HashMap<String, String>,
    /// Text each attempt's prompt must contain, by attempt.
    #[serde(default)]
    pub prompt_mentions: Vec<Vec<String>>,
}

pub fn load_scenario(name: &str) -> Scenario {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    let text = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
    serde_yaml::from_str(&text).unwrap_or_else(|e| panic!("invalid scenario {}: {}", name, e))
}

/// Runs a scenario to completion, feeding one feedback step per head commit.
pub async fn play(scenario: &Scenario) -> (Harness, RunReport) {
    let host = MemoryHost::default().with_issue(
        scenario.issue.number,
        &scenario.issue.title,
        &scenario.issue.body,
    );
    let provider = ScriptedProvider::from_texts(scenario.replies.clone());
    let mut harness = Harness::start(
        host,
        scenario.issue.number,
        provider,
        fast_tuning(scenario.max_attempts),
    );

    let mut previous: Option<String> = None;
    for step in &scenario.feedback {
        let Some(target) = harness.next_head(previous.as_deref()).await else {
            break;
        };
        let _ = harness.signals.send(step.signal(&target.sha)).await;
        previous = Some(target.sha);
    }

    let report = harness.report().await;
    (harness, report)
}

/// Checks a finished run against the scenario's expectations.
pub fn verify(harness: &Harness, report: &RunReport, expect: &Expectation) {
    assert_eq!(report.status, expect.status, "final status");
    let reason = report
        .reason
        .as_ref()
        .map(|r| serde_json::to_value(r).unwrap()["reason"].as_str().unwrap().to_string());
    assert_eq!(reason, expect.reason, "abandon reason");
    assert_eq!(report.attempts.len(), expect.attempts, "attempts");
    assert_eq!(
        branch_commit_count(harness.repo.path(), &harness.branch),
        expect.commits,
        "commits on the run branch"
    );
    assert_eq!(
        harness.host.pull_requests().len(),
        expect.pull_requests,
        "pull requests"
    );

    for (path, content) in &expect.files {
        assert_eq!(
            &file_at(harness.repo.path(), &harness.branch, path),
            content,
            "content of {}",
            path
        );
    }

    let requests = harness.provider.requests();
    for (index, mentions) in expect.prompt_mentions.iter().enumerate() {
        let prompt = &requests[index].prompt_text;
        for needle in mentions {
            assert!(
                prompt.contains(needle.as_str()),
                "prompt {} is missing {:?}",
                index + 1,
                needle
            );
        }
    }
}
