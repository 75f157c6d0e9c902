//! Run controller.
//!
//! Drives one Issue from intake to a terminal state: builds the prompt,
//! calls the model, applies the patch, opens the pull request and then
//! waits for CI and review feedback, starting a new attempt on failure
//! until the attempt budget runs out.

pub mod state;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::RunLog;
use crate::ci::WatchTarget;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::events::{RunEvent, Signal};
use crate::github::{CodeHost, PullRequestRef};
use crate::model::{ModelClient, ModelRequest};
use crate::orchestrator::{BranchSummary, PrOrchestrator};
use crate::patch::PatchSynthesizer;
use crate::prompt::{select_context, PromptBuilder, SYSTEM_INSTRUCTION};
use crate::repo::{CommitRef, RepoMutator};
use crate::secrets::Redactor;
use crate::task::{Attempt, PendingAttempt, Task, TaskRef};

pub use state::{AbandonReason, RunState, RunStatus};

/// Exit code for setup failures (credentials, repository access, config).
pub const EXIT_SETUP_FAILURE: i32 = 2;

/// Exit code for runs stopped by an error no attempt could fix.
pub const EXIT_UNRECOVERABLE: i32 = 1;

/// How a run ended.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Option<String>,
    pub task_ref: TaskRef,
    pub status: RunStatus,
    pub attempts: Vec<Attempt>,
    pub pull_request: Option<PullRequestRef>,
    pub reason: Option<AbandonReason>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::CiPassed
    }

    /// Process exit code: 0 for `ci_passed` and controlled abandonment.
    pub fn exit_code(&self) -> i32 {
        match self.reason {
            Some(AbandonReason::SetupFailed(_)) => EXIT_SETUP_FAILURE,
            Some(AbandonReason::Unrecoverable(_)) => EXIT_UNRECOVERABLE,
            _ => 0,
        }
    }
}

/// Result of one attempt that did not fail.
enum Step {
    Opened {
        commit: CommitRef,
        pr: PullRequestRef,
    },
    NoChange,
}

/// What CI and reviewers said about a head commit.
enum Verdict {
    Passed,
    Failed(String),
    Interrupted(AbandonReason),
}

enum Ending {
    Passed,
    Abandoned(AbandonReason),
}

/// Runs blocking repository work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Git(format!("repository task failed: {}", e)))?
}

/// Owns the [`RunState`] of one Issue and drives it to a terminal state.
pub struct RunController {
    config: AgentConfig,
    host: Arc<dyn CodeHost>,
    model: ModelClient,
    repo: RepoMutator,
    prompts: PromptBuilder,
    synthesizer: PatchSynthesizer,
    orchestrator: PrOrchestrator,
    signals: mpsc::Receiver<Signal>,
    head: watch::Sender<Option<WatchTarget>>,
    cancel: CancellationToken,
    log: Option<RunLog>,
    redactor: Redactor,
    state: RunState,
    attempts: Vec<Attempt>,
    deadline: Instant,
}

impl RunController {
    /// Creates a controller. Feedback arrives on `signals`; whoever produces
    /// it learns the commit to watch through [`RunController::subscribe_head`].
    pub fn new(
        config: AgentConfig,
        host: Arc<dyn CodeHost>,
        model: ModelClient,
        repo: RepoMutator,
        signals: mpsc::Receiver<Signal>,
    ) -> Self {
        let task_ref = TaskRef {
            repository: config.repository.clone(),
            issue_id: config.issue_number,
        };
        let orchestrator = PrOrchestrator::new(
            host.clone(),
            config.issue_number,
            config.branch_name(),
            config.base_branch.clone(),
        );
        let (head, _) = watch::channel(None);
        let redactor = Redactor::with_secrets(config.secrets());

        Self {
            prompts: PromptBuilder::from_settings(&config.tuning.prompt),
            synthesizer: PatchSynthesizer::new(),
            model: model.with_redactor(redactor.clone()),
            redactor,
            state: RunState::new(task_ref, config.tuning.run.max_attempts),
            deadline: Instant::now() + config.tuning.run.run_deadline(),
            attempts: Vec::new(),
            cancel: CancellationToken::new(),
            log: None,
            config,
            host,
            repo,
            orchestrator,
            signals,
            head,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Receiver for the commit the controller is currently waiting on.
    pub fn subscribe_head(&self) -> watch::Receiver<Option<WatchTarget>> {
        self.head.subscribe()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Runs to a terminal state. Never fails: errors end the run as `abandoned`.
    pub async fn run(mut self) -> RunReport {
        self.deadline = Instant::now() + self.config.tuning.run.run_deadline();
        tracing::info!(
            task = %self.state.task_ref(),
            max_attempts = self.state.max_attempts(),
            "starting run"
        );

        let task = match self.intake().await {
            Ok(task) => task,
            Err(Error::Cancelled) => {
                let reason = self.interruption();
                return self.finish(Ending::Abandoned(reason)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "run setup failed");
                let detail = self.redactor.redact(&e.to_string());
                return self
                    .finish(Ending::Abandoned(AbandonReason::SetupFailed(detail)))
                    .await;
            }
        };

        let ending = match self.drive(&task).await {
            Ok(ending) => ending,
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "run failed");
                Ending::Abandoned(AbandonReason::Unrecoverable(
                    self.redactor.redact(&e.to_string()),
                ))
            }
        };
        self.finish(ending).await
    }

    /// Checks repository access and reads the Issue.
    async fn intake(&mut self) -> Result<Task> {
        self.guarded(self.host.get_repository()).await?;
        let issue = self
            .guarded(self.host.get_issue(self.config.issue_number))
            .await?;
        if let Err(e) = self.orchestrator.discover().await {
            tracing::warn!(error = %e, "failed to look up an existing pull request");
        }

        tracing::info!(issue = issue.number, title = %issue.title, "read issue");
        Ok(Task::new(
            self.config.repository.clone(),
            issue.number,
            issue.title,
            issue.body,
            issue.created_at,
        ))
    }

    async fn drive(&mut self, task: &Task) -> Result<Ending> {
        self.transition(RunStatus::InProgress)?;
        let mut feedback: Option<String> = None;

        loop {
            let number = self.state.begin_attempt()?;
            let (attempt, step) = self.attempt(task, number, feedback.take()).await;
            self.record(attempt);

            match step {
                Ok(Step::NoChange) => {
                    tracing::info!(attempt = number, "model reported no change needed");
                    return Ok(Ending::Abandoned(AbandonReason::NoChangeNeeded));
                }
                Err(Error::Cancelled) => return Ok(Ending::Abandoned(self.interruption())),
                Err(e) if e.is_recoverable() => {
                    let message = self.redactor.redact(&e.to_string());
                    tracing::warn!(attempt = number, kind = e.kind(), error = %message, "attempt failed");
                    self.post_status(
                        number,
                        &format!(
                            "Attempt {} of {} failed ({}): {}",
                            number,
                            self.state.max_attempts(),
                            e.kind(),
                            message
                        ),
                    )
                    .await;
                    if !self.state.can_retry() {
                        return Ok(Ending::Abandoned(AbandonReason::RetriesExhausted));
                    }
                    self.transition(RunStatus::InProgress)?;
                    feedback = Some(format!(
                        "The previous attempt could not be used: {}",
                        message
                    ));
                }
                Err(e) => {
                    tracing::error!(attempt = number, kind = e.kind(), error = %e, "attempt failed");
                    return Ok(Ending::Abandoned(AbandonReason::Unrecoverable(
                        self.redactor.redact(&e.to_string()),
                    )));
                }
                Ok(Step::Opened { commit, pr }) => {
                    self.transition(RunStatus::PrOpen)?;
                    self.post_status(
                        number,
                        &format!(
                            "Attempt {} pushed `{}` to `{}` ({}). Waiting for CI.",
                            number, commit.sha, commit.branch, pr.url
                        ),
                    )
                    .await;

                    match self.await_verdict(&commit, &pr).await {
                        Verdict::Passed => {
                            self.transition(RunStatus::CiPassed)?;
                            self.post_status(
                                number,
                                &format!("CI passed for `{}`. The pull request is ready for review.", commit.sha),
                            )
                            .await;
                            return Ok(Ending::Passed);
                        }
                        Verdict::Failed(ci_feedback) => {
                            self.transition(RunStatus::CiFailed)?;
                            if !self.state.can_retry() {
                                return Ok(Ending::Abandoned(AbandonReason::RetriesExhausted));
                            }
                            self.post_status(
                                number,
                                &format!(
                                    "Feedback on attempt {} asks for changes, starting attempt {}.",
                                    number,
                                    number + 1
                                ),
                            )
                            .await;
                            self.transition(RunStatus::InProgress)?;
                            feedback = Some(ci_feedback);
                        }
                        Verdict::Interrupted(reason) => return Ok(Ending::Abandoned(reason)),
                    }
                }
            }
        }
    }

    /// Runs one attempt and freezes its record.
    async fn attempt(
        &mut self,
        task: &Task,
        number: u32,
        feedback: Option<String>,
    ) -> (Attempt, Result<Step>) {
        let mut pending = PendingAttempt::start(number, task.task_ref());
        let result = self
            .execute(&mut pending, task, number, feedback.as_deref())
            .await;
        let attempt = match &result {
            Ok(Step::Opened { commit, .. }) => pending.finish_applied(commit.clone()),
            Ok(Step::NoChange) => pending.finish_no_change(),
            Err(e) => pending.finish_failed(e),
        };
        (attempt, result)
    }

    async fn execute(
        &mut self,
        pending: &mut PendingAttempt,
        task: &Task,
        number: u32,
        feedback: Option<&str>,
    ) -> Result<Step> {
        let branch = self.config.branch_name();
        let base = self.config.base_branch.clone();

        let repo = self.repo.clone();
        let (b, base_ref) = (branch.clone(), base.clone());
        self.guarded(blocking(move || repo.prepare_branch(&b, &base_ref)))
            .await?;

        let root = self.repo.root().to_path_buf();
        let issue_text = task.issue_text();
        let settings = self.config.tuning.prompt.clone();
        let context = self
            .guarded(blocking(move || {
                Ok(select_context(
                    &root,
                    &issue_text,
                    settings.max_context_files,
                    settings.max_chars_per_file,
                ))
            }))
            .await?;

        let prompt = self.prompts.build(task, feedback, &context)?;
        tracing::info!(
            attempt = number,
            estimated_tokens = prompt.estimated_tokens,
            files = prompt.context_paths.len(),
            feedback = prompt.feedback_included,
            "prompt ready"
        );

        let request = ModelRequest {
            task_ref: task.task_ref(),
            system_text: SYSTEM_INSTRUCTION.to_string(),
            prompt_text: prompt.text,
            model_id: self.config.model.clone(),
            max_tokens: self.config.tuning.model.max_tokens,
            temperature: self.config.tuning.model.temperature,
        };
        pending.record_request(request.clone());

        let response = self.guarded(self.model.complete(&request)).await?;
        pending.record_response(response.clone());

        let patch = self
            .synthesizer
            .synthesize(&response, &self.repo.working_tree())?;
        for rejected in patch.rejected() {
            tracing::warn!(path = %rejected.raw, reason = %rejected.reason, "dropped operation");
        }
        pending.record_patch(patch.clone());

        if patch.is_empty() {
            return Ok(Step::NoChange);
        }
        tracing::info!(attempt = number, operations = patch.len(), "applying patch");

        // Not raced against cancellation: the apply is short and must not be
        // abandoned halfway while holding the branch lock.
        let repo = self.repo.clone();
        let b = branch.clone();
        let message = format!(
            "Fix #{}: {} (attempt {})",
            task.issue_id(),
            task.title().trim(),
            number
        );
        let commit = blocking(move || repo.apply(&patch, &b, &message)).await?;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let repo = self.repo.clone();
        let pushed_commit = commit.clone();
        if !self
            .guarded(blocking(move || repo.push(&pushed_commit)))
            .await?
        {
            tracing::warn!(branch = %branch, "no remote configured, branch was not pushed");
        }

        let summary = self.branch_summary(&branch, &base).await;
        let pr = self
            .orchestrator
            .open_or_update(task, &commit, number, &summary)
            .await?;

        Ok(Step::Opened { commit, pr })
    }

    /// Commits and files on the run branch, for the pull request body.
    async fn branch_summary(&self, branch: &str, base: &str) -> BranchSummary {
        let repo = self.repo.clone();
        let (branch, base) = (branch.to_string(), base.to_string());
        let result = blocking(move || {
            Ok(BranchSummary {
                commits: repo.branch_commits(&branch, &base)?,
                files: repo.file_changes(&branch, &base)?,
            })
        })
        .await;
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to summarize branch");
            BranchSummary::default()
        })
    }

    /// Publishes the head commit and waits for a CI or review verdict on it.
    async fn await_verdict(&mut self, commit: &CommitRef, pr: &PullRequestRef) -> Verdict {
        self.head.send_replace(Some(WatchTarget {
            sha: commit.sha.clone(),
            pull_number: pr.number,
        }));

        loop {
            let signal = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Verdict::Interrupted(AbandonReason::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Verdict::Interrupted(AbandonReason::DeadlineExceeded)
                }
                signal = self.signals.recv() => signal,
            };

            let Some(signal) = signal else {
                tracing::warn!("feedback channel closed while waiting for CI");
                return Verdict::Interrupted(AbandonReason::SignalsClosed);
            };
            if signal.is_stale(&commit.sha) {
                tracing::debug!(head = %commit.sha, signal = ?signal.head_sha(), "ignoring stale signal");
                continue;
            }

            match self.orchestrator.on_signal(signal) {
                RunEvent::CiPassed => return Verdict::Passed,
                RunEvent::CiFailed { feedback } | RunEvent::ChangesRequested { feedback } => {
                    return Verdict::Failed(feedback)
                }
                RunEvent::CiPending | RunEvent::Noted => {}
            }
        }
    }

    /// Races `work` against cancellation and the run deadline.
    async fn guarded<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Error::Cancelled),
            out = work => out,
        }
    }

    fn interruption(&self) -> AbandonReason {
        if !self.cancel.is_cancelled() && Instant::now() >= self.deadline {
            AbandonReason::DeadlineExceeded
        } else {
            AbandonReason::Cancelled
        }
    }

    fn transition(&mut self, to: RunStatus) -> Result<()> {
        self.state.transition(to)?;
        self.write_state(None);
        Ok(())
    }

    fn write_state(&self, reason: Option<&AbandonReason>) {
        if let Some(log) = &self.log {
            if let Err(e) = log.write_state(&self.state, self.orchestrator.pull_request(), reason) {
                tracing::warn!(error = %e, "failed to write run state");
            }
        }
    }

    fn record(&mut self, attempt: Attempt) {
        if let Some(log) = &self.log {
            if let Err(e) = log.append_attempt(&attempt) {
                tracing::warn!(error = %e, "failed to record attempt");
            }
        }
        self.attempts.push(attempt);
    }

    /// Posts a status comment; failures are logged, never fatal.
    async fn post_status(&mut self, attempt: u32, message: &str) {
        let message = self.redactor.redact(message);
        if let Err(e) = self.orchestrator.post_status(attempt, &message).await {
            tracing::warn!(attempt, error = %e, "failed to post status comment");
        }
    }

    async fn finish(mut self, ending: Ending) -> RunReport {
        let reason = match ending {
            Ending::Passed => None,
            Ending::Abandoned(reason) => {
                if let Err(e) = self.state.transition(RunStatus::Abandoned) {
                    tracing::error!(error = %e, "could not record abandonment");
                }
                let message = match &reason {
                    AbandonReason::NoChangeNeeded => {
                        format!("No changes needed: {}.", reason.describe())
                    }
                    _ => format!(
                        "Giving up after {} attempt(s): {}.",
                        self.state.attempt_count(),
                        reason.describe()
                    ),
                };
                self.post_status(self.state.attempt_count(), &message).await;
                tracing::warn!(reason = %reason.describe(), "run abandoned");
                Some(reason)
            }
        };
        self.write_state(reason.as_ref());

        tracing::info!(
            status = %self.state.status(),
            attempts = self.attempts.len(),
            "run finished"
        );

        RunReport {
            run_id: self.log.as_ref().map(|l| l.run_id().to_string()),
            task_ref: self.state.task_ref().clone(),
            status: self.state.status(),
            attempts: self.attempts,
            pull_request: self.orchestrator.pull_request().cloned(),
            reason,
        }
    }
}
