//! End-to-end runs of the controller against a real git checkout, an
//! in-memory code host and a scripted model.

mod support;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use code_agent::ci::CiWatcher;
use code_agent::config::CiSettings;
use code_agent::controller::{AbandonReason, RunStatus, EXIT_SETUP_FAILURE};
use code_agent::github::MemoryHost;
use code_agent::model::{ProviderError, ScriptedProvider, ScriptedReply};
use code_agent::task::AttemptOutcome;

use support::{check, fast_tuning, heading_edit, load_scenario, play, verify, Harness};

#[tokio::test]
async fn heading_change_passes_ci() {
    let scenario = load_scenario("heading_change.yaml");
    let (harness, report) = play(&scenario).await;
    verify(&harness, &report, &scenario.expect);

    assert!(report.succeeded());
    assert_eq!(report.exit_code(), 0);

    let (pr, body) = &harness.host.pull_requests()[0];
    assert_eq!(pr.head_branch, "issue-12");
    assert_eq!(pr.base_branch, "main");
    assert!(body.contains("Closes #12"));
    assert_eq!(report.pull_request.as_ref(), Some(pr));

    let attempt = &report.attempts[0];
    assert_eq!(attempt.outcome(), AttemptOutcome::Applied);
    assert_eq!(attempt.patch_set().map(|p| p.len()), Some(1));
    let commit = attempt.commit().expect("applied attempt has a commit");
    assert_eq!(commit.branch, "issue-12");
    assert_eq!(commit.paths, vec![PathBuf::from("index.html")]);
}

#[tokio::test]
async fn ci_failure_feeds_the_next_attempt() {
    let scenario = load_scenario("ci_fail_then_pass.yaml");
    let (harness, report) = play(&scenario).await;
    verify(&harness, &report, &scenario.expect);

    // Both commits go to the same pull request.
    let updates = harness
        .host
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_pull_request") || c.starts_with("update_pull_request"))
        .count();
    assert_eq!(updates, 2);
    let (_, body) = &harness.host.pull_requests()[0];
    assert!(body.contains("Attempt"));
    let head = &report.attempts[1].commit().unwrap().sha;
    assert!(body.contains(&head[..7]));
}

#[tokio::test]
async fn ci_that_never_passes_exhausts_attempts() {
    let scenario = load_scenario("ci_always_failing.yaml");
    let (harness, report) = play(&scenario).await;
    verify(&harness, &report, &scenario.expect);

    assert_eq!(harness.provider.calls(), 2);
    assert_eq!(report.exit_code(), 0);
    let comments = harness.issue_comments(pr_number(&harness));
    assert!(comments
        .iter()
        .any(|c| c.contains("Giving up after 2 attempt(s)")));
}

#[tokio::test]
async fn changes_requested_review_starts_a_new_attempt() {
    let scenario = load_scenario("review_changes_requested.yaml");
    let (harness, report) = play(&scenario).await;
    verify(&harness, &report, &scenario.expect);
}

#[tokio::test]
async fn no_change_needed_abandons_without_a_pull_request() {
    let scenario = load_scenario("no_change_needed.yaml");
    let (harness, report) = play(&scenario).await;
    verify(&harness, &report, &scenario.expect);

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.attempts[0].outcome(), AttemptOutcome::Rejected);
    let comments = harness.issue_comments(3);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("No changes needed"));
}

#[tokio::test]
async fn provider_outage_stops_at_the_attempt_cap() {
    let host = MemoryHost::default().with_issue(5, "Change heading", "Make it say Hi.");
    let provider = ScriptedProvider::new(Vec::new());
    let mut harness = Harness::start(host, 5, provider, fast_tuning(3));

    let report = harness.report().await;

    assert_eq!(report.status, RunStatus::Abandoned);
    assert_eq!(report.reason, Some(AbandonReason::RetriesExhausted));
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(harness.provider.calls(), 3);
    assert!(report
        .attempts
        .iter()
        .all(|a| a.outcome() == AttemptOutcome::Error));
    assert!(harness.host.pull_requests().is_empty());

    // One status per failed attempt, then the final one.
    let comments = harness.issue_comments(5);
    assert_eq!(comments.len(), 4);
    assert!(comments[3].contains("Giving up after 3 attempt(s)"));

    // Later prompts explain why the previous attempt was discarded.
    let requests = harness.provider.requests();
    assert!(!requests[0].prompt_text.contains("could not be used"));
    assert!(requests[1].prompt_text.contains("could not be used"));
}

#[tokio::test]
async fn unparsable_answer_is_retried() {
    let host = MemoryHost::default().with_issue(6, "Change heading", "Make it say Hi.");
    let provider = ScriptedProvider::from_texts([
        "I would change the heading, but here is no patch.".to_string(),
        heading_edit("Old", "Hi"),
    ]);
    let mut harness = Harness::start(host, 6, provider, fast_tuning(3));

    let target = harness.next_head(None).await.expect("a head commit");
    harness
        .send_checks(&target.sha, vec![check("build", "success", None)])
        .await;
    let report = harness.report().await;

    assert_eq!(report.status, RunStatus::CiPassed);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].outcome(), AttemptOutcome::Rejected);
    assert_eq!(report.attempts[1].outcome(), AttemptOutcome::Applied);
    assert_eq!(
        support::branch_commit_count(harness.repo.path(), &harness.branch),
        1
    );
}

#[tokio::test]
async fn stale_and_pending_signals_are_ignored() {
    let host = MemoryHost::default().with_issue(9, "Change heading", "Make it say Hi.");
    let provider = ScriptedProvider::from_texts([heading_edit("Old", "Hi")]);
    let mut harness = Harness::start(host, 9, provider, fast_tuning(3));

    let target = harness.next_head(None).await.expect("a head commit");
    harness
        .send_checks(
            "0000000000000000000000000000000000000000",
            vec![check("build", "failure", Some("from an older commit"))],
        )
        .await;
    harness
        .signals
        .send(code_agent::Signal::Ci(code_agent::CiSignal {
            head_sha: target.sha.clone(),
            checks: Vec::new(),
            settled: false,
        }))
        .await
        .unwrap();
    harness
        .send_checks(&target.sha, vec![check("build", "success", None)])
        .await;

    let report = harness.report().await;
    assert_eq!(report.status, RunStatus::CiPassed);
    assert_eq!(report.attempts.len(), 1);
}

#[tokio::test]
async fn cancellation_while_waiting_for_ci() {
    let host = MemoryHost::default().with_issue(4, "Change heading", "Make it say Hi.");
    let provider = ScriptedProvider::from_texts([heading_edit("Old", "Hi")]);
    let mut harness = Harness::start(host, 4, provider, fast_tuning(3));

    harness.next_head(None).await.expect("a head commit");
    harness.cancel.cancel();
    let report = harness.report().await;

    assert_eq!(report.status, RunStatus::Abandoned);
    assert_eq!(report.reason, Some(AbandonReason::Cancelled));
    assert_eq!(report.exit_code(), 0);
    // The pull request stays open for a human to pick up.
    assert!(report.pull_request.is_some());
    let comments = harness.issue_comments(pr_number(&harness));
    assert!(comments.iter().any(|c| c.contains("the run was cancelled")));
}

#[tokio::test]
async fn deadline_ends_the_ci_wait() {
    let host = MemoryHost::default().with_issue(10, "Change heading", "Make it say Hi.");
    let provider = ScriptedProvider::from_texts([heading_edit("Old", "Hi")]);
    let mut tuning = fast_tuning(3);
    tuning.run.run_deadline_secs = 3;
    let mut harness = Harness::start(host, 10, provider, tuning);

    harness.next_head(None).await.expect("a head commit");
    let report = harness.report().await;

    assert_eq!(report.reason, Some(AbandonReason::DeadlineExceeded));
    assert_eq!(report.attempts.len(), 1);
}

#[tokio::test]
async fn unreachable_repository_is_a_setup_failure() {
    let host = MemoryHost::default()
        .with_issue(2, "Change heading", "Make it say Hi.")
        .unreachable();
    let provider = ScriptedProvider::from_texts([heading_edit("Old", "Hi")]);
    let mut harness = Harness::start(host, 2, provider, fast_tuning(3));

    let report = harness.report().await;

    assert_eq!(report.status, RunStatus::Abandoned);
    assert!(matches!(report.reason, Some(AbandonReason::SetupFailed(_))));
    assert_eq!(report.exit_code(), EXIT_SETUP_FAILURE);
    assert!(report.attempts.is_empty());
    assert_eq!(harness.provider.calls(), 0);
}

#[tokio::test]
async fn missing_issue_is_a_setup_failure() {
    let provider = ScriptedProvider::from_texts([heading_edit("Old", "Hi")]);
    let mut harness = Harness::start(MemoryHost::default(), 404, provider, fast_tuning(3));

    let report = harness.report().await;

    assert!(matches!(report.reason, Some(AbandonReason::SetupFailed(_))));
    assert_eq!(harness.provider.calls(), 0);
}

#[tokio::test]
async fn credentials_never_reach_comments_or_logs() {
    let host = MemoryHost::default().with_issue(11, "Change heading", "Make it say Hi.");
    let leak = format!("upstream rejected key {}", support::OPENROUTER_KEY);
    let provider = ScriptedProvider::new(Vec::new()).with_fallback(ScriptedReply::Fail(
        ProviderError::Server {
            status: 502,
            message: leak,
        },
    ));
    let mut harness = Harness::start(host, 11, provider, fast_tuning(2));

    let report = harness.report().await;
    assert_eq!(report.reason, Some(AbandonReason::RetriesExhausted));

    for comment in harness.issue_comments(11) {
        assert!(!comment.contains(support::OPENROUTER_KEY), "leaked: {}", comment);
    }
    for attempt in &report.attempts {
        let message = &attempt.error().unwrap().message;
        assert!(!message.contains(support::OPENROUTER_KEY), "leaked: {}", message);
    }
}

#[tokio::test]
async fn run_log_records_state_and_attempts() {
    let scenario = load_scenario("ci_fail_then_pass.yaml");
    let (harness, report) = play(&scenario).await;

    let dir = harness.run_dir();
    assert_eq!(
        dir.file_name().unwrap().to_str(),
        report.run_id.as_deref()
    );

    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("state.json")).unwrap()).unwrap();
    assert_eq!(state["state"]["status"], "ci_passed");
    assert_eq!(state["state"]["attempt_count"], 2);
    assert_eq!(state["pull_request"]["head_branch"], "issue-7");

    let attempts = fs::read_to_string(dir.join("attempts.jsonl")).unwrap();
    let lines: Vec<serde_json::Value> = attempts
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["outcome"], "applied");
    assert_eq!(lines[1]["number"], 2);
}

#[tokio::test]
async fn slow_model_is_interrupted_by_cancellation() {
    let host = MemoryHost::default().with_issue(13, "Change heading", "Make it say Hi.");
    let provider = ScriptedProvider::from_texts([heading_edit("Old", "Hi")])
        .with_delay(Duration::from_secs(20));
    let mut harness = Harness::start(host, 13, provider, fast_tuning(3));

    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.cancel.cancel();
    let report = harness.report().await;

    assert_eq!(report.reason, Some(AbandonReason::Cancelled));
    assert_eq!(
        support::branch_commit_count(harness.repo.path(), &harness.branch),
        0
    );
}

#[tokio::test]
async fn ci_watcher_reports_checks_from_the_host() {
    let host = MemoryHost::default().with_issue(14, "Change heading", "Make it say Hi.");
    let provider = ScriptedProvider::from_texts([heading_edit("Old", "Hi")]);
    let mut harness = Harness::start(host, 14, provider, fast_tuning(3));

    let settings = CiSettings {
        no_checks_grace_secs: 1,
        ..CiSettings::default()
    };
    let watcher = CiWatcher::new(
        harness.host.clone(),
        &settings,
        harness.head.clone(),
        harness.signals.clone(),
        harness.cancel.clone(),
    )
    .with_poll_interval(Duration::from_millis(10), Duration::from_millis(40));
    let watcher = tokio::spawn(watcher.run());

    let target = harness.next_head(None).await.expect("a head commit");
    harness.host.set_check_runs(
        &target.sha,
        vec![check("build", "success", None), check("e2e", "skipped", None)],
    );

    let report = harness.report().await;
    assert_eq!(report.status, RunStatus::CiPassed);
    // The controller is gone, so the watcher stops on its own.
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .expect("watcher did not stop")
        .unwrap();
}

/// Status comments go to the pull request once it exists.
fn pr_number(harness: &Harness) -> u64 {
    harness.host.pull_requests()[0].0.number
}
