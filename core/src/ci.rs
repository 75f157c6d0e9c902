//! CI and review feed.
//!
//! [`CiWatcher`] follows the head commit the run controller publishes on a
//! watch channel, polls its check runs and the pull request's reviews with
//! exponential backoff, and sends what it sees as [`Signal`]s.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::config::CiSettings;
use crate::events::{CiSignal, ReviewSignal, Signal};
use crate::github::{CheckRun, CodeHost};

/// The commit the controller is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub sha: String,
    pub pull_number: u64,
}

/// Polls GitHub for feedback on the current head commit.
pub struct CiWatcher {
    host: Arc<dyn CodeHost>,
    poll_initial: Duration,
    poll_max: Duration,
    no_checks_grace: Duration,
    head: watch::Receiver<Option<WatchTarget>>,
    signals: mpsc::Sender<Signal>,
    cancel: CancellationToken,
}

/// Poll state for one target.
struct Tracking {
    target: WatchTarget,
    started: Instant,
    last_sent: Option<(Vec<CheckRun>, bool)>,
    done: bool,
}

enum Wake {
    Poll,
    HeadChanged,
    Stop,
}

impl CiWatcher {
    pub fn new(
        host: Arc<dyn CodeHost>,
        settings: &CiSettings,
        head: watch::Receiver<Option<WatchTarget>>,
        signals: mpsc::Sender<Signal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host,
            poll_initial: settings.poll_initial(),
            poll_max: settings.poll_max(),
            no_checks_grace: settings.no_checks_grace(),
            head,
            signals,
            cancel,
        }
    }

    /// Overrides the poll backoff bounds.
    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial = initial;
        self.poll_max = max;
        self
    }

    /// Runs until cancelled, until the controller drops its side of either
    /// channel.
    pub async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(self.poll_initial, self.poll_max);
        let mut seen_reviews: HashSet<u64> = HashSet::new();
        let mut tracking: Option<Tracking> = None;

        loop {
            let current = self.head.borrow_and_update().clone();
            let retarget = match (&tracking, &current) {
                (Some(t), Some(target)) => t.target != *target,
                (None, None) => false,
                _ => true,
            };
            if retarget {
                backoff.reset();
                tracking = current.map(|target| {
                    tracing::info!(sha = %target.sha, pr = target.pull_number, "watching commit");
                    Tracking {
                        target,
                        started: Instant::now(),
                        last_sent: None,
                        done: false,
                    }
                });
            }

            if let Some(t) = tracking.as_mut() {
                if !self.poll(t, &mut seen_reviews).await {
                    tracing::debug!("signal receiver dropped, stopping CI watcher");
                    return;
                }
            }

            let idle = tracking.as_ref().map_or(true, |t| t.done);
            match self.wait(idle, backoff.step()).await {
                Wake::Poll => {}
                Wake::HeadChanged => backoff.reset(),
                Wake::Stop => {
                    tracing::debug!("CI watcher stopped");
                    return;
                }
            }
        }
    }

    /// Sleeps until the next poll is due, the head changes or the watcher
    /// has to stop. While `idle` it only waits for a new head.
    async fn wait(&mut self, idle: bool, delay: Duration) -> Wake {
        let sleep = async {
            if idle {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(delay).await
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Stop,
            changed = self.head.changed() => match changed {
                Ok(()) => Wake::HeadChanged,
                Err(_) => Wake::Stop,
            },
            _ = sleep => Wake::Poll,
        }
    }

    /// One poll of checks and reviews. Returns false once nobody listens.
    async fn poll(&self, tracking: &mut Tracking, seen_reviews: &mut HashSet<u64>) -> bool {
        let target = tracking.target.clone();

        match self.host.list_reviews(target.pull_number).await {
            Ok(reviews) => {
                for review in reviews {
                    if !seen_reviews.insert(review.id) {
                        continue;
                    }
                    // Reviews left on earlier commits were handled by earlier attempts.
                    if review.commit_id.as_deref().is_some_and(|sha| sha != target.sha) {
                        continue;
                    }
                    let signal = Signal::Review(ReviewSignal {
                        head_sha: review.commit_id,
                        state: review.state,
                        body: review.body,
                    });
                    if self.signals.send(signal).await.is_err() {
                        return false;
                    }
                }
            }
            Err(e) => tracing::warn!(pr = target.pull_number, error = %e, "failed to list reviews"),
        }

        if tracking.done {
            return true;
        }

        let checks = match self.host.list_check_runs(&target.sha).await {
            Ok(checks) => checks,
            Err(e) => {
                tracing::warn!(sha = %target.sha, error = %e, "failed to list check runs");
                return true;
            }
        };

        // Workflows can still register checks during the grace window, so
        // nothing settles before it ends, even a fully completed snapshot.
        let registration_open = tracking.started.elapsed() < self.no_checks_grace;
        let settled = !registration_open && checks.iter().all(|c| c.status == "completed");

        let snapshot = (checks, settled);
        if tracking.last_sent.as_ref() == Some(&snapshot) {
            return true;
        }

        tracing::debug!(
            sha = %target.sha,
            checks = snapshot.0.len(),
            settled,
            "sending CI signal"
        );
        let signal = Signal::Ci(CiSignal {
            head_sha: target.sha.clone(),
            checks: snapshot.0.clone(),
            settled,
        });
        if self.signals.send(signal).await.is_err() {
            return false;
        }

        tracking.done = settled;
        tracking.last_sent = Some(snapshot);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::MemoryHost;

    fn settings(grace_secs: u64) -> CiSettings {
        CiSettings {
            poll_initial_secs: 1,
            poll_max_secs: 1,
            no_checks_grace_secs: grace_secs,
        }
    }

    fn check(status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            name: "test".to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
            summary: None,
        }
    }

    struct Harness {
        head: watch::Sender<Option<WatchTarget>>,
        signals: mpsc::Receiver<Signal>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(host: Arc<MemoryHost>, settings: CiSettings) -> Harness {
        let (head_tx, head_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let watcher = CiWatcher::new(host, &settings, head_rx, signal_tx, cancel.clone())
            .with_poll_interval(Duration::from_millis(10), Duration::from_millis(40));
        Harness {
            head: head_tx,
            signals: signal_rx,
            cancel,
            task: tokio::spawn(watcher.run()),
        }
    }

    async fn next(signals: &mut mpsc::Receiver<Signal>) -> Signal {
        tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn reports_completed_checks_as_settled() {
        let host = Arc::new(MemoryHost::default());
        host.set_check_runs("abc", vec![check("completed", Some("success"))]);
        let mut h = start(host, settings(0));

        h.head
            .send(Some(WatchTarget {
                sha: "abc".to_string(),
                pull_number: 1,
            }))
            .unwrap();

        match next(&mut h.signals).await {
            Signal::Ci(ci) => {
                assert_eq!(ci.head_sha, "abc");
                assert!(ci.settled);
                assert_eq!(ci.checks.len(), 1);
            }
            other => panic!("unexpected signal {:?}", other),
        }

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn follows_check_progress_until_completed() {
        let host = Arc::new(MemoryHost::default());
        host.set_check_runs("abc", vec![check("in_progress", None)]);
        let mut h = start(host.clone(), settings(0));
        h.head
            .send(Some(WatchTarget {
                sha: "abc".to_string(),
                pull_number: 1,
            }))
            .unwrap();

        match next(&mut h.signals).await {
            Signal::Ci(ci) => assert!(!ci.settled),
            other => panic!("unexpected signal {:?}", other),
        }

        host.set_check_runs("abc", vec![check("completed", Some("failure"))]);
        match next(&mut h.signals).await {
            Signal::Ci(ci) => {
                assert!(ci.settled);
                assert_eq!(ci.checks[0].conclusion.as_deref(), Some("failure"));
            }
            other => panic!("unexpected signal {:?}", other),
        }

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn late_check_within_grace_is_not_missed() {
        let host = Arc::new(MemoryHost::default());
        host.set_check_runs("abc", vec![check("completed", Some("success"))]);
        let mut h = start(host.clone(), settings(1));
        h.head
            .send(Some(WatchTarget {
                sha: "abc".to_string(),
                pull_number: 1,
            }))
            .unwrap();

        match next(&mut h.signals).await {
            Signal::Ci(ci) => {
                assert_eq!(ci.checks.len(), 1);
                assert!(!ci.settled);
            }
            other => panic!("unexpected signal {:?}", other),
        }

        let mut e2e = check("completed", Some("failure"));
        e2e.name = "e2e".to_string();
        host.set_check_runs("abc", vec![check("completed", Some("success")), e2e]);

        let settled = loop {
            match next(&mut h.signals).await {
                Signal::Ci(ci) if ci.settled => break ci,
                Signal::Ci(_) => continue,
                other => panic!("unexpected signal {:?}", other),
            }
        };
        assert_eq!(settled.checks.len(), 2);
        assert!(settled.checks.iter().any(|c| c.name == "e2e"));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn no_checks_settle_after_grace() {
        let host = Arc::new(MemoryHost::default());
        let mut h = start(host, settings(0));
        h.head
            .send(Some(WatchTarget {
                sha: "abc".to_string(),
                pull_number: 1,
            }))
            .unwrap();

        match next(&mut h.signals).await {
            Signal::Ci(ci) => {
                assert!(ci.checks.is_empty());
                assert!(ci.settled);
            }
            other => panic!("unexpected signal {:?}", other),
        }

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn forwards_reviews_for_the_current_commit_only() {
        let host = Arc::new(MemoryHost::default());
        host.add_review(1, "CHANGES_REQUESTED", "old feedback", Some("old"));
        host.add_review(1, "CHANGES_REQUESTED", "use an h2", Some("abc"));
        host.set_check_runs("abc", vec![check("queued", None)]);
        let mut h = start(host, settings(60));
        h.head
            .send(Some(WatchTarget {
                sha: "abc".to_string(),
                pull_number: 1,
            }))
            .unwrap();

        match next(&mut h.signals).await {
            Signal::Review(review) => {
                assert_eq!(review.body, "use an h2");
                assert_eq!(review.head_sha.as_deref(), Some("abc"));
            }
            other => panic!("unexpected signal {:?}", other),
        }

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_controller_goes_away() {
        let host = Arc::new(MemoryHost::default());
        let h = start(host, settings(60));

        drop(h.head);
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }
}
