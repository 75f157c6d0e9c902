//! Exponential backoff shared by provider retries, GitHub API retries, CI
//! polling and branch lock acquisition.

use std::time::Duration;

/// Doubling delay between `initial` and `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay the next `step` will return.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current delay and doubles it for next time.
    pub fn step(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Like [`step`](Self::step), but a server `Retry-After` wins when present.
    ///
    /// The hint is capped at `max` so a hostile header cannot stall a run.
    pub fn step_with_hint(&mut self, hint: Option<Duration>) -> Duration {
        let computed = self.step();
        hint.map_or(computed, |hint| hint.min(self.max))
    }

    /// Starts over from `initial`, e.g. when CI starts watching a new commit.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_retry_delays_double_up_to_the_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.step().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn retry_after_hint_wins_but_is_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(
            backoff.step_with_hint(Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            backoff.step_with_hint(Some(Duration::from_secs(3600))),
            Duration::from_secs(30)
        );
        // Hints still advance the computed schedule.
        assert_eq!(backoff.step_with_hint(None), Duration::from_secs(4));
    }

    #[test]
    fn new_commit_restarts_ci_polling() {
        let mut poll = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60));
        poll.step();
        poll.step();
        assert_eq!(poll.current(), Duration::from_secs(40));
        poll.reset();
        assert_eq!(poll.step(), Duration::from_secs(10));
    }

    #[test]
    fn max_below_initial_is_raised() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_millis(10));
        backoff.step();
        assert_eq!(backoff.current(), Duration::from_millis(500));
    }
}
