//! Retry budget and backoff timer for login attempts.
//!
//! The controller is plain state: it decides *whether* and *when* to retry,
//! the presence service owns the timer and performs the actual login.

use crate::backoff::LinearBackoff;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Budget value meaning "retry forever".
pub const UNBOUNDED: i32 = -1;

/// Where the login state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectState {
    /// Idle and not logged in.
    Disconnected,
    /// A login attempt is running.
    Connecting,
    /// The last login succeeded and the link has not dropped since.
    Connected,
    /// A failed attempt left budget; a retry timer is armed.
    RetryScheduled,
}

/// Linear-backoff retry scheduler with an attempt budget.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    state: ReconnectState,
    backoff: LinearBackoff,
    attempts_remaining: i32,
    retry_at: Option<Instant>,
}

impl ReconnectController {
    /// Creates an idle controller.
    #[must_use]
    pub const fn new(backoff: LinearBackoff) -> Self {
        Self {
            state: ReconnectState::Disconnected,
            backoff,
            attempts_remaining: UNBOUNDED,
            retry_at: None,
        }
    }

    /// Records the start of a login attempt with a fresh budget. Any armed
    /// retry timer is dropped.
    pub fn begin_attempt(&mut self, budget: i32) {
        self.attempts_remaining = budget;
        self.retry_at = None;
        self.state = ReconnectState::Connecting;
    }

    /// The attempt succeeded: backoff returns to its base delay.
    pub fn on_success(&mut self) {
        self.backoff.reset();
        self.retry_at = None;
        self.state = ReconnectState::Connected;
    }

    /// The attempt failed. Returns the delay of the scheduled retry, or
    /// `None` when the budget is exhausted.
    pub fn on_failure(&mut self, now: Instant) -> Option<Duration> {
        if self.attempts_remaining == 0 {
            self.retry_at = None;
            self.state = ReconnectState::Disconnected;
            return None;
        }
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        self.state = ReconnectState::RetryScheduled;
        Some(delay)
    }

    /// Consumes the armed timer when it fires. Returns the budget to pass
    /// to the retry, one less than before unless unbounded.
    pub fn take_due_retry(&mut self) -> Option<i32> {
        if self.state != ReconnectState::RetryScheduled {
            return None;
        }
        self.retry_at = None;
        if self.attempts_remaining > 0 {
            self.attempts_remaining -= 1;
        }
        Some(self.attempts_remaining)
    }

    /// The link dropped after a successful login. No retry is scheduled.
    pub fn on_disconnect(&mut self) {
        if self.state == ReconnectState::Connected {
            self.state = ReconnectState::Disconnected;
        }
    }

    /// Drops any armed timer and goes idle.
    pub fn cancel(&mut self) {
        self.retry_at = None;
        self.state = ReconnectState::Disconnected;
    }

    /// When the armed retry is due.
    #[must_use]
    pub const fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ReconnectState {
        self.state
    }

    /// Remaining retries; negative means unbounded.
    #[must_use]
    pub const fn attempts_remaining(&self) -> i32 {
        self.attempts_remaining
    }

    /// Delay the next failure will schedule.
    #[must_use]
    pub const fn next_delay(&self) -> Duration {
        self.backoff.peek()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn controller() -> ReconnectController {
        ReconnectController::new(LinearBackoff::new(secs(10), secs(10), secs(120)))
    }

    /// Drives attempts until the budget runs out; returns the scheduled delays.
    fn run_out(c: &mut ReconnectController, budget: i32) -> Vec<Duration> {
        let now = Instant::now();
        let mut delays = Vec::new();
        c.begin_attempt(budget);
        while let Some(delay) = c.on_failure(now) {
            delays.push(delay);
            let next = c.take_due_retry().unwrap();
            c.begin_attempt(next);
        }
        delays
    }

    #[test]
    fn failure_with_budget_schedules_retry() {
        let mut c = controller();
        let now = Instant::now();
        c.begin_attempt(3);

        assert_eq!(c.on_failure(now), Some(secs(10)));
        assert_eq!(c.state(), ReconnectState::RetryScheduled);
        assert_eq!(c.retry_deadline(), Some(now + secs(10)));
    }

    #[test]
    fn zero_budget_leaves_controller_disconnected() {
        let mut c = controller();
        c.begin_attempt(0);

        assert_eq!(c.on_failure(Instant::now()), None);
        assert_eq!(c.state(), ReconnectState::Disconnected);
        assert_eq!(c.retry_deadline(), None);
    }

    #[test]
    fn bounded_budget_allows_exactly_that_many_retries() {
        let mut c = controller();
        let delays = run_out(&mut c, 2);

        assert_eq!(delays, vec![secs(10), secs(20)]);
        assert_eq!(c.attempts_remaining(), 0);
        assert_eq!(c.state(), ReconnectState::Disconnected);
    }

    #[test]
    fn unbounded_budget_keeps_retrying_at_the_cap() {
        let mut c = controller();
        let now = Instant::now();
        c.begin_attempt(UNBOUNDED);

        let mut prev = Duration::ZERO;
        for _ in 0..50 {
            let delay = c.on_failure(now).unwrap();
            assert!(delay >= prev);
            assert!(delay <= secs(120));
            prev = delay;
            assert_eq!(c.take_due_retry(), Some(UNBOUNDED));
            c.begin_attempt(UNBOUNDED);
        }
        assert_eq!(prev, secs(120));
    }

    #[test]
    fn success_resets_backoff() {
        let mut c = controller();
        let now = Instant::now();
        c.begin_attempt(UNBOUNDED);
        for _ in 0..5 {
            c.on_failure(now);
            c.take_due_retry();
        }
        assert_eq!(c.next_delay(), secs(60));

        c.begin_attempt(UNBOUNDED);
        c.on_success();
        assert_eq!(c.state(), ReconnectState::Connected);

        c.begin_attempt(UNBOUNDED);
        assert_eq!(c.on_failure(now), Some(secs(10)));
    }

    #[test]
    fn new_attempt_cancels_armed_timer() {
        let mut c = controller();
        c.begin_attempt(UNBOUNDED);
        c.on_failure(Instant::now());
        assert!(c.retry_deadline().is_some());

        c.begin_attempt(5);

        assert_eq!(c.retry_deadline(), None);
        assert_eq!(c.take_due_retry(), None);
        assert_eq!(c.attempts_remaining(), 5);
    }

    #[test]
    fn timer_fires_at_most_once() {
        let mut c = controller();
        c.begin_attempt(3);
        c.on_failure(Instant::now());

        assert_eq!(c.take_due_retry(), Some(2));
        assert_eq!(c.take_due_retry(), None);
    }

    #[test]
    fn disconnect_after_success_does_not_retry() {
        let mut c = controller();
        c.begin_attempt(UNBOUNDED);
        c.on_success();

        c.on_disconnect();

        assert_eq!(c.state(), ReconnectState::Disconnected);
        assert_eq!(c.retry_deadline(), None);
    }

    #[test]
    fn cancel_drops_timer() {
        let mut c = controller();
        c.begin_attempt(UNBOUNDED);
        c.on_failure(Instant::now());

        c.cancel();

        assert_eq!(c.state(), ReconnectState::Disconnected);
        assert_eq!(c.take_due_retry(), None);
    }
}
