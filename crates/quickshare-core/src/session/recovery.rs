//! Transport recovery state machine.
//!
//! Pure bookkeeping: callers feed in what happened together with the current
//! time and get back the next [`Step`] to perform. Timers live in the caller,
//! which makes the policy testable with synthetic instants.

use std::time::{Duration, Instant};

/// Source of "now" for the session driver.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's timer, so paused test runtimes control it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Timed reconnect attempts after the immediate one.
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            interval: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Acquiring,
    Ready,
    Degraded,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Create a brand new transport (new identity).
    Acquire,
    /// Reconnect the existing transport, keeping its identity.
    Reconnect,
    /// Destroy the current transport, then acquire a new one.
    Recreate,
    /// Destroy the current transport; a new one is acquired on the next
    /// deadline.
    Release,
    Nothing,
}

#[derive(Debug)]
pub struct Recovery {
    state: SessionState,
    policy: RetryPolicy,
    attempts: u32,
    deadline: Option<Instant>,
}

impl Recovery {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: SessionState::Unstarted,
            policy,
            attempts: 0,
            deadline: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Timed reconnect attempts made in the current outage.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// When the caller should next call [`Recovery::tick`].
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn start(&mut self) -> Step {
        if self.state != SessionState::Unstarted {
            return Step::Nothing;
        }
        self.state = SessionState::Acquiring;
        Step::Acquire
    }

    pub fn ready(&mut self) {
        if self.state == SessionState::Abandoned {
            return;
        }
        self.state = SessionState::Ready;
        self.attempts = 0;
        self.deadline = None;
    }

    /// The signalling/relay connection dropped.
    pub fn lost(&mut self, now: Instant) -> Step {
        match self.state {
            SessionState::Ready => {
                self.state = SessionState::Degraded;
                self.attempts = 0;
                self.deadline = Some(now + self.policy.interval);
                Step::Reconnect
            }
            // Lost before the transport ever became ready.
            SessionState::Acquiring => {
                self.deadline = Some(now + self.policy.interval);
                Step::Release
            }
            _ => Step::Nothing,
        }
    }

    /// Acquiring a fresh transport failed; try again after one interval.
    pub fn acquire_failed(&mut self, now: Instant) {
        if self.state == SessionState::Acquiring {
            self.deadline = Some(now + self.policy.interval);
        }
    }

    pub fn tick(&mut self, now: Instant) -> Step {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Step::Nothing,
        }

        match self.state {
            SessionState::Degraded if self.attempts < self.policy.max_retries => {
                self.attempts += 1;
                self.deadline = Some(now + self.policy.interval);
                Step::Reconnect
            }
            SessionState::Degraded => {
                self.state = SessionState::Acquiring;
                self.attempts = 0;
                self.deadline = None;
                Step::Recreate
            }
            SessionState::Acquiring => {
                self.deadline = None;
                Step::Acquire
            }
            _ => {
                self.deadline = None;
                Step::Nothing
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.state = SessionState::Abandoned;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_machine() -> (Recovery, Instant) {
        let mut r = Recovery::new(RetryPolicy::default());
        assert_eq!(r.start(), Step::Acquire);
        r.ready();
        (r, Instant::now())
    }

    #[test]
    fn test_start_only_once() {
        let mut r = Recovery::new(RetryPolicy::default());
        assert_eq!(r.state(), SessionState::Unstarted);
        assert_eq!(r.start(), Step::Acquire);
        assert_eq!(r.state(), SessionState::Acquiring);
        assert_eq!(r.start(), Step::Nothing);
    }

    #[test]
    fn test_loss_then_recovery_resets_budget() {
        let (mut r, t0) = ready_machine();
        assert_eq!(r.lost(t0), Step::Reconnect);
        assert_eq!(r.state(), SessionState::Degraded);

        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(r.tick(t1), Step::Reconnect);
        assert_eq!(r.attempts(), 1);

        r.ready();
        assert_eq!(r.state(), SessionState::Ready);
        assert_eq!(r.attempts(), 0);
        assert_eq!(r.deadline(), None);
    }

    #[test]
    fn test_tick_before_deadline_does_nothing() {
        let (mut r, t0) = ready_machine();
        r.lost(t0);
        assert_eq!(r.tick(t0 + Duration::from_millis(1999)), Step::Nothing);
        assert_eq!(r.attempts(), 0);
    }

    #[test]
    fn test_budget_exhaustion_recreates() {
        let (mut r, t0) = ready_machine();
        assert_eq!(r.lost(t0), Step::Reconnect);

        let mut now = t0;
        for attempt in 1..=5 {
            now += Duration::from_secs(2);
            assert_eq!(r.tick(now), Step::Reconnect, "timed retry {}", attempt);
        }

        now += Duration::from_secs(2);
        assert_eq!(r.tick(now), Step::Recreate);
        assert_eq!(r.state(), SessionState::Acquiring);
        assert_eq!(r.deadline(), None);
    }

    #[test]
    fn test_failed_acquire_retries_after_interval() {
        let mut r = Recovery::new(RetryPolicy { max_retries: 1, interval: Duration::from_millis(500) });
        r.start();
        let t0 = Instant::now();
        r.acquire_failed(t0);
        assert_eq!(r.tick(t0 + Duration::from_millis(100)), Step::Nothing);
        assert_eq!(r.tick(t0 + Duration::from_millis(500)), Step::Acquire);
        assert_eq!(r.deadline(), None);
    }

    #[test]
    fn test_lost_ignored_before_start_and_while_degraded() {
        let mut r = Recovery::new(RetryPolicy::default());
        assert_eq!(r.lost(Instant::now()), Step::Nothing);

        let (mut r, t0) = ready_machine();
        r.lost(t0);
        assert_eq!(r.lost(t0 + Duration::from_millis(10)), Step::Nothing);
        assert_eq!(r.state(), SessionState::Degraded);
    }

    #[test]
    fn test_lost_while_acquiring_releases_and_reacquires() {
        let mut r = Recovery::new(RetryPolicy::default());
        r.start();
        let t0 = Instant::now();
        assert_eq!(r.lost(t0), Step::Release);
        assert_eq!(r.state(), SessionState::Acquiring);
        assert_eq!(r.deadline(), Some(t0 + Duration::from_secs(2)));
        assert_eq!(r.tick(t0 + Duration::from_secs(1)), Step::Nothing);
        assert_eq!(r.tick(t0 + Duration::from_secs(2)), Step::Acquire);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let (mut r, t0) = ready_machine();
        r.lost(t0);
        r.shutdown();
        assert_eq!(r.state(), SessionState::Abandoned);
        r.ready();
        assert_eq!(r.state(), SessionState::Abandoned);
        assert_eq!(r.tick(t0 + Duration::from_secs(60)), Step::Nothing);
    }
}
