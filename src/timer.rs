//! One-shot transaction timer.
//!
//! Every transaction owns at most one pending deadline. Installing a new
//! deadline always cancels the previous one, so a timer can never fire for a
//! state the transaction has already left. Deadlines are absolute instants;
//! the owner decides when "now" is, which keeps the state machines
//! deterministic under test.

use std::time::{Duration, Instant};

/// A single cancellable deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the timer to fire `delay` after `now`, replacing any pending deadline.
    pub fn install(&mut self, now: Instant, delay: Duration) {
        self.suspend();
        self.deadline = Some(now + delay);
    }

    /// Cancel the pending deadline, if any.
    pub fn suspend(&mut self) {
        self.deadline = None;
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_expire() {
        let now = Instant::now();
        let mut timer = Timer::new();
        assert!(!timer.is_scheduled());
        assert!(!timer.is_expired(now));

        timer.install(now, Duration::from_millis(100));
        assert!(timer.is_scheduled());
        assert!(!timer.is_expired(now + Duration::from_millis(99)));
        assert!(timer.is_expired(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_install_replaces_deadline() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.install(now, Duration::from_millis(100));
        timer.install(now, Duration::from_millis(500));

        assert_eq!(timer.deadline(), Some(now + Duration::from_millis(500)));
        assert!(!timer.is_expired(now + Duration::from_millis(200)));
    }

    #[test]
    fn test_suspend() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.install(now, Duration::from_millis(10));
        timer.suspend();

        assert!(!timer.is_scheduled());
        assert!(!timer.is_expired(now + Duration::from_secs(1)));
    }
}
