//! Bounded retry timer.
//!
//! Each timed protocol procedure (EOF ACK wait, Finished ACK wait, NAK rounds, the completion
//! re-check and the inactivity watchdog) is a repeating deadline with a bounded number of
//! firings. The timer is polled rather than callback-driven so that every expiry is handled
//! on the transfer's own sequencer, never on a foreign thread.
use std::time::{Duration, Instant};

/// Outcome of a timer expiry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Attempts remain; the timer has re-armed itself for another interval.
    Intermediate,
    /// The attempt budget is exhausted; the timer has disarmed itself.
    Final,
}

#[derive(Debug)]
pub struct RetryTimer {
    interval: Duration,
    /// Number of intermediate firings before the final one. Negative means unlimited
    /// intermediates (the timer never fires finally). Zero means the first expiry is final.
    max_attempts: i32,
    attempts: i32,
    deadline: Option<Instant>,
}

impl RetryTimer {
    pub fn new(interval: Duration, max_attempts: i32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 0,
            deadline: None,
        }
    }

    /// Arms the timer for one full attempt cycle. Starting an already armed timer discards
    /// the previous schedule and attempt count.
    pub fn start(&mut self, now: Instant) {
        self.attempts = 0;
        self.deadline = Some(now + self.interval);
    }

    /// Disarms the timer. Safe to call in any state.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Number of intermediate expiries since the last [Self::start].
    #[inline]
    pub fn attempts(&self) -> i32 {
        self.attempts
    }

    /// The next point in time [Self::poll] will report an expiry, for precise sleeping.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Checks the timer against the given time. At most one expiry is reported per call;
    /// an expired timer re-arms relative to `now`, so a stalled poller does not observe a
    /// burst of catch-up firings.
    pub fn poll(&mut self, now: Instant) -> Option<Expiry> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        if self.max_attempts >= 0 && self.attempts >= self.max_attempts {
            self.deadline = None;
            return Some(Expiry::Final);
        }
        self.attempts += 1;
        self.deadline = Some(now + self.interval);
        Some(Expiry::Intermediate)
    }
}
