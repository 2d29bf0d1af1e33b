//! Per-session push throttle.
//!
//! Tracks whether a push is owed (`pending`), the single armed timer deadline,
//! and when the last effectful push happened. It never sleeps itself: callers
//! feed it the current instant and wait on [`Throttle::deadline`].
//!
//! At most one deadline is armed and at most one send is in flight. A
//! notification that lands while a send is running only marks the throttle
//! pending; [`Throttle::complete`] re-arms it afterwards.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_push: Option<Instant>,
    pending: bool,
    deadline: Option<Instant>,
    in_flight: bool,
    closed: bool,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_push: None,
            pending: false,
            deadline: None,
            in_flight: false,
            closed: false,
        }
    }

    /// Request a push. Returns the deadline when this call armed the timer.
    pub fn notify(&mut self, now: Instant) -> Option<Instant> {
        if self.closed {
            return None;
        }
        self.pending = true;
        if self.deadline.is_some() || self.in_flight {
            return None;
        }
        let at = self.next_slot(now);
        self.deadline = Some(at);
        Some(at)
    }

    /// The armed timer fired. `true` means the caller must send now and report
    /// back through [`Throttle::complete`].
    pub fn on_timer_fire(&mut self) -> bool {
        self.deadline = None;
        if self.closed || !self.pending {
            return false;
        }
        self.pending = false;
        self.in_flight = true;
        true
    }

    /// A send finished; `pushed` is whether a data frame actually went out.
    /// Returns a freshly armed deadline when notifications arrived meanwhile.
    pub fn complete(&mut self, now: Instant, pushed: bool) -> Option<Instant> {
        self.in_flight = false;
        if pushed {
            self.last_push = Some(now);
        }
        if self.closed || !self.pending {
            return None;
        }
        let at = self.next_slot(now);
        self.deadline = Some(at);
        Some(at)
    }

    /// Record a push that happened outside the timer path (the baseline).
    pub fn record_push(&mut self, at: Instant) {
        self.last_push = Some(at);
    }

    /// Disarm everything; later notifications are ignored. Idempotent.
    pub fn shutdown(&mut self) {
        self.closed = true;
        self.pending = false;
        self.deadline = None;
        self.in_flight = false;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_push(&self) -> Option<Instant> {
        self.last_push
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn next_slot(&self, now: Instant) -> Instant {
        match self.last_push {
            Some(prev) => (prev + self.min_interval).max(now),
            None => now,
        }
    }
}
