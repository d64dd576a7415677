use std::time::Duration;

use tokio::time::Instant;

/// Flush no more often than once per interval under sustained token output.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Flush immediately once this many buffered characters accumulate.
pub const FLUSH_THRESHOLD_CHARS: usize = 100;

/// Coalesces content deltas into time/size-bounded flushes.
///
/// Writing to observable UI state on every token can exceed one update per
/// animation frame under fast model output; batching caps the update rate
/// while guaranteeing every appended character is eventually flushed.
#[derive(Debug)]
pub struct ContentBatcher {
    pending: String,
    last_flush: Instant,
    deadline: Option<Instant>,
}

impl ContentBatcher {
    pub fn new(now: Instant) -> Self {
        Self {
            pending: String::new(),
            last_flush: now,
            deadline: None,
        }
    }

    /// Appends one delta and arms the flush timer if none is pending.
    pub fn append(&mut self, delta: &str, now: Instant) {
        self.pending.push_str(delta);
        if self.deadline.is_none() {
            self.deadline = Some(now + FLUSH_INTERVAL);
        }
    }

    /// The at-most-one pending flush timer the read loop sleeps on.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains the buffer when forced, time-due, or size-due.
    ///
    /// `force` is used exactly twice per turn: when the done frame arrives and
    /// when the user cancels.
    pub fn flush(&mut self, force: bool, now: Instant) -> Option<String> {
        if self.pending.is_empty() {
            if force {
                self.deadline = None;
            }
            return None;
        }

        let time_due = now.duration_since(self.last_flush) >= FLUSH_INTERVAL;
        let size_due = self.pending.chars().count() >= FLUSH_THRESHOLD_CHARS;
        if !(force || time_due || size_due) {
            return None;
        }

        self.last_flush = now;
        self.deadline = None;
        Some(std::mem::take(&mut self.pending))
    }
}
