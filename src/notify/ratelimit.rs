//! Global dispatch quota with batching of the overflow.

use chrono::{DateTime, Duration, Utc};

use super::AlertKind;

/// A dispatch held back by the quota.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAlert {
    pub channel_id: i64,
    pub rule_id: Option<i64>,
    pub kind: AlertKind,
    pub message: String,
}

/// Token window: `max_per_window` dispatches per window, refilled in full
/// once the window has elapsed.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    tokens: u32,
    window_start: DateTime<Utc>,
    queue: Vec<QueuedAlert>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            max_per_window,
            window,
            tokens: max_per_window,
            window_start: now,
            queue: Vec::new(),
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if now - self.window_start >= self.window {
            self.tokens = self.max_per_window;
            self.window_start = now;
        }
    }

    /// Take one token if any is left.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    pub fn enqueue(&mut self, alert: QueuedAlert) {
        self.queue.push(alert);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn drain(&mut self) -> Vec<QueuedAlert> {
        std::mem::take(&mut self.queue)
    }

    pub fn remaining(&mut self, now: DateTime<Utc>) -> u32 {
        self.refill(now);
        self.tokens
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }

    /// Change the quota. Tokens already spent in this window stay spent.
    pub fn set_max(&mut self, max_per_window: u32) {
        let spent = self.max_per_window.saturating_sub(self.tokens);
        self.max_per_window = max_per_window;
        self.tokens = max_per_window.saturating_sub(spent);
    }
}
