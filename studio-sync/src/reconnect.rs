//! Reconnection controller: exponential backoff plus the pending-changes
//! flag that forces a full resync once the link is back.
//!
//! ```text
//!  Connecting ──ok──► Connected ──link lost──► Reconnecting{attempt, delay}
//!      ▲                                            │ timer fires
//!      └────────────────────────────────────────────┘
//!                      attempts == max ──► Exhausted (manual reconnect resets)
//! ```
//!
//! Pure state; the session owns the timers.

use std::time::Duration;
use tokio::time::Instant;

/// `delay(n) = min(base * factor^n, max_delay)`, for `n < max_attempts`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            factor: 1.5,
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self.base.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

/// Transport health as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic retries used up; only a manual reconnect leaves this state.
    Exhausted,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: BackoffPolicy,
    attempts: u32,
    pending_changes: bool,
    connected: bool,
    min_resync_gap: Duration,
    last_sync: Option<Instant>,
}

impl ReconnectController {
    pub fn new(policy: BackoffPolicy, min_resync_gap: Duration) -> Self {
        Self {
            policy,
            attempts: 0,
            pending_changes: false,
            connected: false,
            min_resync_gap,
            last_sync: None,
        }
    }

    /// Link lost. Returns the delay before the next attempt, or `None` once
    /// the attempt budget is spent.
    pub fn on_disconnected(&mut self) -> Option<Duration> {
        self.suspend();
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    /// Link closed on purpose; no retry is scheduled.
    pub fn suspend(&mut self) {
        self.connected = false;
        self.pending_changes = true;
    }

    /// Link established. Returns whether a full resync must be sent now
    /// (the pending flag is consumed).
    pub fn on_connected(&mut self) -> bool {
        self.connected = true;
        self.attempts = 0;
        std::mem::take(&mut self.pending_changes)
    }

    /// Manual reconnect: start the attempt budget over.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn mark_pending(&mut self) {
        self.pending_changes = true;
    }

    pub fn pending_changes(&self) -> bool {
        self.pending_changes
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Periodic check: connected, something pending, and the last sync is
    /// at least `min_resync_gap` old.
    pub fn should_resync(&self, now: Instant) -> bool {
        self.connected
            && self.pending_changes
            && self
                .last_sync
                .is_none_or(|t| now.saturating_duration_since(t) >= self.min_resync_gap)
    }

    pub fn record_sync(&mut self, now: Instant) {
        self.last_sync = Some(now);
        self.pending_changes = false;
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), Duration::from_secs(5))
    }
}
