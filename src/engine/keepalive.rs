//! Keepalive timer
//!
//! Pure bookkeeping: the session's scheduler task asks [`KeepaliveTimer::poll`]
//! what to do at a given instant and reports back what it sent.
//! The broker only counts packets the client sends toward the keepalive
//! window, so a PINGREQ is due once nothing has been sent for a full interval
//! regardless of inbound traffic.

use tokio::time::{Duration, Instant};

/// What the scheduler should do for keepalive right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    Idle,
    SendPing,
    /// A PINGREQ went unanswered for the whole response window
    Expired,
}

#[derive(Debug, Clone)]
pub struct KeepaliveTimer {
    interval: Option<Duration>,
    response_timeout: Duration,
    last_sent: Instant,
    ping_deadline: Option<Instant>,
    pings_sent: u64,
}

impl KeepaliveTimer {
    pub fn new(response_timeout: Duration, now: Instant) -> Self {
        Self {
            interval: None,
            response_timeout,
            last_sent: now,
            ping_deadline: None,
            pings_sent: 0,
        }
    }

    /// Start (or restart) the timer; a zero interval stops it
    pub fn start(&mut self, interval: Duration, now: Instant) {
        if interval.is_zero() {
            self.stop();
            return;
        }
        self.interval = Some(interval);
        self.last_sent = now;
        self.ping_deadline = None;
    }

    pub fn stop(&mut self) {
        self.interval = None;
        self.ping_deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.pings_sent += 1;
        self.ping_deadline = Some(now + self.response_timeout);
    }

    /// Returns false when no PINGREQ was outstanding
    pub fn on_ping_response(&mut self) -> bool {
        self.ping_deadline.take().is_some()
    }

    pub fn poll(&self, now: Instant) -> KeepaliveAction {
        let Some(interval) = self.interval else {
            return KeepaliveAction::Idle;
        };
        if let Some(deadline) = self.ping_deadline {
            return if now >= deadline {
                KeepaliveAction::Expired
            } else {
                KeepaliveAction::Idle
            };
        }
        if now.saturating_duration_since(self.last_sent) >= interval {
            KeepaliveAction::SendPing
        } else {
            KeepaliveAction::Idle
        }
    }

    /// Earliest instant at which `poll` may return something other than `Idle`
    pub fn next_deadline(&self) -> Option<Instant> {
        let interval = self.interval?;
        Some(self.ping_deadline.unwrap_or(self.last_sent + interval))
    }
}
