//! Keepalive and retry scheduling.
//!
//! The scheduler only tracks instants; the session decides what to send.

use embassy_time::{Duration, Instant};

/// Retry checks run at most this often.
pub const RETRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// What the session has to do after a keepalive check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeepaliveAction {
    Idle,
    /// Send PINGREQ.
    SendPing,
    /// The broker stopped answering; drop the connection.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    last_in: Instant,
    last_out: Instant,
    ping_sent: Option<Instant>,
    last_retry_check: Instant,
}

impl Keepalive {
    /// An interval of zero disables keepalive.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_in: now,
            last_out: now,
            ping_sent: None,
            last_retry_check: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Starts over for a fresh connection.
    pub fn reset(&mut self, now: Instant) {
        self.last_in = now;
        self.last_out = now;
        self.ping_sent = None;
    }

    pub fn record_inbound(&mut self, now: Instant) {
        self.last_in = now;
    }

    pub fn record_outbound(&mut self, now: Instant) {
        self.last_out = now;
    }

    pub fn ping_sent(&mut self, now: Instant) {
        self.ping_sent = Some(now);
        self.last_in = now;
        self.last_out = now;
    }

    pub fn pong_received(&mut self) {
        self.ping_sent = None;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent.is_some()
    }

    /// Decides whether to ping or to give up on the connection.
    ///
    /// `connected` is `true` only once CONNACK was accepted and no
    /// disconnect is in progress; an idle interval in any other state means
    /// the broker is not answering.
    pub fn check(&self, now: Instant, connected: bool) -> KeepaliveAction {
        if self.interval == Duration::from_ticks(0) {
            return KeepaliveAction::Idle;
        }
        if let Some(sent) = self.ping_sent
            && now.saturating_duration_since(sent) >= self.interval
        {
            return KeepaliveAction::TimedOut;
        }

        let last_traffic = self.last_in.max(self.last_out);
        if now.saturating_duration_since(last_traffic) < self.interval {
            return KeepaliveAction::Idle;
        }
        if connected && self.ping_sent.is_none() {
            KeepaliveAction::SendPing
        } else if connected {
            KeepaliveAction::Idle
        } else {
            KeepaliveAction::TimedOut
        }
    }

    /// `true` at most once per [`RETRY_CHECK_INTERVAL`].
    pub fn retry_due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_retry_check) < RETRY_CHECK_INTERVAL {
            return false;
        }
        self.last_retry_check = now;
        true
    }
}
