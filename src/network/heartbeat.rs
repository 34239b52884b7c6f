//! Heartbeat scheduling and timeout detection
//!
//! The monitor owns two one-shot deadlines, a send timer and a timeout
//! timer. The connection's event loop sleeps until `next_wakeup()` and
//! calls `poll()`; nothing here touches the socket.

use std::time::Duration;
use tokio::time::Instant;

/// Timer jitter tolerated before a timeout is declared
pub const DRIFT_THRESHOLD: Duration = Duration::from_millis(100);

/// What the event loop has to do after a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Write a Heartbeat package
    Send,
    /// Nothing was received before the deadline
    TimedOut,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    send_at: Option<Instant>,
    timeout_at: Option<Instant>,
    /// Latest instant by which the peer must have been heard from
    deadline: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            send_at: None,
            timeout_at: None,
            deadline: None,
        }
    }

    /// Negotiated interval in seconds; the timeout is twice the interval
    pub fn from_secs(secs: u64) -> Self {
        let interval = Duration::from_secs(secs);
        Self::new(interval, interval * 2)
    }

    /// A monitor that never fires
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm both timers once the connection starts working
    pub fn start(&mut self, now: Instant) {
        self.stop();
        self.reset(now);
    }

    /// The peer was heard from: restart the send timer and push the deadline
    ///
    /// An armed timeout timer is left where it is; when it fires early
    /// against the moved deadline, `poll` re-arms it for the remaining gap.
    pub fn on_received(&mut self, now: Instant) {
        self.reset(now);
    }

    fn reset(&mut self, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        self.send_at = Some(now + self.interval);
        self.deadline = Some(now + self.timeout);
        if self.timeout_at.is_none() {
            self.timeout_at = self.deadline;
        }
    }

    /// Cancel both timers
    pub fn stop(&mut self) {
        self.send_at = None;
        self.timeout_at = None;
        self.deadline = None;
    }

    /// Earliest instant at which `poll` has work to do
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.send_at, self.timeout_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire whichever timers are due at `now`
    ///
    /// The timeout is checked first. A tick that reports `TimedOut` does
    /// not also report `Send`. A timeout is reported at most once; the
    /// send timer keeps running and the timeout timer stays disarmed until
    /// the peer is heard from again.
    pub fn poll(&mut self, now: Instant) -> Vec<HeartbeatEvent> {
        let mut events = Vec::new();

        if self.timeout_at.map_or(false, |at| at <= now) {
            let gap = self
                .deadline
                .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(now));
            if gap > DRIFT_THRESHOLD {
                // Deadline moved since the timer was armed
                self.timeout_at = Some(now + gap);
            } else {
                events.push(HeartbeatEvent::TimedOut);
                self.timeout_at = None;
                self.deadline = None;
            }
        }

        if self.send_at.map_or(false, |at| at <= now) {
            if events.is_empty() {
                events.push(HeartbeatEvent::Send);
            }
            self.send_at = Some(now + self.interval);
        }

        events
    }
}

/// Sleep until `wakeup`, or forever when nothing is scheduled
pub async fn sleep_until_wakeup(wakeup: Option<Instant>) {
    match wakeup {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
