//! Heartbeat-driven liveness tracking for one connection.
//!
//! The tracker only answers one question: when a read comes back empty,
//! is the client merely quiet or has it been silent longer than allowed?

use tokio::time::{Duration, Instant};

/// Classification of an empty read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Quiet, but within the timeout (or never heard from yet).
    AliveIdle,
    /// Silent for longer than the timeout.
    Dead,
}

/// Per-connection heartbeat state.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    /// Instant of the most recent connect, heartbeat or message.
    last_heartbeat_at: Option<Instant>,
    /// Silence tolerated before the connection counts as dead.
    timeout: Duration,
    /// Factor applied to the client-declared heartbeat interval.
    multiplier: f64,
    negotiated: bool,
}

impl LivenessTracker {
    /// Create a tracker using `default_timeout` until a client negotiates.
    pub fn new(default_timeout: Duration, multiplier: f64) -> Self {
        Self {
            last_heartbeat_at: None,
            timeout: default_timeout,
            multiplier,
            negotiated: false,
        }
    }

    /// Record client activity at `now`.
    ///
    /// The stored instant never moves backwards.
    pub fn on_activity(&mut self, now: Instant) {
        match self.last_heartbeat_at {
            Some(previous) if previous >= now => {}
            _ => self.last_heartbeat_at = Some(now),
        }
    }

    /// Fix the timeout from the client's declared heartbeat interval.
    ///
    /// Only the first call has an effect; returns whether it applied.
    pub fn negotiate(&mut self, heartbeat_interval: Duration) -> bool {
        if self.negotiated {
            return false;
        }
        let secs = heartbeat_interval.as_secs_f64() * self.multiplier;
        self.timeout = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        self.negotiated = true;
        true
    }

    /// Decide what an empty read at `now` means.
    pub fn classify_empty_read(&self, now: Instant) -> Liveness {
        match self.last_heartbeat_at {
            Some(at) if now.saturating_duration_since(at) > self.timeout => Liveness::Dead,
            _ => Liveness::AliveIdle,
        }
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.last_heartbeat_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_never_dead_before_first_activity() {
        let tracker = LivenessTracker::new(secs(1), 2.0);
        let far_future = Instant::now() + secs(3600);
        assert_eq!(tracker.classify_empty_read(far_future), Liveness::AliveIdle);
    }

    #[test]
    fn test_activity_is_monotonic() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(secs(10), 2.0);

        let times = [start, start + secs(1), start + secs(5), start + secs(7)];
        for t in times {
            tracker.on_activity(t);
            assert_eq!(tracker.last_heartbeat_at(), Some(t));
        }

        // A stale timestamp does not rewind the tracker.
        tracker.on_activity(start + secs(2));
        assert_eq!(tracker.last_heartbeat_at(), Some(start + secs(7)));
    }

    #[test]
    fn test_classification_boundary() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(secs(30), 3.0);
        assert!(tracker.negotiate(secs(2)));
        assert_eq!(tracker.timeout(), secs(6));
        tracker.on_activity(start);

        for (elapsed_ms, expected) in [
            (0, Liveness::AliveIdle),
            (5_999, Liveness::AliveIdle),
            (6_000, Liveness::AliveIdle),
            (6_001, Liveness::Dead),
            (60_000, Liveness::Dead),
        ] {
            let now = start + Duration::from_millis(elapsed_ms);
            assert_eq!(tracker.classify_empty_read(now), expected, "{elapsed_ms}ms");
        }
    }

    #[test]
    fn test_activity_revives_quiet_connection() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(secs(4), 1.0);
        tracker.on_activity(start);
        assert_eq!(tracker.classify_empty_read(start + secs(5)), Liveness::Dead);

        tracker.on_activity(start + secs(5));
        assert_eq!(
            tracker.classify_empty_read(start + secs(8)),
            Liveness::AliveIdle
        );
    }

    #[test]
    fn test_negotiation_is_fixed_after_first_connect() {
        let mut tracker = LivenessTracker::new(secs(30), 2.0);
        assert_eq!(tracker.timeout(), secs(30));
        assert!(!tracker.is_negotiated());

        assert!(tracker.negotiate(secs(5)));
        assert_eq!(tracker.timeout(), secs(10));
        assert!(tracker.is_negotiated());

        assert!(!tracker.negotiate(secs(1)));
        assert_eq!(tracker.timeout(), secs(10));
    }

    #[test]
    fn test_huge_interval_saturates() {
        let mut tracker = LivenessTracker::new(secs(10), 4.0);
        tracker.negotiate(Duration::MAX);
        assert_eq!(tracker.timeout(), Duration::MAX);
    }
}
