//! Dataplane counters and rate limiting for hot-path logging.

use std::time::{Duration, Instant};
use tracing::info;

/// Plain counters owned by the dataplane thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub loop_iterations: u64,
    pub tx_pulled: u64,
    pub tx_sent: u64,
    pub tx_backpressure: u64,
    pub tx_alloc_fail: u64,
    pub segments: u64,
    pub crypto_drops: u64,
    pub commands_pulled: u64,
    pub buffers_reclaimed: u64,
    pub buffers_submitted: u64,
    pub tx_complete_acks: u64,
    pub completions_sent: u64,
    pub completions_overflowed: u64,
    pub completions_drained: u64,
    pub completions_dropped: u64,
    pub protocol_violations: u64,
}

impl Stats {
    /// Emit the counters accumulated since `prev` as one log line.
    pub fn log_delta(&self, prev: &Stats) {
        info!(
            loops = self.loop_iterations - prev.loop_iterations,
            tx_pulled = self.tx_pulled - prev.tx_pulled,
            tx_sent = self.tx_sent - prev.tx_sent,
            tx_backpressure = self.tx_backpressure - prev.tx_backpressure,
            tx_alloc_fail = self.tx_alloc_fail - prev.tx_alloc_fail,
            segments = self.segments - prev.segments,
            crypto_drops = self.crypto_drops - prev.crypto_drops,
            commands = self.commands_pulled - prev.commands_pulled,
            completions = self.completions_sent - prev.completions_sent,
            overflowed = self.completions_overflowed - prev.completions_overflowed,
            drained = self.completions_drained - prev.completions_drained,
            dropped = self.completions_dropped - prev.completions_dropped,
            violations = self.protocol_violations - prev.protocol_violations,
            "dataplane stats"
        );
    }
}

/// Periodic stats reporting.
#[derive(Debug)]
pub struct StatsReporter {
    interval: Option<Duration>,
    last: Instant,
    prev: Stats,
}

impl StatsReporter {
    /// `interval_ms == 0` disables reporting.
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            last: Instant::now(),
            prev: Stats::default(),
        }
    }

    pub fn maybe_report(&mut self, stats: &Stats) {
        let Some(interval) = self.interval else {
            return;
        };
        if self.last.elapsed() < interval {
            return;
        }
        stats.log_delta(&self.prev);
        self.prev = stats.clone();
        self.last = Instant::now();
    }
}

/// Lets one event through per interval and counts the ones it swallowed.
#[derive(Debug)]
pub struct RateLimit {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimit {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed)` when the caller should log now, with the
    /// number of events dropped since the last time.
    pub fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_suppresses() {
        let mut rl = RateLimit::new(Duration::from_secs(3600));
        assert_eq!(rl.check(), Some(0));
        assert_eq!(rl.check(), None);
        assert_eq!(rl.check(), None);
        assert_eq!(rl.suppressed, 2);
    }

    #[test]
    fn test_rate_limit_zero_interval() {
        let mut rl = RateLimit::new(Duration::ZERO);
        assert_eq!(rl.check(), Some(0));
        assert_eq!(rl.check(), Some(0));
    }

    #[test]
    fn test_reporter_tracks_last_report() {
        let mut r = StatsReporter::new(1);
        let stats = Stats {
            loop_iterations: 10,
            tx_sent: 3,
            ..Default::default()
        };
        std::thread::sleep(Duration::from_millis(5));
        r.maybe_report(&stats);
        assert_eq!(r.prev, stats);

        // Not due again yet with a long interval.
        let mut r = StatsReporter::new(3_600_000);
        r.maybe_report(&stats);
        assert_eq!(r.prev, Stats::default());
    }

    #[test]
    fn test_reporter_disabled() {
        let mut r = StatsReporter::new(0);
        assert!(r.interval.is_none());
        r.maybe_report(&Stats::default());
    }
}
