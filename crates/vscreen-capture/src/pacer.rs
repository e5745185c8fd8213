//! Fixed-rate capture deadlines.

use std::time::{Duration, Instant};

/// Deadline advanced by one period per capture. When the producer falls
/// behind, whole periods are skipped instead of bursting to catch up, so the
/// deadline never drifts and never lags more than one period.
#[derive(Debug, Clone)]
pub struct FramePacer {
    period: Duration,
    deadline: Instant,
}

impl FramePacer {
    /// The first deadline is `start`, so the first capture happens immediately.
    pub fn new(period: Duration, start: Instant) -> Self {
        Self { period: period.max(Duration::from_micros(1)), deadline: start }
    }

    pub fn from_fps(fps: u32, start: Instant) -> Self {
        Self::new(Duration::from_nanos(1_000_000_000 / fps.max(1) as u64), start)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline; zero when overdue.
    pub fn timeout(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Move to the next deadline after a capture attempt. Returns how many
    /// extra periods were skipped because `now` was already past them.
    pub fn advance(&mut self, now: Instant) -> u64 {
        self.deadline += self.period;
        let mut skipped = 0;
        while self.deadline <= now {
            self.deadline += self.period;
            skipped += 1;
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_count_matches_rate() {
        let start = Instant::now();
        for (fps, secs) in [(60u32, 1u64), (30, 2), (24, 3)] {
            let mut pacer = FramePacer::from_fps(fps, start);
            let end = start + Duration::from_secs(secs);
            let mut now = start;
            let mut requests = 0u64;
            while now < end {
                if pacer.is_due(now) {
                    requests += 1;
                    assert_eq!(pacer.advance(now), 0);
                }
                // Sleep exactly until the deadline.
                now += pacer.timeout(now);
            }
            let expected = fps as u64 * secs;
            assert!(requests.abs_diff(expected) <= 1, "fps={fps} got {requests}");
        }
    }

    #[test]
    fn overrun_skips_whole_periods() {
        let start = Instant::now();
        let period = Duration::from_millis(10);
        let mut pacer = FramePacer::new(period, start);

        // Capture took 35ms: deadlines at 10, 20, 30 are gone.
        let now = start + Duration::from_millis(35);
        assert!(pacer.is_due(now));
        assert_eq!(pacer.advance(now), 3);
        assert_eq!(pacer.deadline(), start + Duration::from_millis(40));
        assert!(!pacer.is_due(now));
        assert_eq!(pacer.timeout(now), Duration::from_millis(5));
    }

    #[test]
    fn deadline_on_boundary_is_skipped() {
        let start = Instant::now();
        let mut pacer = FramePacer::new(Duration::from_millis(10), start);
        let now = start + Duration::from_millis(10);
        assert_eq!(pacer.advance(now), 1);
        assert_eq!(pacer.deadline(), start + Duration::from_millis(20));
    }

    #[test]
    fn timeout_is_zero_when_overdue() {
        let start = Instant::now();
        let pacer = FramePacer::new(Duration::from_millis(5), start);
        assert_eq!(pacer.timeout(start + Duration::from_millis(9)), Duration::ZERO);
    }
}
