use super::deadline::Tick;
use crate::clock;
use std::time::Duration;

/// Per-timer jitter accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
    pub coalesced: u64,
    pub anomalies: u64,
}

impl JitterStats {
    pub fn record(&mut self, tick: &Tick) {
        self.count += 1;
        self.total += tick.jitter;
        self.max = self.max.max(tick.jitter);
        self.coalesced += tick.coalesced;
    }

    pub fn record_anomaly(&mut self) {
        self.anomalies += 1;
    }

    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(clock::average(self.total, self.count))
    }

    /// Average lateness as a whole percentage of `period`.
    pub fn error_percent(&self, period: Duration) -> Option<u64> {
        let average = self.average()?;
        if period.is_zero() {
            return None;
        }
        Some(percent_of(average, period))
    }
}

/// Lateness of a single tick as a whole percentage of `period`.
pub fn percent_of(jitter: Duration, period: Duration) -> u64 {
    if period.is_zero() {
        return 0;
    }
    u64::try_from(jitter.as_nanos() * 100 / period.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn tick(jitter_us: u64, coalesced: u64) -> Tick {
        Tick {
            due: Instant::now(),
            jitter: Duration::from_micros(jitter_us),
            coalesced,
        }
    }

    #[test]
    fn empty_stats_have_no_average() {
        let stats = JitterStats::default();
        assert_eq!(stats.average(), None);
        assert_eq!(stats.error_percent(Duration::from_millis(1)), None);
    }

    #[test]
    fn average_and_error_percent() {
        let mut stats = JitterStats::default();
        stats.record(&tick(100, 0));
        stats.record(&tick(300, 2));

        assert_eq!(stats.count, 2);
        assert_eq!(stats.max, Duration::from_micros(300));
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.average(), Some(Duration::from_micros(200)));
        assert_eq!(stats.error_percent(Duration::from_micros(1000)), Some(20));
    }

    #[test]
    fn percent_of_handles_zero_period() {
        assert_eq!(percent_of(Duration::from_micros(50), Duration::ZERO), 0);
        assert_eq!(percent_of(Duration::from_micros(150), Duration::from_micros(1000)), 15);
    }
}
