use super::DispatchError;
use crate::clock;
use chrono::{DateTime, Local};
use std::time::{Duration, Instant};
use tracing::info;

/// Refresh period the scale factors are relative to.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_micros(10_000);

pub const MIN_PRECISION_BITS: u8 = 1;
pub const MAX_PRECISION_BITS: u8 = 16;

/// Period and derived scale factors, resolved once before the loop runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopTiming {
    pub period: Duration,
    /// Idle iterations before relative (mouse) axes fall back to neutral.
    pub postpone_count: u32,
    pub max_axis_value: u32,
    pub mean_axis_value: u32,
    /// Output range relative to an 8 bit axis.
    pub axis_scale: f64,
    /// Default period over the configured one.
    pub frequency_scale: f64,
}

impl LoopTiming {
    pub fn resolve(period: Duration, precision_bits: u8) -> Result<Self, DispatchError> {
        if period.is_zero() {
            return Err(DispatchError::ConfigurationError(
                "refresh period must be positive".to_string(),
            ));
        }
        if !(MIN_PRECISION_BITS..=MAX_PRECISION_BITS).contains(&precision_bits) {
            return Err(DispatchError::ConfigurationError(format!(
                "precision must be between {} and {} bits, got {}",
                MIN_PRECISION_BITS, MAX_PRECISION_BITS, precision_bits
            )));
        }

        let period_us = period.as_micros();
        let default_us = DEFAULT_REFRESH_PERIOD.as_micros();
        let postpone_count = u32::try_from(3 * default_us / period_us)
            .unwrap_or(u32::MAX)
            .max(1);

        let max_axis_value = (1u32 << precision_bits) - 1;

        Ok(Self {
            period,
            postpone_count,
            max_axis_value,
            mean_axis_value: max_axis_value / 2,
            axis_scale: f64::from(max_axis_value) / 255.0,
            frequency_scale: default_us as f64 / period_us as f64,
        })
    }
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            period: DEFAULT_REFRESH_PERIOD,
            postpone_count: 3,
            max_axis_value: 255,
            mean_axis_value: 127,
            axis_scale: 1.0,
            frequency_scale: 1.0,
        }
    }
}

/// Single-writer record of the last iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    pub period: Duration,
    pub last_iteration_start: Option<Instant>,
    pub last_iteration_duration: Duration,
}

impl LoopState {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_iteration_start: None,
            last_iteration_duration: Duration::ZERO,
        }
    }
}

/// Counters for the periodic loop report.
#[derive(Debug, Clone)]
pub struct LoopStats {
    pub started_at: DateTime<Local>,
    pub iterations: u64,
    pub overruns: u64,
    pub worst_overrun: Duration,
    pub busy: Duration,
    window_start: Option<Instant>,
    window_iterations: u64,
    window_overruns: u64,
    window_busy: Duration,
}

impl Default for LoopStats {
    fn default() -> Self {
        Self {
            started_at: Local::now(),
            iterations: 0,
            overruns: 0,
            worst_overrun: Duration::ZERO,
            busy: Duration::ZERO,
            window_start: None,
            window_iterations: 0,
            window_overruns: 0,
            window_busy: Duration::ZERO,
        }
    }
}

impl LoopStats {
    pub fn record(&mut self, elapsed: Duration, overrun: Option<Duration>) {
        self.iterations += 1;
        self.window_iterations += 1;
        self.busy += elapsed;
        self.window_busy += elapsed;

        if let Some(overrun) = overrun {
            self.overruns += 1;
            self.window_overruns += 1;
            self.worst_overrun = self.worst_overrun.max(overrun);
        }
    }

    /// Logs the window counters once `interval` has passed since the window
    /// opened. Returns whether a report was emitted.
    pub fn maybe_report(&mut self, now: Instant, interval: Duration) -> bool {
        let Some(window_start) = self.window_start else {
            self.window_start = Some(now);
            return false;
        };
        if interval.is_zero() || now.duration_since(window_start) < interval {
            return false;
        }

        let average_busy = clock::average(self.window_busy, self.window_iterations);
        info!(
            "Loop stats: {} iterations, {} overruns, average busy {:?}, worst overrun {:?} (running since {})",
            self.window_iterations,
            self.window_overruns,
            average_busy,
            self.worst_overrun,
            self.started_at.format("%H:%M:%S")
        );

        self.window_start = Some(now);
        self.window_iterations = 0;
        self.window_overruns = 0;
        self.window_busy = Duration::ZERO;
        true
    }
}

/// Lets a repeated message through at most once per interval.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    min_interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(n)` when the caller should log now, `n` being the number of
    /// messages swallowed since the last one.
    pub fn check(&mut self, now: Instant) -> Option<u64> {
        let due = self
            .last
            .map_or(true, |last| now.duration_since(last) >= self.min_interval);

        if due {
            self.last = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}
