//! Monotonic time helpers shared by the timer backends, the timer service and
//! the dispatch loop.
//!
//! All deadline arithmetic goes through [`advance_past`], so a periodic source
//! always moves forward by whole periods and never lands on a value that
//! forward stepping could not reach.

use std::time::{Duration, Instant};

/// Source of monotonic time plus the matching sleep primitive.
///
/// The dispatch loop only talks to time through this trait so tests can drive
/// it with a synthetic clock.
pub trait Clock: Send {
    fn now(&self) -> Instant;

    /// Sleeps for `duration`. A zero duration returns immediately.
    fn sleep(&self, duration: Duration);
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        sleep_for(duration);
    }
}

/// Sleeps for `duration`, returning at once for a zero duration.
pub fn sleep_for(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

/// Sleeps until `deadline`. Deadlines in the past return at once.
pub fn sleep_until(deadline: Instant) {
    sleep_for(deadline.saturating_duration_since(Instant::now()));
}

/// Moves `deadline` forward by the smallest positive number of `period`s that
/// puts it strictly after `now`.
///
/// Returns the new deadline and the number of periods stepped. When `now` is
/// still before `deadline` nothing moves and the step count is zero.
pub fn advance_past(deadline: Instant, period: Duration, now: Instant) -> (Instant, u64) {
    if now < deadline || period.is_zero() {
        return (deadline, 0);
    }

    let behind = (now - deadline).as_nanos();
    let period_ns = period.as_nanos();
    let steps = behind / period_ns + 1;
    let shift = from_nanos(steps * period_ns);

    (deadline + shift, u64::try_from(steps).unwrap_or(u64::MAX))
}

/// Whole microseconds in `duration`, saturating at `u64::MAX`.
pub fn as_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Builds a duration from a nanosecond count, saturating at [`Duration::MAX`].
pub fn from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    match u64::try_from(nanos / NANOS_PER_SEC) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}

/// Mean of `count` durations summing to `total`, zero when `count` is zero.
pub fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    from_nanos(total.as_nanos() / u128::from(count))
}
