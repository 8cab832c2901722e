use crate::clock;
use std::time::{Duration, Instant};

/// Absolute schedule of a periodic timer.
///
/// The deadline only ever moves forward by whole periods. A wake that comes
/// late by several periods is folded into one advancement; the missed ticks
/// are counted in [`Tick::coalesced`] but never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    period: Duration,
    next: Instant,
}

/// Outcome of a wake that arrived on or after its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Deadline that was due.
    pub due: Instant,
    /// How late the wake was relative to `due`.
    pub jitter: Duration,
    /// Ticks skipped because the wake came more than a period late.
    pub coalesced: u64,
}

/// A wake observed before the scheduled deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("woke {early_by:?} before the deadline")]
pub struct TimingAnomaly {
    pub early_by: Duration,
}

impl Deadline {
    /// First deadline is one period after `start`.
    pub fn starting_at(start: Instant, period: Duration) -> Self {
        Self {
            period,
            next: start + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next(&self) -> Instant {
        self.next
    }

    /// Accounts for a wake at `now`.
    ///
    /// An early wake leaves the deadline untouched and reports the anomaly.
    /// Otherwise the deadline moves to the first period boundary after `now`.
    pub fn observe(&mut self, now: Instant) -> Result<Tick, TimingAnomaly> {
        if now < self.next {
            return Err(TimingAnomaly {
                early_by: self.next - now,
            });
        }

        let due = self.next;
        let (next, steps) = clock::advance_past(self.next, self.period, now);
        self.next = next;

        Ok(Tick {
            due,
            jitter: now - due,
            coalesced: steps.saturating_sub(1),
        })
    }
}
