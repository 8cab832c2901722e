//! Wait-object backend.
//!
//! Each periodic source is an in-process wait object holding its next expiry.
//! `wait` sleeps until the earliest expiry (or the caller's timeout) and then
//! signals every object that is due. Objects that fell behind are rearmed past
//! the current time, so a late wake reports one expiry rather than a burst.
//! Works on every platform; descriptor sources are not supported.

use super::{Backend, PollError, Readiness, Source, SourceId};
use crate::clock;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct WaitObject {
    period: Duration,
    expiry: Instant,
}

#[derive(Debug, Default)]
pub struct WaitBackend {
    objects: BTreeMap<SourceId, WaitObject>,
}

impl WaitBackend {
    pub fn new() -> Result<Self, PollError> {
        Ok(Self::default())
    }

    /// Earliest pending expiry, if any object is armed.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.objects.values().map(|object| object.expiry).min()
    }
}

impl Backend for WaitBackend {
    fn start(&mut self, id: SourceId, source: &Source) -> Result<(), PollError> {
        match *source {
            Source::Timer { period } => {
                if period.is_zero() {
                    return Err(PollError::InvalidArgument(
                        "timer period must be positive".to_string(),
                    ));
                }
                self.objects.insert(
                    id,
                    WaitObject {
                        period,
                        expiry: Instant::now() + period,
                    },
                );
                Ok(())
            }
            #[cfg(unix)]
            Source::Fd { fd, .. } => Err(PollError::Unsupported(format!(
                "descriptor {} needs the descriptor backend",
                fd
            ))),
        }
    }

    fn cancel(&mut self, id: SourceId) {
        self.objects.remove(&id);
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(SourceId, Readiness)>,
    ) -> Result<(), PollError> {
        let now = Instant::now();
        let limit = timeout.map(|timeout| now + timeout);

        let wake = match (self.next_expiry(), limit) {
            (Some(expiry), Some(limit)) => expiry.min(limit),
            (Some(expiry), None) => expiry,
            (None, Some(limit)) => limit,
            (None, None) => return Err(PollError::NoSources),
        };
        clock::sleep_until(wake);

        let now = Instant::now();
        for (id, object) in self.objects.iter_mut() {
            if object.expiry <= now {
                let (expiry, steps) = clock::advance_past(object.expiry, object.period, now);
                if steps > 1 {
                    trace!("{} expired {} times since last wake", id, steps);
                }
                object.expiry = expiry;
                ready.push((*id, Readiness::TimerFired));
            }
        }

        Ok(())
    }
}
