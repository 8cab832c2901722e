//! Periodic timers on top of the readiness multiplexer.
//!
//! Every timer owns a [`Deadline`]. The backend supplies the wake ups, the
//! service decides what a wake means: on time or late wakes run the consumer
//! callback with the observed jitter and move the deadline forward by whole
//! periods, early wakes are a [`TimingAnomaly`] handled per [`AnomalyPolicy`].
//!
//! The deadline is taken before the wake source is armed, so a healthy backend
//! can only ever wake at or after it.

use crate::poll::{Backend, Callbacks, DefaultBackend, Flow, Multiplexer, PollError, Source, SourceId, Token};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub mod deadline;
pub mod stats;

pub use deadline::{Deadline, Tick, TimingAnomaly};
pub use stats::JitterStats;

/// Lateness, in percent of the period, above which a tick is logged.
pub const DEFAULT_TOLERANCE_PERCENT: u64 = 10;

/// Handle of a running timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

impl TimerId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// What to do with a wake that arrives before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyPolicy {
    /// Stop polling and surface [`TimerError::Anomaly`].
    Strict,
    /// Log it, skip the callback and keep the deadline.
    #[default]
    Lenient,
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{timer} woke {early_by:?} before its deadline")]
    Anomaly { timer: TimerId, early_by: Duration },

    #[error(transparent)]
    Poll(#[from] PollError),
}

type CloseCallback = Box<dyn FnOnce(TimerId)>;

struct TimerCore {
    deadline: Deadline,
    stats: JitterStats,
    close: Option<CloseCallback>,
}

impl TimerCore {
    fn run_close(&mut self, id: TimerId) {
        if let Some(close) = self.close.take() {
            close(id);
        }
    }
}

struct TimerSlot {
    source: SourceId,
    core: Rc<RefCell<TimerCore>>,
}

/// Owner of all periodic timers and of the multiplexer they live on.
///
/// Other sources may share the multiplexer through
/// [`multiplexer_mut`](Self::multiplexer_mut); polling through the service
/// dispatches them too.
pub struct TimerService<B: Backend = DefaultBackend> {
    mux: Multiplexer<B>,
    timers: HashMap<TimerId, TimerSlot>,
    next_id: u32,
    policy: AnomalyPolicy,
    tolerance_percent: u64,
    fault: Rc<Cell<Option<(TimerId, Duration)>>>,
}

impl TimerService<DefaultBackend> {
    pub fn new(policy: AnomalyPolicy) -> Result<Self, TimerError> {
        Ok(Self::with_multiplexer(Multiplexer::new()?, policy))
    }
}

impl<B: Backend> TimerService<B> {
    pub fn with_multiplexer(mux: Multiplexer<B>, policy: AnomalyPolicy) -> Self {
        Self {
            mux,
            timers: HashMap::new(),
            next_id: 0,
            policy,
            tolerance_percent: DEFAULT_TOLERANCE_PERCENT,
            fault: Rc::new(Cell::new(None)),
        }
    }

    /// Sets the lateness threshold for the per-tick warning. Applies to
    /// timers started afterwards.
    pub fn with_tolerance(mut self, percent: u64) -> Self {
        self.tolerance_percent = percent;
        self
    }

    pub fn policy(&self) -> AnomalyPolicy {
        self.policy
    }

    pub fn multiplexer(&self) -> &Multiplexer<B> {
        &self.mux
    }

    pub fn multiplexer_mut(&mut self) -> &mut Multiplexer<B> {
        &mut self.mux
    }

    /// Starts a periodic timer. The first deadline is one period from now.
    ///
    /// `read_cb` receives the timer id and how late the wake was relative to
    /// the deadline. `close_cb` runs exactly once, on [`close`](Self::close)
    /// or when the wake source reports `Closed`.
    pub fn start<R, C>(&mut self, period: Duration, mut read_cb: R, close_cb: C) -> Result<TimerId, TimerError>
    where
        R: FnMut(TimerId, Duration) -> Flow + 'static,
        C: FnOnce(TimerId) + 'static,
    {
        if period.is_zero() {
            return Err(TimerError::InvalidArgument(
                "timer period must be positive".to_string(),
            ));
        }

        let id = self.allocate_id();
        let core = Rc::new(RefCell::new(TimerCore {
            deadline: Deadline::starting_at(Instant::now(), period),
            stats: JitterStats::default(),
            close: Some(Box::new(close_cb)),
        }));

        let on_wake = {
            let core = Rc::clone(&core);
            let fault = Rc::clone(&self.fault);
            let policy = self.policy;
            let tolerance = self.tolerance_percent;
            move |_: SourceId, _: Token| {
                let now = Instant::now();
                let observed = {
                    let mut core = core.borrow_mut();
                    let observed = core.deadline.observe(now);
                    match &observed {
                        Ok(tick) => core.stats.record(tick),
                        Err(_) => core.stats.record_anomaly(),
                    }
                    observed
                };

                let tick = match observed {
                    Ok(tick) => tick,
                    Err(anomaly) => {
                        return match policy {
                            AnomalyPolicy::Strict => {
                                error!("{} fired {:?} early", id, anomaly.early_by);
                                fault.set(Some((id, anomaly.early_by)));
                                Flow::Stop
                            }
                            AnomalyPolicy::Lenient => {
                                warn!("{} fired {:?} early, ignoring wake", id, anomaly.early_by);
                                Flow::Continue
                            }
                        };
                    }
                };

                if tick.coalesced > 0 {
                    debug!("{} coalesced {} missed ticks", id, tick.coalesced);
                }
                if stats::percent_of(tick.jitter, period) > tolerance {
                    warn!(
                        "{} is {:?} late, more than {}% of its {:?} period",
                        id, tick.jitter, tolerance, period
                    );
                }

                read_cb(id, tick.jitter)
            }
        };

        let on_closed = {
            let core = Rc::clone(&core);
            move |source: SourceId, _: Token| {
                warn!("Wake source {} of {} closed", source, id);
                core.borrow_mut().run_close(id);
                Flow::Continue
            }
        };

        let source = self.mux.register(
            Source::Timer { period },
            Token(id.0 as usize),
            Callbacks::new().on_read(on_wake).on_close(on_closed),
        )?;

        info!("Started {} every {:?} on {}", id, period, source);
        self.timers.insert(id, TimerSlot { source, core });
        Ok(id)
    }

    /// Runs the close callback, unregisters the wake source and frees the
    /// slot. Returns `false` for unknown or already closed timers.
    pub fn close(&mut self, id: TimerId) -> bool {
        let Some(slot) = self.timers.remove(&id) else {
            debug!("Ignoring close of unknown {}", id);
            return false;
        };

        slot.core.borrow_mut().run_close(id);
        self.mux.unregister(slot.source);
        debug!("Closed {}", id);
        true
    }

    pub fn close_all(&mut self) {
        for id in self.ids() {
            self.close(id);
        }
    }

    /// Waits for the next wake(s) and dispatches them.
    pub fn poll(&mut self) -> Result<Flow, TimerError> {
        self.poll_timeout(None)
    }

    /// Like [`poll`](Self::poll) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`TimerError::Anomaly`] when a timer woke early under the strict
    /// policy, or whatever the multiplexer reports.
    pub fn poll_timeout(&mut self, timeout: Option<Duration>) -> Result<Flow, TimerError> {
        let flow = self.mux.poll_timeout(timeout)?;

        // Sources that reported Closed are already gone from the multiplexer
        let mux = &self.mux;
        self.timers.retain(|_, slot| mux.contains(slot.source));

        if let Some((timer, early_by)) = self.fault.take() {
            return Err(TimerError::Anomaly { timer, early_by });
        }
        Ok(flow)
    }

    pub fn next_deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers
            .get(&id)
            .map(|slot| slot.core.borrow().deadline.next())
    }

    pub fn period(&self, id: TimerId) -> Option<Duration> {
        self.timers
            .get(&id)
            .map(|slot| slot.core.borrow().deadline.period())
    }

    pub fn stats(&self, id: TimerId) -> Option<JitterStats> {
        self.timers.get(&id).map(|slot| slot.core.borrow().stats)
    }

    /// Running timers in start order.
    pub fn ids(&self) -> Vec<TimerId> {
        let mut ids: Vec<_> = self.timers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn allocate_id(&mut self) -> TimerId {
        loop {
            let id = TimerId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.timers.contains_key(&id) {
                return id;
            }
        }
    }
}
