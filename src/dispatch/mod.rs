//! Fixed-period control loop
//!
//! ```text
//! Initializing ──initialize()──► Running ──run()──► Terminated
//!      │                           │
//!      └─► Validated (check only)  └─ capture → process → transmit → measure → sleep | warn
//! ```
//!
//! Every iteration starts at the real current time. An iteration that took
//! longer than the period logs one overrun warning and the next one starts
//! right away; sleep debt is never carried over and no work is dropped or
//! replayed.
//!
//! The done flag is only looked at between iterations, so an iteration that
//! sees a quit event still processes and transmits its batch.

use crate::clock::{self, Clock, MonotonicClock};
use crate::controller::event_processor::Processor;
use crate::controller::{
    CaptureError, ControllerFrame, ControllerKind, InputEvent, InputSource, KeyCode, EVENT_BUFFER_SIZE,
};
use crate::priority::PriorityElevator;
use crate::transport::{SendFailurePolicy, Transport, TransportError};
use statum::{machine, state};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod timing;

use timing::{LogThrottle, LoopState, LoopStats, LoopTiming};

const SEND_FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(1);

// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
}

/// Loop parameters, fixed for the lifetime of the loop.
#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub period: Duration,
    pub precision_bits: u8,
    pub controller: ControllerKind,
    pub force_updates: bool,
    /// Key pressed once right after the transport is up.
    pub keygen: Option<String>,
    /// Run setup, then stop before the loop.
    pub check_only: bool,
    pub on_send_failure: SendFailurePolicy,
    /// Zero disables the periodic statistics report.
    pub stats_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            period: timing::DEFAULT_REFRESH_PERIOD,
            precision_bits: 8,
            controller: ControllerKind::default(),
            force_updates: false,
            keygen: None,
            check_only: false,
            on_send_failure: SendFailurePolicy::default(),
            stats_interval: Duration::from_secs(10),
        }
    }
}

/// Everything the loop mutates, built once by the caller and passed by
/// reference.
#[derive(Debug)]
pub struct AppState {
    pub done: CancellationToken,
    pub frame: ControllerFrame,
    pub loop_state: LoopState,
    pub stats: LoopStats,
}

impl AppState {
    pub fn new(done: CancellationToken) -> Self {
        Self {
            done,
            frame: ControllerFrame::neutral(ControllerKind::default(), 0),
            loop_state: LoopState::new(timing::DEFAULT_REFRESH_PERIOD),
            stats: LoopStats::default(),
        }
    }
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    OnTime { elapsed: Duration, slept: Duration },
    Overrun { elapsed: Duration, overrun: Duration },
}

/// Result of setup.
pub enum Setup {
    /// Check-only mode: setup passed, the loop is not entered.
    Validated,
    Ready(DispatchLoop<Running>),
}

// Define loop states using statum's state macro
#[state]
#[derive(Debug, Clone)]
pub enum LoopPhase {
    Initializing,
    Running,
    Terminated,
}

#[machine]
pub struct DispatchLoop<S: LoopPhase> {
    settings: LoopSettings,

    // Resolved once before the first iteration
    timing: LoopTiming,

    elevator: Option<PriorityElevator>,

    // Collaborators
    input: Box<dyn InputSource>,
    processor: Box<dyn Processor>,
    transport: Box<dyn Transport>,
    clock: Box<dyn Clock>,

    // Capture buffer, reused every iteration
    events: Vec<InputEvent>,

    send_failures: LogThrottle,
}

impl<S: LoopPhase> DispatchLoop<S> {
    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn timing(&self) -> &LoopTiming {
        &self.timing
    }
}

impl DispatchLoop<Initializing> {
    /// Resolves the period and scale factors. Nothing is touched yet.
    pub fn create(
        settings: LoopSettings,
        input: Box<dyn InputSource>,
        processor: Box<dyn Processor>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, DispatchError> {
        let timing = LoopTiming::resolve(settings.period, settings.precision_bits)?;
        debug!("Creating dispatch loop with {:?}", timing);

        Ok(Self::new(
            settings,
            timing,
            Some(PriorityElevator::default()),
            input,
            processor,
            transport,
            Box::new(MonotonicClock),
            Vec::with_capacity(EVENT_BUFFER_SIZE),
            LogThrottle::new(SEND_FAILURE_LOG_INTERVAL),
        ))
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// `None` keeps the default scheduling class.
    pub fn with_elevator(mut self, elevator: Option<PriorityElevator>) -> Self {
        self.elevator = elevator;
        self
    }

    /// Runs setup: priority, processor configuration, initial frame, key
    /// lookup, then (unless checking only) transport connect and key
    /// injection.
    pub fn initialize(mut self, state: &mut AppState) -> Result<Setup, DispatchError> {
        if let Some(elevator) = &self.elevator {
            elevator.elevate();
        }

        self.processor.configure(&self.timing);
        state.frame = ControllerFrame::neutral(self.settings.controller, self.timing.mean_axis_value);
        state.loop_state = LoopState::new(self.timing.period);

        let keygen = match &self.settings.keygen {
            Some(name) => match KeyCode::from_name(name) {
                Some(key) => Some(key),
                None => {
                    error!("Unknown key name for keygen: {}", name);
                    return Err(DispatchError::ConfigurationError(format!(
                        "unknown key name '{}'",
                        name
                    )));
                }
            },
            None => None,
        };

        if self.settings.check_only {
            info!("Configuration check passed, not entering the control loop");
            return Ok(Setup::Validated);
        }

        self.transport.connect()?;
        info!("Connected to {}", self.transport.describe());

        if let Some(key) = keygen {
            info!("Injecting key {}", key);
            self.input.inject(InputEvent::Key { key, pressed: true });
        }

        info!(
            "Dispatch loop ready: {} every {:?}, input from {}",
            self.settings.controller,
            self.timing.period,
            self.input.describe()
        );
        Ok(Setup::Ready(self.transition()))
    }
}

impl DispatchLoop<Running> {
    /// One capture → process → transmit → measure → sleep/warn pass.
    ///
    /// # Errors
    ///
    /// Only a send failure under [`SendFailurePolicy::Abort`].
    pub fn iterate(&mut self, state: &mut AppState) -> Result<Iteration, DispatchError> {
        let period = self.timing.period;
        let t0 = self.clock.now();
        state.loop_state.last_iteration_start = Some(t0);

        // Capture
        self.events.clear();
        match self.input.poll_events(&mut self.events, EVENT_BUFFER_SIZE) {
            Ok(count) if count >= EVENT_BUFFER_SIZE => {
                warn!("Event buffer too small, {} events captured this iteration", count)
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to capture events: {}", e),
        }
        if self.events.iter().any(InputEvent::is_termination) {
            info!("Termination requested by input");
            state.done.cancel();
        }

        // Process
        self.processor.process(&self.events, &mut state.frame);

        // Transmit
        if let Err(e) = self.transport.send(&state.frame, self.settings.force_updates) {
            match self.settings.on_send_failure {
                SendFailurePolicy::Abort => {
                    error!("Send to {} failed, stopping: {}", self.transport.describe(), e);
                    return Err(e.into());
                }
                SendFailurePolicy::Continue => {
                    if let Some(suppressed) = self.send_failures.check(t0) {
                        warn!(
                            "Send to {} failed ({} similar failures suppressed): {}",
                            self.transport.describe(),
                            suppressed,
                            e
                        );
                    }
                }
            }
        }

        // Measure
        let t1 = self.clock.now();
        let elapsed = t1.saturating_duration_since(t0);
        state.loop_state.last_iteration_duration = elapsed;

        let iteration = if elapsed < period {
            let remaining = period - elapsed;
            self.clock.sleep(remaining);
            state.stats.record(elapsed, None);
            Iteration::OnTime {
                elapsed,
                slept: remaining,
            }
        } else {
            let overrun = elapsed - period;
            warn!(
                "Processing time higher than {}us: {}us",
                period.as_micros(),
                elapsed.as_micros()
            );
            state.stats.record(elapsed, Some(overrun));
            Iteration::Overrun { elapsed, overrun }
        };

        state.stats.maybe_report(t1, self.settings.stats_interval);
        Ok(iteration)
    }

    /// Iterates until the done flag is set.
    pub fn run(mut self, state: &mut AppState) -> Result<DispatchLoop<Terminated>, DispatchError> {
        info!("Entering control loop");
        while !state.done.is_cancelled() {
            self.iterate(state)?;
        }
        info!("Control loop finished");
        Ok(self.transition())
    }
}

impl DispatchLoop<Terminated> {
    pub fn report(&self, state: &AppState) {
        let stats = &state.stats;
        let average_busy = clock::average(stats.busy, stats.iterations);
        info!(
            "Ran {} iterations since {}: {} overruns, worst overrun {:?}, average busy {:?}",
            stats.iterations,
            stats.started_at.format("%H:%M:%S"),
            stats.overruns,
            stats.worst_overrun,
            average_busy
        );
    }
}
