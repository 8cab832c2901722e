//! Best effort real-time scheduling for the control thread.

use std::io;
use tracing::{debug, info, warn};

/// Priority requested by default, clamped to what the platform allows.
pub const DEFAULT_RT_PRIORITY: i32 = 99;

/// Result of an elevation attempt. None of these is an error for the caller.
#[derive(Debug)]
pub enum Elevation {
    Applied { priority: i32 },
    Denied(io::Error),
    Unsupported,
}

impl Elevation {
    pub fn is_applied(&self) -> bool {
        matches!(self, Elevation::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityElevator {
    priority: i32,
}

impl Default for PriorityElevator {
    fn default() -> Self {
        Self::new(DEFAULT_RT_PRIORITY)
    }
}

impl PriorityElevator {
    pub fn new(priority: i32) -> Self {
        Self { priority }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Moves the calling thread to `SCHED_FIFO`.
    ///
    /// Never fails: a missing privilege or an unsupported platform is logged
    /// and the thread stays at its current priority. Calling it again simply
    /// reapplies the same policy.
    pub fn elevate(&self) -> Elevation {
        let elevation = apply_fifo(self.priority);
        match &elevation {
            Elevation::Applied { priority } => {
                info!("Running with SCHED_FIFO priority {}", priority)
            }
            Elevation::Denied(e) => {
                warn!("Real-time priority denied, staying at default priority: {}", e)
            }
            Elevation::Unsupported => {
                warn!("Real-time priority not supported on this platform")
            }
        }
        elevation
    }
}

#[cfg(unix)]
fn clamp_priority(requested: i32) -> i32 {
    // SAFETY: pure queries without pointers
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    if min < 0 || max < 0 {
        return requested;
    }
    let clamped = requested.clamp(min, max);
    if clamped != requested {
        debug!("Clamped priority {} into [{}, {}]", requested, min, max);
    }
    clamped
}

#[cfg(target_os = "linux")]
fn apply_fifo(requested: i32) -> Elevation {
    let priority = clamp_priority(requested);
    // SAFETY: all-zero is a valid sched_param
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;

    // SAFETY: `param` is initialised and outlives the call
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        Elevation::Applied { priority }
    } else {
        Elevation::Denied(io::Error::last_os_error())
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn apply_fifo(requested: i32) -> Elevation {
    let priority = clamp_priority(requested);
    // SAFETY: all-zero is a valid sched_param
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;

    // SAFETY: `pthread_self` is always valid for the calling thread
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        Elevation::Applied { priority }
    } else {
        Elevation::Denied(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(not(unix))]
fn apply_fifo(_requested: i32) -> Elevation {
    Elevation::Unsupported
}
