//! padlink bridges host input (gamepads, keyboard, mouse) to an emulated
//! controller behind a serial or TCP adapter, refreshed at a fixed period.
//!
//! # Layers
//!
//! ```text
//! dispatch   fixed-period loop: capture → process → transmit → measure → sleep | warn
//! timer      periodic timers, deadline arithmetic, drift catch-up
//! poll       readiness multiplexer over a pluggable wait backend
//! priority   best effort SCHED_FIFO
//! ```
//!
//! `controller`, `transport` and `config` hold the collaborators the loop
//! drives.

pub mod cli;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod poll;
pub mod priority;
pub mod timer;
pub mod transport;
