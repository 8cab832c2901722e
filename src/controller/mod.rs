//! Input side of the bridge
//!
//! Two collaborators feed the dispatch loop:
//!
//! 1. [`InputSource`] - bounded batches of raw [`InputEvent`]s
//! 2. [`Processor`](event_processor::Processor) - folds a batch into the
//!    [`ControllerFrame`] handed to the transport
//!
//! ```text
//! Gamepad ──► InputSource ──► Processor ──► ControllerFrame ──► Transport
//!             (≤256 events)   (per iteration)
//! ```

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

#[cfg(feature = "gamepad")]
pub mod event_collector;
pub mod event_processor;

/// Most events pulled from a source in one capture step.
pub const EVENT_BUFFER_SIZE: usize = 256;

/// Number of axes carried by a frame.
pub const AXIS_COUNT: usize = 8;

/// Frame button that ends the session instead of being forwarded (the
/// gamepad's mode/home button).
pub const DEFAULT_QUIT_BUTTON: u8 = 16;

/// Emulated controller model announced to the receiving adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Joystick,
    #[serde(rename = "360pad")]
    #[value(name = "360pad")]
    X360Pad,
    Sixaxis,
    #[value(name = "ps2pad")]
    Ps2Pad,
    Gpp,
}

impl ControllerKind {
    pub fn wire_id(self) -> u8 {
        match self {
            ControllerKind::Joystick => 0,
            ControllerKind::X360Pad => 1,
            ControllerKind::Sixaxis => 2,
            ControllerKind::Ps2Pad => 3,
            ControllerKind::Gpp => 4,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerKind::Joystick => "joystick",
            ControllerKind::X360Pad => "360pad",
            ControllerKind::Sixaxis => "sixaxis",
            ControllerKind::Ps2Pad => "ps2pad",
            ControllerKind::Gpp => "gpp",
        };
        f.write_str(name)
    }
}

/// Keyboard key, numbered like SDL keycodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyCode(pub u32);

const SCANCODE_MASK: u32 = 1 << 30;

const NAMED_KEYS: &[(&str, u32)] = &[
    ("backspace", 8),
    ("tab", 9),
    ("return", 13),
    ("escape", 27),
    ("space", 32),
    ("delete", 127),
    ("f1", SCANCODE_MASK | 58),
    ("f2", SCANCODE_MASK | 59),
    ("f3", SCANCODE_MASK | 60),
    ("f4", SCANCODE_MASK | 61),
    ("f5", SCANCODE_MASK | 62),
    ("f6", SCANCODE_MASK | 63),
    ("f7", SCANCODE_MASK | 64),
    ("f8", SCANCODE_MASK | 65),
    ("f9", SCANCODE_MASK | 66),
    ("f10", SCANCODE_MASK | 67),
    ("f11", SCANCODE_MASK | 68),
    ("f12", SCANCODE_MASK | 69),
    ("right", SCANCODE_MASK | 79),
    ("left", SCANCODE_MASK | 80),
    ("down", SCANCODE_MASK | 81),
    ("up", SCANCODE_MASK | 82),
    ("left ctrl", SCANCODE_MASK | 224),
    ("left shift", SCANCODE_MASK | 225),
    ("left alt", SCANCODE_MASK | 226),
    ("right ctrl", SCANCODE_MASK | 228),
    ("right shift", SCANCODE_MASK | 229),
    ("right alt", SCANCODE_MASK | 230),
];

impl KeyCode {
    pub const ESCAPE: KeyCode = KeyCode(27);

    /// Resolves a key name, case insensitive. Single letters, digits and
    /// punctuation map to themselves.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();

        if let Some((_, code)) = NAMED_KEYS.iter().find(|(key, _)| *key == lower) {
            return Some(KeyCode(*code));
        }

        let mut chars = lower.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_graphic() => Some(KeyCode(c as u32)),
            _ => None,
        }
    }

    pub fn name(self) -> Option<String> {
        if let Some((name, _)) = NAMED_KEYS.iter().find(|(_, code)| *code == self.0) {
            return Some((*name).to_string());
        }
        char::from_u32(self.0)
            .filter(|c| c.is_ascii_graphic())
            .map(|c| c.to_string())
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(&name),
            None => write!(f, "key#{}", self.0),
        }
    }
}

/// Raw input as delivered by a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Quit,
    Key { key: KeyCode, pressed: bool },
    Button { device: u8, button: u8, pressed: bool },
    /// Absolute axis position, full `i16` range.
    Axis { device: u8, axis: u8, value: i16 },
    /// Relative pointer movement.
    MouseMotion { dx: i32, dy: i32 },
}

/// Discrete events apply at once, motion events are smoothed per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Discrete,
    Motion,
}

impl InputEvent {
    pub fn class(&self) -> EventClass {
        match self {
            InputEvent::Axis { .. } | InputEvent::MouseMotion { .. } => EventClass::Motion,
            _ => EventClass::Discrete,
        }
    }

    /// Quit requests and a pressed escape key end the loop.
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            InputEvent::Quit
                | InputEvent::Key {
                    key: KeyCode::ESCAPE,
                    pressed: true
                }
        )
    }
}

// Capture errors
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to initialize input capture: {0}")]
    InitializationError(String),

    #[error("Failed to collect events: {0}")]
    EventCollectionError(String),
}

/// Capture collaborator polled once per iteration.
pub trait InputSource {
    /// Appends at most `max` events to `out` without blocking and returns how
    /// many were appended.
    fn poll_events(&mut self, out: &mut Vec<InputEvent>, max: usize) -> Result<usize, CaptureError>;

    /// Queues a synthetic event ahead of the next captured ones.
    fn inject(&mut self, event: InputEvent);

    fn describe(&self) -> String;
}

/// In-memory source. Used when no device backend is compiled in and by
/// tests.
#[derive(Debug, Default)]
pub struct QueuedInput {
    queue: VecDeque<InputEvent>,
}

impl QueuedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl InputSource for QueuedInput {
    fn poll_events(&mut self, out: &mut Vec<InputEvent>, max: usize) -> Result<usize, CaptureError> {
        let take = self.queue.len().min(max);
        out.extend(self.queue.drain(..take));
        Ok(take)
    }

    fn inject(&mut self, event: InputEvent) {
        self.queue.push_back(event);
    }

    fn describe(&self) -> String {
        "queued input".to_string()
    }
}

/// State of the emulated controller, sent once per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerFrame {
    pub kind: ControllerKind,
    pub axes: [u32; AXIS_COUNT],
    /// Bit `n` set while button `n` is held.
    pub buttons: u32,
}

impl ControllerFrame {
    /// All axes centred, no buttons held.
    pub fn neutral(kind: ControllerKind, mean_axis_value: u32) -> Self {
        Self {
            kind,
            axes: [mean_axis_value; AXIS_COUNT],
            buttons: 0,
        }
    }

    pub fn set_button(&mut self, button: u8, pressed: bool) {
        if u32::from(button) >= u32::BITS {
            return;
        }
        if pressed {
            self.buttons |= 1 << button;
        } else {
            self.buttons &= !(1 << button);
        }
    }

    pub fn is_pressed(&self, button: u8) -> bool {
        u32::from(button) < u32::BITS && self.buttons & (1 << button) != 0
    }
}
