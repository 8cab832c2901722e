use crate::controller::{CaptureError, InputEvent, InputSource, DEFAULT_QUIT_BUTTON};
use gilrs::{Axis, Button, Event, EventType, Gamepad, GamepadId, Gilrs};
use statum::{machine, state};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

// Collector settings
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    /// Index of the gamepad to follow. `None` picks the first one found.
    pub gamepad_index: Option<usize>,
    /// Frame button whose press is turned into [`InputEvent::Quit`].
    pub quit_button: Option<u8>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            gamepad_index: None,
            quit_button: Some(DEFAULT_QUIT_BUTTON),
        }
    }
}

// Define collector states using statum's state macro
#[state]
#[derive(Debug, Clone)]
pub enum CollectionState {
    Initializing,
    Collecting,
}

#[machine]
#[derive(Debug)]
pub struct EventCollector<S: CollectionState> {
    // Gilrs context
    gilrs: Gilrs,

    // Active gamepad
    active_gamepad: Option<GamepadId>,

    // Collector settings
    settings: CollectorSettings,

    // Synthetic events delivered before captured ones
    injected: VecDeque<InputEvent>,
}

impl EventCollector<Initializing> {
    pub fn create(settings: CollectorSettings) -> Result<Self, CaptureError> {
        info!("Initializing gilrs controller interface");
        let gilrs = match Gilrs::new() {
            Ok(g) => {
                info!("Successfully initialized gilrs");
                g
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(CaptureError::InitializationError(e.to_string()));
            }
        };

        Ok(Self::new(gilrs, None, settings, VecDeque::new()))
    }

    // Pick the active gamepad and transition to Collecting state
    pub fn initialize(mut self) -> EventCollector<Collecting> {
        let gamepads: Vec<(GamepadId, Gamepad<'_>)> = self.gilrs.gamepads().collect();

        if gamepads.is_empty() {
            warn!("No gamepad connected, following the first one to appear");
        } else {
            info!("Found {} gamepads:", gamepads.len());
            for (idx, (id, gamepad)) in gamepads.iter().enumerate() {
                info!("  [{}] ID: {}, Name: {}", idx, id, gamepad.name());
            }

            let index = self
                .settings
                .gamepad_index
                .filter(|index| *index < gamepads.len())
                .unwrap_or(0);
            let (id, gamepad) = &gamepads[index];
            info!("Selected gamepad: {} ({})", gamepad.name(), id);
            self.active_gamepad = Some(*id);
        }

        self.transition()
    }
}

impl EventCollector<Collecting> {
    fn convert(&mut self, id: GamepadId, event: EventType) -> Option<InputEvent> {
        match self.active_gamepad {
            Some(active) if active != id => {
                debug!("Skipping event from non-active gamepad: {:?}", id);
                return None;
            }
            None => {
                info!("Following gamepad {}", id);
                self.active_gamepad = Some(id);
            }
            _ => {}
        }

        match event {
            EventType::AxisChanged(axis, value, _) => convert_axis(axis, value),
            EventType::ButtonPressed(button, _) => {
                convert_button(button, true, self.settings.quit_button)
            }
            EventType::ButtonReleased(button, _) => {
                convert_button(button, false, self.settings.quit_button)
            }
            EventType::Disconnected => {
                warn!("Active gamepad {} disconnected", id);
                self.active_gamepad = None;
                None
            }
            _ => {
                debug!("Unhandled event type: {:?}", event);
                None
            }
        }
    }
}

impl InputSource for EventCollector<Collecting> {
    fn poll_events(&mut self, out: &mut Vec<InputEvent>, max: usize) -> Result<usize, CaptureError> {
        let mut count = 0;

        while count < max {
            let Some(event) = self.injected.pop_front() else {
                break;
            };
            out.push(event);
            count += 1;
        }

        while count < max {
            let Some(Event { id, event, .. }) = self.gilrs.next_event() else {
                break;
            };
            if let Some(event) = self.convert(id, event) {
                out.push(event);
                count += 1;
            }
        }

        Ok(count)
    }

    fn inject(&mut self, event: InputEvent) {
        self.injected.push_back(event);
    }

    fn describe(&self) -> String {
        match self.active_gamepad {
            Some(id) => format!("gamepad {}", id),
            None => "gamepad (none connected)".to_string(),
        }
    }
}

fn convert_axis(axis: Axis, value: f32) -> Option<InputEvent> {
    map_axis(axis).map(|axis| InputEvent::Axis {
        device: 0,
        axis,
        value: (value.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16,
    })
}

// The quit button never reaches the frame
fn convert_button(button: Button, pressed: bool, quit_button: Option<u8>) -> Option<InputEvent> {
    let button = map_button(button)?;
    if quit_button == Some(button) {
        if pressed {
            info!("Quit button pressed");
            return Some(InputEvent::Quit);
        }
        return None;
    }
    Some(InputEvent::Button {
        device: 0,
        button,
        pressed,
    })
}

fn map_axis(axis: Axis) -> Option<u8> {
    match axis {
        Axis::LeftStickX => Some(0),
        Axis::LeftStickY => Some(1),
        Axis::RightStickX => Some(2),
        Axis::RightStickY => Some(3),
        Axis::LeftZ => Some(4),
        Axis::RightZ => Some(5),
        Axis::DPadX => Some(6),
        Axis::DPadY => Some(7),
        _ => None,
    }
}

// Frame button bit for each gilrs button
fn map_button(button: Button) -> Option<u8> {
    match button {
        Button::South => Some(0),
        Button::East => Some(1),
        Button::West => Some(2),
        Button::North => Some(3),
        Button::LeftTrigger => Some(4),
        Button::RightTrigger => Some(5),
        Button::LeftTrigger2 => Some(6),
        Button::RightTrigger2 => Some(7),
        Button::Select => Some(8),
        Button::Start => Some(9),
        Button::LeftThumb => Some(10),
        Button::RightThumb => Some(11),
        Button::DPadUp => Some(12),
        Button::DPadDown => Some(13),
        Button::DPadLeft => Some(14),
        Button::DPadRight => Some(15),
        Button::Mode => Some(16),
        _ => None,
    }
}
