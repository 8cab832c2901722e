use crate::controller::{ControllerFrame, EventClass, InputEvent, KeyCode, AXIS_COUNT};
use crate::dispatch::timing::LoopTiming;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Processing collaborator. Configured once at startup, then fed every
/// captured batch.
pub trait Processor {
    fn configure(&mut self, timing: &LoopTiming);

    /// Folds `events` into `frame`.
    fn process(&mut self, events: &[InputEvent], frame: &mut ControllerFrame);
}

// Processor settings
#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub deadzone: f32,
    pub mouse_sensitivity: f64,
    /// Frame axes driven by horizontal and vertical mouse motion.
    pub mouse_axes: [usize; 2],
    /// Keyboard keys mapped to frame buttons.
    pub keys: HashMap<KeyCode, u8>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            deadzone: 0.05,
            mouse_sensitivity: 1.0,
            mouse_axes: [2, 3],
            keys: HashMap::new(),
        }
    }
}

/// Default processor.
///
/// Buttons and keys hit the frame as they arrive. Absolute axes keep the
/// last value seen in the batch. Mouse motion is summed over the batch and
/// applied once, scaled by the precision and refresh factors; after
/// `postpone_count` iterations without motion the mouse axes recentre.
#[derive(Debug, Default)]
pub struct FrameProcessor {
    settings: ProcessorSettings,
    timing: LoopTiming,
    idle_iterations: u32,
    mouse_active: bool,
}

impl FrameProcessor {
    pub fn new(settings: ProcessorSettings) -> Self {
        Self {
            settings,
            timing: LoopTiming::default(),
            idle_iterations: 0,
            mouse_active: false,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    fn apply_discrete(&self, event: &InputEvent, frame: &mut ControllerFrame) {
        match *event {
            InputEvent::Button { button, pressed, .. } => frame.set_button(button, pressed),
            InputEvent::Key { key, pressed } => match self.settings.keys.get(&key) {
                Some(button) => frame.set_button(*button, pressed),
                None => trace!("Key {} is not mapped", key),
            },
            _ => {}
        }
    }

    fn axis_position(&self, value: i16) -> u32 {
        let normalized = (f32::from(value) / f32::from(i16::MAX)).clamp(-1.0, 1.0);
        let shaped = apply_deadzone(normalized, self.settings.deadzone);
        self.clamp_axis(f64::from(self.timing.mean_axis_value) * (1.0 + f64::from(shaped)))
    }

    fn mouse_position(&self, delta: i32) -> u32 {
        let offset = f64::from(delta)
            * self.settings.mouse_sensitivity
            * self.timing.axis_scale
            * self.timing.frequency_scale;
        self.clamp_axis(f64::from(self.timing.mean_axis_value) + offset)
    }

    fn clamp_axis(&self, value: f64) -> u32 {
        value.round().clamp(0.0, f64::from(self.timing.max_axis_value)) as u32
    }
}

impl Processor for FrameProcessor {
    fn configure(&mut self, timing: &LoopTiming) {
        debug!("Configuring frame processor with {:?}", timing);
        self.timing = *timing;
    }

    fn process(&mut self, events: &[InputEvent], frame: &mut ControllerFrame) {
        let mut axes: [Option<i16>; AXIS_COUNT] = [None; AXIS_COUNT];
        let (mut dx, mut dy) = (0i32, 0i32);
        let mut moved = false;

        for event in events {
            match (event.class(), *event) {
                (EventClass::Discrete, _) => self.apply_discrete(event, frame),
                (EventClass::Motion, InputEvent::Axis { axis, value, .. }) => {
                    match axes.get_mut(usize::from(axis)) {
                        Some(slot) => *slot = Some(value),
                        None => trace!("Ignoring axis {} beyond the frame", axis),
                    }
                }
                (EventClass::Motion, InputEvent::MouseMotion { dx: x, dy: y }) => {
                    dx = dx.saturating_add(x);
                    dy = dy.saturating_add(y);
                    moved = true;
                }
                (EventClass::Motion, _) => {}
            }
        }

        for (index, value) in axes.iter().enumerate() {
            if let Some(value) = value {
                frame.axes[index] = self.axis_position(*value);
            }
        }

        let [x_axis, y_axis] = self.settings.mouse_axes;
        if moved {
            self.idle_iterations = 0;
            self.mouse_active = true;
            if let Some(axis) = frame.axes.get_mut(x_axis) {
                *axis = self.mouse_position(dx);
            }
            if let Some(axis) = frame.axes.get_mut(y_axis) {
                *axis = self.mouse_position(dy);
            }
        } else if self.mouse_active {
            self.idle_iterations += 1;
            if self.idle_iterations >= self.timing.postpone_count {
                trace!("No mouse motion for {} iterations, recentring", self.idle_iterations);
                for axis in [x_axis, y_axis] {
                    if let Some(axis) = frame.axes.get_mut(axis) {
                        *axis = self.timing.mean_axis_value;
                    }
                }
                self.mouse_active = false;
                self.idle_iterations = 0;
            }
        }
    }
}

// Rescales the value to the range outside the deadzone
fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}
