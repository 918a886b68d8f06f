//! Input Dispatcher (spec §4.8): the active side serializes `InputEvent`s
//! onto the endpoint's `endpoint_input` channel; the passive side decodes
//! them and injects them into the local desktop.
//!
//! Grounded in the teacher's `duallink-linux-sender/input_inject.rs`
//! uinput injector (virtual mouse + virtual keyboard devices, the X11
//! keysym→evdev keycode table), generalized the way spec.md §4.8 requires:
//! the teacher tracks a previous normalised position and emits *relative*
//! `REL_X`/`REL_Y` deltas; this dispatcher instead exposes an *absolute*
//! `ABS_X`/`ABS_Y` virtual device — mouse coordinates here are already in
//! the captured monitor's pixel space, and spec.md §4.8 is explicit that
//! out-of-range coordinates are clamped to the monitor bounds, not
//! converted to a delta against whatever the last known position was.

use duallink_core::InputEvent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("uinput device init failed: {0}")]
    DeviceInitFailed(String),
    #[error("uinput emit failed: {0}")]
    InjectFailed(String),
    #[error("encoded input event is malformed: {0}")]
    Decode(String),
}

/// Serializes one `InputEvent` for the wire (spec §6: deterministic
/// structured encoding, pinned to bincode).
pub fn encode(event: &InputEvent) -> Vec<u8> {
    bincode::serialize(event).expect("InputEvent is always serializable")
}

/// Inverse of [`encode`].
pub fn decode(bytes: &[u8]) -> Result<InputEvent, InputError> {
    bincode::deserialize(bytes).map_err(|e| InputError::Decode(e.to_string()))
}

/// Passive-side sink: injects a decoded `InputEvent` into the local
/// desktop. `set_monitor_bounds` is called once per negotiated monitor
/// (spec §4.8's "passive side clips to monitor bounds").
pub trait InputInjector: Send {
    fn set_monitor_bounds(&mut self, width: u32, height: u32) -> Result<(), InputError>;
    fn inject(&mut self, event: InputEvent) -> Result<(), InputError>;
}

fn clamp_to(value: f32, max: u32) -> i32 {
    value.clamp(0.0, max.saturating_sub(1) as f32).round() as i32
}

#[cfg(target_os = "linux")]
pub use linux::UinputInjector;

#[cfg(target_os = "linux")]
mod linux {
    use super::{clamp_to, InputError, InputInjector};
    use duallink_core::{InputEvent, KeyboardEvent, MouseButton, MouseEvent};
    use evdev::{
        uinput::{VirtualDevice, VirtualDeviceBuilder},
        AbsInfo, AbsoluteAxisType, AttributeSet, EventType, InputId, Key, RelativeAxisType,
        UinputAbsSetup,
    };
    use tracing::{debug, warn};

    /// Virtual "DualLink Mouse" (absolute position + buttons + wheel) and
    /// "DualLink Keyboard" (104-key layout) uinput devices.
    pub struct UinputInjector {
        mouse: Option<VirtualDevice>,
        keyboard: VirtualDevice,
        width: u32,
        height: u32,
    }

    impl UinputInjector {
        pub fn new() -> Result<Self, InputError> {
            let mut key_set = AttributeSet::<Key>::new();
            for code in 1u16..=248 {
                key_set.insert(Key::new(code));
            }
            let keyboard = VirtualDeviceBuilder::new()
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?
                .name("DualLink Keyboard")
                .with_keys(&key_set)
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?
                .build()
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?;

            Ok(Self { mouse: None, keyboard, width: 1, height: 1 })
        }

        fn build_mouse(width: u32, height: u32) -> Result<VirtualDevice, InputError> {
            let mut mouse_keys = AttributeSet::<Key>::new();
            mouse_keys.insert(Key::BTN_LEFT);
            mouse_keys.insert(Key::BTN_RIGHT);
            mouse_keys.insert(Key::BTN_MIDDLE);

            let mut rel_axes = AttributeSet::<RelativeAxisType>::new();
            rel_axes.insert(RelativeAxisType::REL_WHEEL);
            rel_axes.insert(RelativeAxisType::REL_HWHEEL);

            let x_info = AbsInfo::new(0, 0, width.saturating_sub(1) as i32, 0, 0, 1);
            let y_info = AbsInfo::new(0, 0, height.saturating_sub(1) as i32, 0, 0, 1);

            VirtualDeviceBuilder::new()
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?
                .name("DualLink Tablet")
                .with_keys(&mouse_keys)
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?
                .with_relative_axes(&rel_axes)
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?
                .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisType::ABS_X, x_info))
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?
                .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisType::ABS_Y, y_info))
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))?
                .build()
                .map_err(|e| InputError::DeviceInitFailed(e.to_string()))
        }

        fn move_to(&mut self, x: f32, y: f32) -> Result<(), InputError> {
            let px = clamp_to(x, self.width);
            let py = clamp_to(y, self.height);
            let Some(mouse) = self.mouse.as_mut() else {
                return Err(InputError::InjectFailed("mouse device not initialized — call set_monitor_bounds first".into()));
            };
            let events = [
                evdev::InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_X.0, px),
                evdev::InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_Y.0, py),
                evdev::InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            ];
            mouse.emit(&events).map_err(|e| InputError::InjectFailed(e.to_string()))
        }
    }

    impl InputInjector for UinputInjector {
        fn set_monitor_bounds(&mut self, width: u32, height: u32) -> Result<(), InputError> {
            if self.mouse.is_some() && self.width == width && self.height == height {
                return Ok(());
            }
            self.mouse = Some(Self::build_mouse(width, height)?);
            self.width = width;
            self.height = height;
            Ok(())
        }

        fn inject(&mut self, event: InputEvent) -> Result<(), InputError> {
            match event {
                InputEvent::Mouse(MouseEvent::Move { x, y }) => self.move_to(x, y),
                InputEvent::Mouse(MouseEvent::Down { x, y, button }) => {
                    self.move_to(x, y)?;
                    let btn = mouse_button_to_key(button);
                    let Some(mouse) = self.mouse.as_mut() else { return Ok(()) };
                    let events = [
                        evdev::InputEvent::new(EventType::KEY, btn.code(), 1),
                        evdev::InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
                    ];
                    mouse.emit(&events).map_err(|e| InputError::InjectFailed(e.to_string()))
                }
                InputEvent::Mouse(MouseEvent::Up { x, y, button }) => {
                    self.move_to(x, y)?;
                    let btn = mouse_button_to_key(button);
                    let Some(mouse) = self.mouse.as_mut() else { return Ok(()) };
                    let events = [
                        evdev::InputEvent::new(EventType::KEY, btn.code(), 0),
                        evdev::InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
                    ];
                    mouse.emit(&events).map_err(|e| InputError::InjectFailed(e.to_string()))
                }
                InputEvent::Mouse(MouseEvent::ScrollWheel { x, y, delta_x, delta_y }) => {
                    self.move_to(x, y)?;
                    let Some(mouse) = self.mouse.as_mut() else { return Ok(()) };
                    let mut events = Vec::with_capacity(3);
                    if delta_y.abs() > f32::EPSILON {
                        events.push(evdev::InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_WHEEL.0, -(delta_y as i32)));
                    }
                    if delta_x.abs() > f32::EPSILON {
                        events.push(evdev::InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_HWHEEL.0, delta_x as i32));
                    }
                    events.push(evdev::InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
                    mouse.emit(&events).map_err(|e| InputError::InjectFailed(e.to_string()))
                }
                InputEvent::Keyboard(KeyboardEvent::Down { keycode }) => {
                    let key = keycode_to_evdev(keycode);
                    let events = [
                        evdev::InputEvent::new(EventType::KEY, key, 1),
                        evdev::InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
                    ];
                    self.keyboard.emit(&events).map_err(|e| InputError::InjectFailed(e.to_string()))
                }
                InputEvent::Keyboard(KeyboardEvent::Up { keycode }) => {
                    let key = keycode_to_evdev(keycode);
                    let events = [
                        evdev::InputEvent::new(EventType::KEY, key, 0),
                        evdev::InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
                    ];
                    self.keyboard.emit(&events).map_err(|e| InputError::InjectFailed(e.to_string()))
                }
            }
        }
    }

    fn mouse_button_to_key(btn: MouseButton) -> Key {
        match btn {
            MouseButton::Left => Key::BTN_LEFT,
            MouseButton::Right => Key::BTN_RIGHT,
            MouseButton::Middle => Key::BTN_MIDDLE,
        }
    }

    /// Stable platform-neutral keycode table (spec §4.8): X11 keysyms in,
    /// Linux evdev codes out. Kept as-is from the teacher — it already is
    /// the numbering spec.md asks for. Unknown keysyms are ignored
    /// (`KEY_RESERVED`, a no-op on emit).
    fn keycode_to_evdev(keysym: u32) -> u16 {
        match keysym {
            0x0020 => Key::KEY_SPACE.code(),
            0x0027 => Key::KEY_APOSTROPHE.code(),
            0x002c => Key::KEY_COMMA.code(),
            0x002d => Key::KEY_MINUS.code(),
            0x002e => Key::KEY_DOT.code(),
            0x002f => Key::KEY_SLASH.code(),
            0x0030..=0x0039 => Key::KEY_0.code() + (keysym - 0x0030) as u16,
            0x003b => Key::KEY_SEMICOLON.code(),
            0x003d => Key::KEY_EQUAL.code(),
            0x005b => Key::KEY_LEFTBRACE.code(),
            0x005c => Key::KEY_BACKSLASH.code(),
            0x005d => Key::KEY_RIGHTBRACE.code(),
            0x0060 => Key::KEY_GRAVE.code(),
            0x0061..=0x007a => Key::KEY_A.code() + (keysym - 0x0061) as u16,
            0xffbe..=0xffc9 => Key::KEY_F1.code() + (keysym - 0xffbe) as u16,
            0xff08 => Key::KEY_BACKSPACE.code(),
            0xff09 => Key::KEY_TAB.code(),
            0xff0d => Key::KEY_ENTER.code(),
            0xff1b => Key::KEY_ESC.code(),
            0xff51 => Key::KEY_LEFT.code(),
            0xff52 => Key::KEY_UP.code(),
            0xff53 => Key::KEY_RIGHT.code(),
            0xff54 => Key::KEY_DOWN.code(),
            0xff55 => Key::KEY_PAGEUP.code(),
            0xff56 => Key::KEY_PAGEDOWN.code(),
            0xff50 => Key::KEY_HOME.code(),
            0xff57 => Key::KEY_END.code(),
            0xff63 => Key::KEY_INSERT.code(),
            0xffff => Key::KEY_DELETE.code(),
            0xffe1 | 0xffe2 => Key::KEY_LEFTSHIFT.code(),
            0xffe3 | 0xffe4 => Key::KEY_LEFTCTRL.code(),
            0xffe5 => Key::KEY_CAPSLOCK.code(),
            0xffe9 | 0xffea => Key::KEY_LEFTALT.code(),
            0xffe7 | 0xffe8 => Key::KEY_LEFTMETA.code(),
            _ => {
                debug!(keysym = format!("0x{keysym:04x}"), "unknown X11 keysym — skipped");
                0
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::UinputInjector;

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::{InputError, InputInjector};
    use duallink_core::InputEvent;

    /// Non-Linux platforms are out of this workspace's buildable scope.
    #[derive(Default)]
    pub struct UinputInjector;

    impl UinputInjector {
        pub fn new() -> Result<Self, InputError> {
            Ok(Self)
        }
    }

    impl InputInjector for UinputInjector {
        fn set_monitor_bounds(&mut self, _width: u32, _height: u32) -> Result<(), InputError> {
            Err(InputError::DeviceInitFailed("input injection is only implemented for Linux in this workspace".into()))
        }

        fn inject(&mut self, _event: InputEvent) -> Result<(), InputError> {
            Err(InputError::DeviceInitFailed("input injection is only implemented for Linux in this workspace".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duallink_core::MouseEvent;

    #[test]
    fn round_trips_through_encode_decode() {
        let event = InputEvent::Mouse(MouseEvent::Move { x: 42.0, y: 17.0 });
        let bytes = encode(&event);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn clamp_keeps_coordinates_in_bounds() {
        assert_eq!(clamp_to(-10.0, 1920), 0);
        assert_eq!(clamp_to(5000.0, 1920), 1919);
        assert_eq!(clamp_to(960.0, 1920), 960);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
