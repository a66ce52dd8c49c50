//! Virtual output devices.
//!
//! At most two uinput devices are created per run, a gamepad and a
//! keyboard, each only when the effective mapping routes something to it.
//! The gamepad owns the hat switch and any analog axes; both hat and axis
//! state are change-suppressed so the kernel only sees real transitions.

use std::collections::BTreeSet;
use std::io;
use std::thread;
use std::time::Duration;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisType, AttributeSet, BusType, EventType, InputEvent, InputId, Key,
    UinputAbsSetup,
};
use thiserror::Error;
use tracing::info;

use crate::action::{Action, ActionKind, DeviceKind, HatDirection};
use crate::mapping::MappingTable;

pub const AXIS_MIN: i32 = 0;
pub const AXIS_MAX: i32 = 100;
pub const AXIS_CENTER: i32 = 50;

const GAMEPAD_NAME: &str = "gpio-virtual-gamepad";
const KEYBOARD_NAME: &str = "gpio-virtual-keyboard";
const VENDOR_ID: u16 = 0x18d1;
const GAMEPAD_PRODUCT: u16 = 0x0001;
const KEYBOARD_PRODUCT: u16 = 0x0002;

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("failed to create virtual {device} device: {source}")]
    CreateDevice { device: &'static str, source: io::Error },

    #[error("event emission failed: {0}")]
    Emit(#[from] io::Error),
}

/// Everything the virtual devices must be able to report, derived from the
/// mapping before any device is created.
#[derive(Debug, Default)]
pub struct Capabilities {
    pub gamepad_buttons: BTreeSet<Key>,
    pub keyboard_keys: BTreeSet<Key>,
    pub hat: bool,
    pub analog_axes: Vec<AbsoluteAxisType>,
}

impl Capabilities {
    pub fn from_mapping(table: &MappingTable, analog_axes: &[AbsoluteAxisType]) -> Self {
        let mut caps = Self {
            analog_axes: analog_axes.to_vec(),
            ..Self::default()
        };
        for act in table.lines.values().chain(table.pins.values()) {
            match act.kind {
                ActionKind::Hat(_) => caps.hat = true,
                ActionKind::KeyPress {
                    device: DeviceKind::Gamepad,
                    key,
                } => {
                    caps.gamepad_buttons.insert(key);
                }
                ActionKind::KeyPress {
                    device: DeviceKind::Keyboard,
                    key,
                } => {
                    caps.keyboard_keys.insert(key);
                }
            }
        }
        caps
    }

    pub fn needs_gamepad(&self) -> bool {
        self.hat || !self.gamepad_buttons.is_empty() || !self.analog_axes.is_empty()
    }

    pub fn needs_keyboard(&self) -> bool {
        !self.keyboard_keys.is_empty()
    }
}

/// Current pressed state of the four hat directions.
///
/// Opposing directions cancel; each component is clamped to -1..1.
#[derive(Debug, Default, Clone, Copy)]
pub struct HatState {
    up: bool,
    down: bool,
    left: bool,
    right: bool,
}

impl HatState {
    pub fn set(&mut self, dir: HatDirection, pressed: bool) {
        match dir {
            HatDirection::Up => self.up = pressed,
            HatDirection::Down => self.down = pressed,
            HatDirection::Left => self.left = pressed,
            HatDirection::Right => self.right = pressed,
        }
    }

    pub fn vector(&self) -> (i32, i32) {
        let x = i32::from(self.right) - i32::from(self.left);
        let y = i32::from(self.down) - i32::from(self.up);
        (x.clamp(-1, 1), y.clamp(-1, 1))
    }
}

/// The created virtual devices plus the shared hat state.
pub struct VirtualOutputs {
    gamepad: Option<VirtualDevice>,
    keyboard: Option<VirtualDevice>,
    hat_enabled: bool,
    hat: HatState,
    last_hat: (i32, i32),
}

impl VirtualOutputs {
    /// Create the devices the capabilities call for and emit the initial
    /// neutral state (hat centered, axes at midpoint).
    pub fn create(caps: &Capabilities) -> Result<Self, EmitterError> {
        let gamepad = if caps.needs_gamepad() {
            Some(build_gamepad(caps)?)
        } else {
            None
        };
        let keyboard = if caps.needs_keyboard() {
            Some(build_keyboard(caps)?)
        } else {
            None
        };

        // Give userspace (udev, display servers) a moment to pick the new
        // nodes up before events start flowing.
        thread::sleep(Duration::from_millis(100));

        let mut outputs = Self {
            gamepad,
            keyboard,
            hat_enabled: caps.hat,
            hat: HatState::default(),
            last_hat: (0, 0),
        };

        if outputs.hat_enabled {
            outputs.emit_axes(&[
                (AbsoluteAxisType::ABS_HAT0X, 0),
                (AbsoluteAxisType::ABS_HAT0Y, 0),
            ])?;
        }
        if !caps.analog_axes.is_empty() {
            let centers: Vec<_> = caps
                .analog_axes
                .iter()
                .map(|&axis| (axis, AXIS_CENTER))
                .collect();
            outputs.emit_axes(&centers)?;
        }

        if outputs.gamepad.is_some() {
            info!("created virtual gamepad '{GAMEPAD_NAME}'");
        }
        if outputs.keyboard.is_some() {
            info!("created virtual keyboard '{KEYBOARD_NAME}'");
        }

        Ok(outputs)
    }

    /// Route one action's press/release to the right device.
    pub fn apply(&mut self, action: &Action, pressed: bool) -> Result<(), EmitterError> {
        match action.kind {
            ActionKind::Hat(dir) => {
                self.hat.set(dir, pressed);
                self.refresh_hat()
            }
            ActionKind::KeyPress { device, key } => self.emit_key(device, key, pressed),
        }
    }

    fn emit_key(
        &mut self,
        device: DeviceKind,
        key: Key,
        pressed: bool,
    ) -> Result<(), EmitterError> {
        let dev = match device {
            DeviceKind::Gamepad => self.gamepad.as_mut(),
            DeviceKind::Keyboard => self.keyboard.as_mut(),
        };
        if let Some(dev) = dev {
            let ev = InputEvent::new(EventType::KEY, key.code(), i32::from(pressed));
            dev.emit(&[ev])?;
        }
        Ok(())
    }

    /// Emit a batch of absolute axis values in one report.
    pub fn emit_axes(&mut self, values: &[(AbsoluteAxisType, i32)]) -> Result<(), EmitterError> {
        if let Some(dev) = self.gamepad.as_mut() {
            let events: Vec<_> = values
                .iter()
                .map(|&(axis, value)| InputEvent::new(EventType::ABSOLUTE, axis.0, value))
                .collect();
            dev.emit(&events)?;
        }
        Ok(())
    }

    /// Re-derive the hat vector and emit it if it changed.
    fn refresh_hat(&mut self) -> Result<(), EmitterError> {
        if !self.hat_enabled {
            return Ok(());
        }
        let (x, y) = self.hat.vector();
        if (x, y) == self.last_hat {
            return Ok(());
        }
        self.last_hat = (x, y);
        self.emit_axes(&[
            (AbsoluteAxisType::ABS_HAT0X, x),
            (AbsoluteAxisType::ABS_HAT0Y, y),
        ])
    }
}

fn build_gamepad(caps: &Capabilities) -> Result<VirtualDevice, EmitterError> {
    let mut keys = AttributeSet::<Key>::new();
    // BTN_SOUTH is always declared so the kernel classifies the node as a
    // gamepad even when only the hat or axes are mapped.
    keys.insert(Key::BTN_SOUTH);
    for &key in &caps.gamepad_buttons {
        keys.insert(key);
    }

    let mut builder = VirtualDeviceBuilder::new()
        .map_err(|source| EmitterError::CreateDevice {
            device: "gamepad",
            source,
        })?
        .name(GAMEPAD_NAME)
        .input_id(InputId::new(BusType::BUS_USB, VENDOR_ID, GAMEPAD_PRODUCT, 1))
        .with_keys(&keys)
        .map_err(|source| EmitterError::CreateDevice {
            device: "gamepad",
            source,
        })?;

    if caps.hat {
        let hat_info = AbsInfo::new(0, -1, 1, 0, 0, 0);
        for axis in [AbsoluteAxisType::ABS_HAT0X, AbsoluteAxisType::ABS_HAT0Y] {
            builder = builder
                .with_absolute_axis(&UinputAbsSetup::new(axis, hat_info))
                .map_err(|source| EmitterError::CreateDevice {
                    device: "gamepad",
                    source,
                })?;
        }
    }

    let axis_info = AbsInfo::new(AXIS_CENTER, AXIS_MIN, AXIS_MAX, 0, 0, 0);
    for &axis in &caps.analog_axes {
        builder = builder
            .with_absolute_axis(&UinputAbsSetup::new(axis, axis_info))
            .map_err(|source| EmitterError::CreateDevice {
                device: "gamepad",
                source,
            })?;
    }

    builder.build().map_err(|source| EmitterError::CreateDevice {
        device: "gamepad",
        source,
    })
}

fn build_keyboard(caps: &Capabilities) -> Result<VirtualDevice, EmitterError> {
    let mut keys = AttributeSet::<Key>::new();
    for &key in &caps.keyboard_keys {
        keys.insert(key);
    }

    VirtualDeviceBuilder::new()
        .map_err(|source| EmitterError::CreateDevice {
            device: "keyboard",
            source,
        })?
        .name(KEYBOARD_NAME)
        .input_id(InputId::new(
            BusType::BUS_USB,
            VENDOR_ID,
            KEYBOARD_PRODUCT,
            1,
        ))
        .with_keys(&keys)
        .map_err(|source| EmitterError::CreateDevice {
            device: "keyboard",
            source,
        })?
        .build()
        .map_err(|source| EmitterError::CreateDevice {
            device: "keyboard",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hat_vector_all_combinations() {
        let dirs = [
            HatDirection::Up,
            HatDirection::Down,
            HatDirection::Left,
            HatDirection::Right,
        ];
        for bits in 0u8..16 {
            let mut hat = HatState::default();
            for (i, &dir) in dirs.iter().enumerate() {
                hat.set(dir, bits & (1 << i) != 0);
            }
            let (x, y) = hat.vector();
            assert!((-1..=1).contains(&x));
            assert!((-1..=1).contains(&y));
        }
    }

    #[test]
    fn test_hat_opposing_directions_cancel() {
        let mut hat = HatState::default();
        hat.set(HatDirection::Left, true);
        hat.set(HatDirection::Right, true);
        assert_eq!(hat.vector(), (0, 0));
        hat.set(HatDirection::Right, false);
        assert_eq!(hat.vector(), (-1, 0));
    }

    #[test]
    fn test_hat_axes_orientation() {
        let mut hat = HatState::default();
        hat.set(HatDirection::Up, true);
        assert_eq!(hat.vector(), (0, -1));
        hat.set(HatDirection::Up, false);
        hat.set(HatDirection::Down, true);
        assert_eq!(hat.vector(), (0, 1));
        hat.set(HatDirection::Right, true);
        assert_eq!(hat.vector(), (1, 1));
    }

    #[test]
    fn test_capabilities_from_mapping() {
        let table = MappingTable::parse("15 HAT_UP\n21 BTN_SOUTH\n17 KEY_ENTER\nD5 B\n");
        let caps = Capabilities::from_mapping(&table, &[]);
        assert!(caps.hat);
        assert!(caps.gamepad_buttons.contains(&Key::BTN_SOUTH));
        assert!(caps.gamepad_buttons.contains(&Key::BTN_EAST));
        assert!(caps.keyboard_keys.contains(&Key::KEY_ENTER));
        assert!(caps.needs_gamepad());
        assert!(caps.needs_keyboard());
    }

    #[test]
    fn test_capabilities_keyboard_only() {
        let table = MappingTable::parse("17 KEY_ENTER\n");
        let caps = Capabilities::from_mapping(&table, &[]);
        assert!(!caps.needs_gamepad());
        assert!(caps.needs_keyboard());
    }

    #[test]
    fn test_capabilities_axes_force_gamepad() {
        let table = MappingTable::parse("17 KEY_ENTER\n");
        let caps = Capabilities::from_mapping(&table, &[AbsoluteAxisType::ABS_X]);
        assert!(caps.needs_gamepad());
    }

    // Needs write access to /dev/uinput; run manually.
    #[test]
    #[ignore]
    fn test_create_devices() {
        let table = MappingTable::default_table();
        let caps = Capabilities::from_mapping(&table, &[AbsoluteAxisType::ABS_X]);
        let mut outputs = VirtualOutputs::create(&caps).unwrap();
        let act = crate::action::resolve("BTN_SOUTH").unwrap();
        outputs.apply(&act, true).unwrap();
        outputs.apply(&act, false).unwrap();
    }
}
