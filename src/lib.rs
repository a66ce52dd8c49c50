//! GPIO/I2C to virtual-input bridge
//!
//! Translates GPIO line edges and polled readings from an I2C
//! microcontroller into events on synthetic uinput gamepad and keyboard
//! devices, with debouncing, a configurable mapping table and online
//! auto-calibration for the analog channels.

pub mod action;
pub mod debounce;
pub mod emitter;
pub mod event_loop;
pub mod gpio;
pub mod mapping;
pub mod peripheral;

pub use action::{Action, ActionKind, DeviceKind, HatDirection, TokenError};
pub use emitter::{Capabilities, VirtualOutputs};
pub use mapping::{AutoMode, MappingTable};
pub use peripheral::PeripheralPoller;
