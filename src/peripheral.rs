//! I2C peripheral polling: analog sticks and extra digital pins.
//!
//! The microcontroller answers a plain read with a fixed 12-byte frame of
//! five little-endian analog samples followed by a digital bitmask. Analog
//! channels are auto-calibrated online against the range actually observed,
//! digital pins are edge-detected by diffing consecutive masks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use evdev::AbsoluteAxisType;
use rppal::i2c::I2c;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::emitter::{EmitterError, VirtualOutputs};
use crate::mapping::PIN_MIN;

pub const ANALOG_CHANNEL_COUNT: usize = 5;
pub const FRAME_BYTES: usize = 12;
pub const DIGITAL_PIN_COUNT: u8 = 12;

/// Full ADC range of the controller.
pub const ADC_MAX: u16 = 1023;
/// Assumed span around the first sample before any widening.
pub const INITIAL_SPAN: u16 = 512;
/// Narrowest span ever used for scaling.
pub const MIN_SPAN: u16 = 32;

#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error("failed to open I2C bus {bus}: {source}")]
    BusOpen { bus: u8, source: rppal::i2c::Error },

    #[error("failed to select I2C address {addr:#04x}: {source}")]
    Address {
        addr: u16,
        source: rppal::i2c::Error,
    },
}

/// One analog channel and the gamepad axis it feeds.
#[derive(Debug, Clone, Copy)]
pub struct AnalogChannel {
    pub label: &'static str,
    /// Slot in the frame's analog array.
    pub index: usize,
    pub axis: AbsoluteAxisType,
}

/// A0..A3 map to the two sticks, A6 (frame slot 4) to ABS_Z.
pub const DEFAULT_ANALOG_CHANNELS: [AnalogChannel; ANALOG_CHANNEL_COUNT] = [
    AnalogChannel {
        label: "A0",
        index: 0,
        axis: AbsoluteAxisType::ABS_X,
    },
    AnalogChannel {
        label: "A1",
        index: 1,
        axis: AbsoluteAxisType::ABS_Y,
    },
    AnalogChannel {
        label: "A2",
        index: 2,
        axis: AbsoluteAxisType::ABS_RX,
    },
    AnalogChannel {
        label: "A3",
        index: 3,
        axis: AbsoluteAxisType::ABS_RY,
    },
    AnalogChannel {
        label: "A6",
        index: 4,
        axis: AbsoluteAxisType::ABS_Z,
    },
];

/// Decoded controller frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub analog: [u16; ANALOG_CHANNEL_COUNT],
    pub mask: u16,
}

pub fn decode_frame(buf: &[u8; FRAME_BYTES]) -> Frame {
    let mut analog = [0u16; ANALOG_CHANNEL_COUNT];
    for (i, chunk) in buf[..ANALOG_CHANNEL_COUNT * 2].chunks_exact(2).enumerate() {
        analog[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
    }
    let mask = u16::from_le_bytes([buf[10], buf[11]]);
    Frame { analog, mask }
}

/// Bits that flipped between the previous and current mask.
///
/// Before the first frame there is nothing to compare against, so the
/// first mask only establishes the baseline.
pub fn mask_diff(prev: Option<u16>, current: u16) -> u16 {
    match prev {
        Some(p) => p ^ current,
        None => 0,
    }
}

/// Logical press state of one mask bit under the active-low policy.
pub fn pin_pressed(mask: u16, bit: u8, active_low: bool) -> bool {
    let level_high = mask & (1 << bit) != 0;
    if active_low {
        !level_high
    } else {
        level_high
    }
}

/// Online min/max calibration for one analog channel.
///
/// The observed range only ever widens. The first sample seeds a window of
/// [`INITIAL_SPAN`] centered on it (clamped to the ADC range), and the
/// scaling span never drops below [`MIN_SPAN`].
#[derive(Debug, Clone, Copy)]
pub struct AxisCalibration {
    min_seen: u16,
    max_seen: u16,
    initialized: bool,
    last_scaled: Option<i32>,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self {
            min_seen: 0,
            max_seen: ADC_MAX,
            initialized: false,
            last_scaled: None,
        }
    }
}

impl AxisCalibration {
    /// Fold in a raw sample and return its 0..100 scaled value.
    ///
    /// The raw value is not clamped when widening; an out-of-range glitch
    /// permanently stretches the observed window. Only the scale step
    /// clamps, into the window itself.
    pub fn scale(&mut self, raw: u16) -> i32 {
        if !self.initialized {
            let half = INITIAL_SPAN / 2;
            let mut min = raw.saturating_sub(half);
            let mut max = min.saturating_add(INITIAL_SPAN);
            if max > ADC_MAX {
                max = ADC_MAX;
                min = ADC_MAX - INITIAL_SPAN;
            }
            self.min_seen = min;
            self.max_seen = max.max(raw).max(min + MIN_SPAN);
            self.initialized = true;
        } else {
            self.min_seen = self.min_seen.min(raw);
            self.max_seen = self.max_seen.max(raw);
        }

        let span = (self.max_seen - self.min_seen).max(MIN_SPAN);
        let clamped = raw.clamp(self.min_seen, self.max_seen);
        let scaled = i32::from(clamped - self.min_seen) * 100 / i32::from(span);
        scaled.clamp(0, 100)
    }

    /// Record a scaled value; true when it differs from the last one.
    pub fn record(&mut self, scaled: i32) -> bool {
        if self.last_scaled == Some(scaled) {
            return false;
        }
        self.last_scaled = Some(scaled);
        true
    }

    /// Scale, record, and report only changed values.
    pub fn update(&mut self, raw: u16) -> Option<i32> {
        let scaled = self.scale(raw);
        self.record(scaled).then_some(scaled)
    }

    pub fn bounds(&self) -> (u16, u16) {
        (self.min_seen, self.max_seen)
    }
}

/// One axis' worth of the per-poll sample diagnostics line.
fn sample_log_entry(label: &str, raw: u16, cal: &AxisCalibration, scaled: i32) -> String {
    let (min, max) = cal.bounds();
    let span = (max - min).max(MIN_SPAN);
    format!(" {label} raw={raw} min={min} max={max} span={span} scaled={scaled}")
}

/// Deadline-driven poller for one controller on one bus.
pub struct PeripheralPoller {
    bus: I2c,
    interval: Duration,
    next_due: Instant,
    last_mask: Option<u16>,
    read_warned: bool,
    log_samples: bool,
    active_low: bool,
    /// Keyed by mask bit (pin - 2).
    bindings: HashMap<u8, Action>,
    channels: Vec<(AnalogChannel, AxisCalibration)>,
}

impl PeripheralPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus_id: u8,
        addr: u16,
        interval: Duration,
        pin_actions: &HashMap<u8, Action>,
        enable_axes: bool,
        log_samples: bool,
        active_low: bool,
    ) -> Result<Self, PeripheralError> {
        let mut bus = I2c::with_bus(bus_id)
            .map_err(|source| PeripheralError::BusOpen { bus: bus_id, source })?;
        bus.set_slave_address(addr)
            .map_err(|source| PeripheralError::Address { addr, source })?;

        let bindings: HashMap<u8, Action> = pin_actions
            .iter()
            .map(|(&pin, act)| (pin - PIN_MIN, act.clone()))
            .collect();

        let channels = if enable_axes {
            DEFAULT_ANALOG_CHANNELS
                .iter()
                .map(|&ch| (ch, AxisCalibration::default()))
                .collect()
        } else {
            Vec::new()
        };

        info!(
            "polling I2C bus {bus_id} addr {addr:#04x} every {:?} ({} mapped pins, {} analog channels)",
            interval,
            bindings.len(),
            channels.len()
        );

        Ok(Self {
            bus,
            interval,
            next_due: Instant::now(),
            last_mask: None,
            read_warned: false,
            log_samples,
            active_low,
            bindings,
            channels,
        })
    }

    /// Whether the poller contributes any input at all.
    pub fn has_inputs(&self) -> bool {
        !self.bindings.is_empty() || !self.channels.is_empty()
    }

    pub fn analog_axes(&self) -> Vec<AbsoluteAxisType> {
        self.channels.iter().map(|(ch, _)| ch.axis).collect()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn timeout_until_due(&self, now: Instant) -> Duration {
        self.next_due.saturating_duration_since(now)
    }

    /// Fixed-rate reschedule from the pre-poll instant, so a slow poll
    /// does not push the whole schedule back.
    pub fn reschedule(&mut self, now: Instant) {
        self.next_due = now + self.interval;
    }

    /// Read one frame and forward any changes to the outputs.
    ///
    /// Bus errors and short reads are logged once and swallowed; the
    /// controller being absent must not kill the GPIO side.
    pub fn poll(&mut self, outputs: &mut VirtualOutputs) -> Result<(), EmitterError> {
        let mut buf = [0u8; FRAME_BYTES];
        match self.bus.read(&mut buf) {
            Ok(n) if n == FRAME_BYTES => {}
            Ok(n) => {
                if !self.read_warned {
                    warn!("short I2C read ({n} of {FRAME_BYTES} bytes), controller unreachable?");
                    self.read_warned = true;
                }
                return Ok(());
            }
            Err(err) => {
                if !self.read_warned {
                    warn!("I2C read failed: {err}");
                    self.read_warned = true;
                }
                return Ok(());
            }
        }
        if self.read_warned {
            info!("I2C controller back after read failures");
            self.read_warned = false;
        }

        let frame = decode_frame(&buf);

        let mut axis_changes = Vec::new();
        let mut analog_log = String::new();
        for (ch, cal) in &mut self.channels {
            let raw = frame.analog[ch.index];
            let scaled = cal.scale(raw);
            if self.log_samples {
                analog_log.push_str(&sample_log_entry(ch.label, raw, cal, scaled));
            }
            if cal.record(scaled) {
                axis_changes.push((ch.axis, scaled));
            }
        }
        if self.log_samples {
            debug!(
                "i2c raw={:?} dmask={:#06x}{analog_log}",
                frame.analog, frame.mask
            );
        }
        if !axis_changes.is_empty() {
            outputs.emit_axes(&axis_changes)?;
        }

        let diff = mask_diff(self.last_mask, frame.mask);
        self.last_mask = Some(frame.mask);
        for bit in 0..DIGITAL_PIN_COUNT {
            if diff & (1 << bit) == 0 {
                continue;
            }
            let pressed = pin_pressed(frame.mask, bit, self.active_low);
            match self.bindings.get(&bit) {
                Some(act) => {
                    info!(
                        "i2c D{} {} -> {}",
                        bit + PIN_MIN,
                        act.token,
                        if pressed { "DOWN" } else { "UP" }
                    );
                    outputs.apply(act, pressed)?;
                }
                None => {
                    debug!("i2c D{} changed (unmapped)", bit + PIN_MIN);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(analog: [u16; 5], mask: u16) -> [u8; FRAME_BYTES] {
        let mut buf = [0u8; FRAME_BYTES];
        for (i, v) in analog.iter().enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        buf[10..12].copy_from_slice(&mask.to_le_bytes());
        buf
    }

    #[test]
    fn test_decode_frame() {
        let buf = frame_bytes([512, 0, 1023, 7, 300], 0b1010);
        let frame = decode_frame(&buf);
        assert_eq!(frame.analog, [512, 0, 1023, 7, 300]);
        assert_eq!(frame.mask, 0b1010);
    }

    #[test]
    fn test_first_frame_produces_no_diff() {
        assert_eq!(mask_diff(None, 0b1111), 0);
        assert_eq!(mask_diff(Some(0b1111), 0b1111), 0);
        assert_eq!(mask_diff(Some(0b1010), 0b1110), 0b0100);
    }

    #[test]
    fn test_pin_d5_press_release() {
        // D5 sits on mask bit 3. A high-to-low flip is a press under
        // active-low wiring, a release under active-high.
        let bit = 5 - PIN_MIN;
        let before = 1u16 << bit;
        let after = 0u16;
        assert_eq!(mask_diff(Some(before), after), 1 << bit);
        assert!(pin_pressed(after, bit, true));
        assert!(!pin_pressed(after, bit, false));
        assert!(!pin_pressed(before, bit, true));
    }

    #[test]
    fn test_calibration_seed_and_widen() {
        let mut cal = AxisCalibration::default();
        // Seed window: 244..756 around the first sample.
        assert_eq!(cal.scale(500), 50);
        assert_eq!(cal.bounds(), (244, 756));
        assert_eq!(cal.scale(520), 53);
        // Widening keeps old extremes.
        assert_eq!(cal.scale(10), 0);
        assert_eq!(cal.bounds(), (10, 756));
        assert_eq!(cal.scale(520), 68);
    }

    #[test]
    fn test_calibration_seed_clamps_to_adc_range() {
        let mut cal = AxisCalibration::default();
        cal.scale(1000);
        let (min, max) = cal.bounds();
        assert_eq!(max, ADC_MAX);
        assert_eq!(min, ADC_MAX - INITIAL_SPAN);

        let mut cal = AxisCalibration::default();
        cal.scale(5);
        let (min, max) = cal.bounds();
        assert_eq!(min, 0);
        assert_eq!(max, INITIAL_SPAN);
    }

    #[test]
    fn test_calibration_widens_past_adc_max() {
        let mut cal = AxisCalibration::default();
        cal.scale(500);
        // A glitch above the nominal ADC range still stretches the window.
        cal.scale(2000);
        assert_eq!(cal.bounds(), (244, 2000));
        let s_glitch = cal.scale(2000);
        let s_center = cal.scale(500);
        assert_eq!(s_glitch, 100);
        assert!(s_center < s_glitch);
    }

    #[test]
    fn test_calibration_never_narrows() {
        let mut cal = AxisCalibration::default();
        cal.scale(500);
        cal.scale(0);
        cal.scale(1023);
        assert_eq!(cal.bounds(), (0, 1023));
        cal.scale(500);
        assert_eq!(cal.bounds(), (0, 1023));
    }

    #[test]
    fn test_calibration_scaled_range_is_bounded() {
        let mut cal = AxisCalibration::default();
        for raw in [0u16, 100, 512, 900, 1023, 2000] {
            let s = cal.scale(raw);
            assert!((0..=100).contains(&s), "raw {raw} scaled to {s}");
        }
    }

    #[test]
    fn test_update_suppresses_unchanged_values() {
        let mut cal = AxisCalibration::default();
        assert!(cal.update(500).is_some());
        assert_eq!(cal.update(500), None);
        // A one-unit raw wiggle may round to the same scaled value.
        assert_eq!(cal.update(501), None);
        assert!(cal.update(520).is_some());
    }

    #[test]
    fn test_sample_log_entry_includes_full_calibration_state() {
        let mut cal = AxisCalibration::default();
        let scaled = cal.scale(500);
        assert_eq!(
            sample_log_entry("A0", 500, &cal, scaled),
            " A0 raw=500 min=244 max=756 span=512 scaled=50"
        );
    }

    #[test]
    fn test_min_span_floor() {
        let mut cal = AxisCalibration::default();
        cal.scale(500);
        // Force tiny observed range onto a fresh state.
        cal.min_seen = 500;
        cal.max_seen = 505;
        let s = cal.scale(505);
        // Span is floored at MIN_SPAN, so 5 raw units stay well below 100.
        assert_eq!(s, i32::from(5u16) * 100 / i32::from(MIN_SPAN));
    }
}
