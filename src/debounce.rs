//! Edge classification and userspace debounce.
//!
//! Debounce runs on the hardware timestamp carried in each edge event, not
//! on wall-clock receive time, so bursts that arrive together in one drain
//! still debounce correctly. Kernel-side debounce (when the chip accepts
//! the attribute) and this filter stack; the userspace window is the
//! backstop for chips without the attribute.

use std::collections::HashMap;

use gpiocdev::line::EdgeKind;

/// Map an edge to a logical press/release under the active-low policy.
///
/// With active-low wiring (pull-up to a grounding switch) the falling edge
/// is the press; active-high inverts that.
pub fn is_press(kind: EdgeKind, active_low: bool) -> bool {
    match kind {
        EdgeKind::Falling => active_low,
        EdgeKind::Rising => !active_low,
    }
}

/// Per-line timestamp window filter.
#[derive(Debug)]
pub struct Debouncer {
    window_ns: u64,
    last_accept_ns: HashMap<u32, u64>,
}

impl Debouncer {
    pub fn new(window_ns: u64) -> Self {
        Self {
            window_ns,
            last_accept_ns: HashMap::new(),
        }
    }

    /// Accept or reject an edge at hardware time `ts_ns` on `offset`.
    ///
    /// An edge is rejected only when it lands within the window after the
    /// last accepted edge on the same line. A timestamp earlier than the
    /// last accepted one is accepted and becomes the new reference, so a
    /// clock discontinuity cannot wedge a line shut.
    pub fn accept(&mut self, offset: u32, ts_ns: u64) -> bool {
        if self.window_ns > 0 {
            if let Some(&last) = self.last_accept_ns.get(&offset) {
                if ts_ns >= last && ts_ns - last < self.window_ns {
                    return false;
                }
            }
        }
        self.last_accept_ns.insert(offset, ts_ns);
        true
    }
}
