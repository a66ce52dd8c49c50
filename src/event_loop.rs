//! The single-threaded bridge loop.
//!
//! One `poll(2)` suspension multiplexes every GPIO event fd with the
//! peripheral deadline. Ready lines are fully drained before the
//! peripheral turn so a chatty controller cannot starve edge handling,
//! and the poll deadline is rescheduled at a fixed rate from the pre-poll
//! instant rather than from completion.

use std::time::Instant;

use anyhow::Context;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info};

use crate::debounce::{is_press, Debouncer};
use crate::emitter::VirtualOutputs;
use crate::gpio::MonitoredLine;
use crate::mapping::MappingTable;
use crate::peripheral::PeripheralPoller;

pub struct EventLoop {
    pub lines: Vec<MonitoredLine>,
    pub mapping: MappingTable,
    pub debouncer: Debouncer,
    pub outputs: VirtualOutputs,
    pub poller: Option<PeripheralPoller>,
    pub active_low: bool,
}

impl EventLoop {
    /// Run until a fatal error. Only emission and fd-level failures are
    /// fatal; everything transient is logged and skipped.
    pub fn run(self) -> anyhow::Result<()> {
        let Self {
            lines,
            mapping,
            mut debouncer,
            mut outputs,
            mut poller,
            active_low,
        } = self;

        loop {
            let timeout = match poller.as_ref() {
                Some(p) => duration_to_timeout(p.timeout_until_due(Instant::now())),
                None => PollTimeout::NONE,
            };

            let mut pfds: Vec<PollFd> = lines
                .iter()
                .map(|line| PollFd::new(line.event_fd(), PollFlags::POLLIN))
                .collect();

            match poll(&mut pfds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("poll failed"),
            }

            let ready: Vec<usize> = pfds
                .iter()
                .enumerate()
                .filter(|(_, pfd)| pfd.revents().is_some_and(|r| !r.is_empty()))
                .map(|(idx, _)| idx)
                .collect();
            drop(pfds);

            for idx in ready {
                drain_line(
                    &lines[idx],
                    &mapping,
                    &mut debouncer,
                    &mut outputs,
                    active_low,
                )?;
            }

            if let Some(p) = poller.as_mut() {
                let now = Instant::now();
                if p.is_due(now) {
                    p.poll(&mut outputs).context("peripheral poll")?;
                    p.reschedule(now);
                }
            }
        }
    }
}

/// Read every queued edge event on one line and act on it.
fn drain_line(
    line: &MonitoredLine,
    mapping: &MappingTable,
    debouncer: &mut Debouncer,
    outputs: &mut VirtualOutputs,
    active_low: bool,
) -> anyhow::Result<()> {
    loop {
        let pending = line
            .request
            .has_edge_event()
            .with_context(|| format!("edge-event check on offset {}", line.offset))?;
        if !pending {
            return Ok(());
        }

        let event = line
            .request
            .read_edge_event()
            .with_context(|| format!("edge-event read on offset {}", line.offset))?;

        if !debouncer.accept(line.offset, event.timestamp_ns) {
            debug!("offset {}: edge within debounce window, dropped", line.offset);
            continue;
        }

        let pressed = is_press(event.kind, active_low);

        let Some(action) = mapping.lines.get(&line.offset) else {
            debug!("offset {}: edge on unmapped line", line.offset);
            continue;
        };

        info!(
            "t_ns={} offset={} name={} token={} -> {}",
            event.timestamp_ns,
            line.offset,
            line.name.as_deref().unwrap_or("-"),
            action.token,
            if pressed { "DOWN" } else { "UP" }
        );

        outputs
            .apply(action, pressed)
            .with_context(|| format!("emitting action for offset {}", line.offset))?;
    }
}

/// Clamp a deadline distance into a millisecond poll timeout.
///
/// A nonzero sub-millisecond remainder rounds up so a deadline never
/// degenerates into a zero-timeout spin.
fn duration_to_timeout(d: std::time::Duration) -> PollTimeout {
    if d.is_zero() {
        return PollTimeout::ZERO;
    }
    let ms = d.as_millis();
    if ms == 0 {
        return PollTimeout::from(1u16);
    }
    let ms = ms.min(u128::from(u16::MAX)) as u16;
    PollTimeout::from(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_duration_to_timeout() {
        assert_eq!(duration_to_timeout(Duration::ZERO), PollTimeout::ZERO);
        assert_eq!(
            duration_to_timeout(Duration::from_micros(300)),
            PollTimeout::from(1u16)
        );
        assert_eq!(
            duration_to_timeout(Duration::from_millis(5)),
            PollTimeout::from(5u16)
        );
        assert_eq!(
            duration_to_timeout(Duration::from_secs(3600)),
            PollTimeout::from(u16::MAX)
        );
    }
}
