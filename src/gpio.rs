//! GPIO chip access and edge-event line acquisition.
//!
//! Lines in the monitored range are requested as pulled-up inputs with
//! both-edge detection over the character device. Lines already claimed by
//! another consumer or configured as outputs are skipped so the bridge can
//! coexist with whatever else owns pins on the chip.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpiocdev::chip::Chip;
use gpiocdev::line::{Bias, Direction, EdgeDetection};
use gpiocdev::request::Request;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mapping::{MappingTable, EXCLUDED_OFFSET};

pub const CONSUMER: &str = "gpiopad";

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("failed to open GPIO chip {path}: {source}")]
    ChipOpen {
        path: PathBuf,
        source: gpiocdev::Error,
    },
}

/// One acquired line with its edge-event request.
pub struct MonitoredLine {
    pub offset: u32,
    /// Kernel line name, when the chip provides one.
    pub name: Option<String>,
    pub request: Request,
}

impl MonitoredLine {
    /// File descriptor to poll for pending edge events.
    pub fn event_fd(&self) -> BorrowedFd<'_> {
        // The fd lives as long as the request; the borrow ties it to &self.
        unsafe { BorrowedFd::borrow_raw(self.request.as_raw_fd()) }
    }
}

/// Per-line request knobs shared by every acquisition.
#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    pub debounce: Duration,
    pub event_buffer_size: u32,
}

pub fn open_chip(path: &Path) -> Result<Chip, GpioError> {
    Chip::from_path(path).map_err(|source| GpioError::ChipOpen {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether a line can be requested by us.
///
/// A named consumer counts as busy on its own; some drivers tag a line
/// without setting the used flag.
fn line_is_free(used: bool, has_consumer: bool, is_output: bool) -> bool {
    !used && !has_consumer && !is_output
}

/// Request every mapped, eligible line in `[start, end]`.
///
/// Lines that cannot be queried or are busy are skipped with a log entry.
/// Per-line hardware debounce is attempted first; if the chip rejects the
/// debounce attribute the request is retried without it and the userspace
/// debouncer covers the line alone.
pub fn acquire_lines(
    chip: &Chip,
    chip_path: &Path,
    table: &MappingTable,
    start: u32,
    end: u32,
    opts: &AcquireOptions,
) -> Vec<MonitoredLine> {
    let mut acquired = Vec::new();

    for offset in start..=end {
        if offset == EXCLUDED_OFFSET || !table.lines.contains_key(&offset) {
            continue;
        }

        let info = match chip.line_info(offset) {
            Ok(info) => info,
            Err(err) => {
                debug!("offset {offset}: line info unavailable ({err}), skipped");
                continue;
            }
        };

        if !line_is_free(
            info.used,
            !info.consumer.is_empty(),
            info.direction == Direction::Output,
        ) {
            debug!(
                "offset {offset}: busy (consumer '{}'), skipped",
                info.consumer
            );
            continue;
        }

        let request = match request_line(chip_path, offset, opts, true) {
            Ok(req) => Ok(req),
            Err(err) => {
                warn!("offset {offset}: request with debounce failed ({err}), retrying without");
                request_line(chip_path, offset, opts, false)
            }
        };

        match request {
            Ok(request) => {
                let name = (!info.name.is_empty()).then(|| info.name.clone());
                debug!(
                    "offset {offset} ({}): acquired",
                    name.as_deref().unwrap_or("unnamed")
                );
                acquired.push(MonitoredLine {
                    offset,
                    name,
                    request,
                });
            }
            Err(err) => {
                warn!("offset {offset}: request failed ({err}), skipped");
            }
        }
    }

    acquired
}

fn request_line(
    chip_path: &Path,
    offset: u32,
    opts: &AcquireOptions,
    with_debounce: bool,
) -> Result<Request, gpiocdev::Error> {
    let mut builder = Request::builder();
    builder
        .on_chip(chip_path)
        .with_consumer(CONSUMER)
        .with_kernel_event_buffer_size(opts.event_buffer_size)
        .with_line(offset)
        .as_input()
        .with_bias(Bias::PullUp)
        .with_edge_detection(EdgeDetection::BothEdges);
    if with_debounce && !opts.debounce.is_zero() {
        builder.with_debounce_period(opts.debounce);
    }
    builder.request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_is_free() {
        assert!(line_is_free(false, false, false));
        assert!(!line_is_free(true, false, false));
        // A consumer tag alone marks the line busy.
        assert!(!line_is_free(false, true, false));
        assert!(!line_is_free(false, false, true));
        assert!(!line_is_free(true, true, true));
    }

    // Needs a real GPIO chip (e.g. gpio-sim); run manually on hardware.
    #[test]
    #[ignore]
    fn test_acquire_lines_on_chip0() {
        let path = Path::new("/dev/gpiochip0");
        let chip = open_chip(path).unwrap();
        let table = MappingTable::default_table();
        let opts = AcquireOptions {
            debounce: Duration::from_micros(1000),
            event_buffer_size: 256,
        };
        let lines = acquire_lines(&chip, path, &table, 5, 27, &opts);
        for line in &lines {
            assert!((5..=27).contains(&line.offset));
            assert_ne!(line.offset, EXCLUDED_OFFSET);
        }
    }
}
