//! GPIO/I2C Input Bridge
//!
//! Main entry point: CLI parsing, startup wiring, event loop launch.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use gpiopad::action;
use gpiopad::debounce::Debouncer;
use gpiopad::emitter::{Capabilities, VirtualOutputs};
use gpiopad::event_loop::EventLoop;
use gpiopad::gpio::{self, AcquireOptions};
use gpiopad::mapping::{AutoMode, MappingTable};
use gpiopad::peripheral::PeripheralPoller;

#[derive(Parser)]
#[command(name = "gpiopad")]
#[command(about = "Expose GPIO lines and an I2C controller as virtual gamepad/keyboard devices")]
struct Cli {
    /// GPIO character device to monitor
    #[arg(long, default_value = "/dev/gpiochip0")]
    chip: PathBuf,

    /// First line offset to monitor
    #[arg(long, default_value_t = 5)]
    start: u32,

    /// Last line offset to monitor (inclusive, clamped to the chip)
    #[arg(long, default_value_t = 27)]
    end: u32,

    /// Debounce window in microseconds (0 disables)
    #[arg(long, default_value_t = 1000)]
    debounce_us: u64,

    /// Kernel edge-event buffer size per line
    #[arg(long, default_value_t = 256)]
    event_buf: u32,

    /// Mapping file (<target> <token> per line); built-in defaults if absent
    #[arg(long)]
    map: Option<PathBuf>,

    /// Treat high levels as pressed (default wiring is active-low pull-up)
    #[arg(long)]
    active_high: bool,

    /// Action source for lines the mapping leaves unmapped
    #[arg(long, value_enum, default_value_t = AutoMode::Buttons)]
    auto: AutoMode,

    /// I2C bus number for the analog/digital controller (off when absent)
    #[arg(long)]
    i2c_bus: Option<u8>,

    /// Controller address on the I2C bus
    #[arg(long, default_value = "0x42", value_parser = parse_addr)]
    i2c_addr: u16,

    /// Controller poll interval in milliseconds
    #[arg(long, default_value_t = 5)]
    i2c_interval_ms: u64,

    /// Log every changed analog sample with its calibration range
    #[arg(long)]
    i2c_log: bool,

    /// Skip the analog axes; poll digital pins only
    #[arg(long)]
    i2c_no_axes: bool,

    /// Print every recognized mapping target and token, then exit
    #[arg(long)]
    list_options: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Floor the poll interval at 1 ms; a zero interval would turn the event
/// loop's wait into a busy spin.
fn effective_interval(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

/// Accept `0x42` and `66` alike.
fn parse_addr(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("bad I2C address '{s}': {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_options {
        action::print_token_catalog();
        return Ok(());
    }

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    raise_scheduling_priority();

    let chip = gpio::open_chip(&cli.chip)?;
    let chip_info = chip
        .info()
        .with_context(|| format!("querying chip {:?}", cli.chip))?;
    let mut end = cli.end;
    if end >= chip_info.num_lines {
        end = chip_info.num_lines - 1;
        warn!(
            "end clamped to {end} ({} has {} lines)",
            chip_info.name, chip_info.num_lines
        );
    }
    if cli.start > end {
        bail!("start offset {} is past end offset {end}", cli.start);
    }

    let mut table = match &cli.map {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading mapping file {path:?}"))?;
            MappingTable::parse(&text)
        }
        None => MappingTable::default_table(),
    };
    table.retain_in_range(cli.start, end);
    table.auto_assign(cli.start, end, cli.auto);

    let active_low = !cli.active_high;

    let opts = AcquireOptions {
        debounce: Duration::from_micros(cli.debounce_us),
        event_buffer_size: cli.event_buf,
    };
    let lines = gpio::acquire_lines(&chip, &cli.chip, &table, cli.start, end, &opts);

    let poller = match cli.i2c_bus {
        Some(bus) => Some(PeripheralPoller::new(
            bus,
            cli.i2c_addr,
            effective_interval(cli.i2c_interval_ms),
            &table.pins,
            !cli.i2c_no_axes,
            cli.i2c_log,
            active_low,
        )?),
        None => {
            if !table.pins.is_empty() {
                warn!(
                    "{} peripheral pin mappings ignored (no --i2c-bus)",
                    table.pins.len()
                );
                table.pins.clear();
            }
            None
        }
    };

    let peripheral_active = poller.as_ref().is_some_and(|p| p.has_inputs());
    if lines.is_empty() && !peripheral_active {
        bail!("no GPIO lines acquired and no peripheral inputs configured");
    }
    if lines.is_empty() {
        warn!("no GPIO lines acquired; running on peripheral inputs only");
    }

    let analog_axes = poller.as_ref().map(|p| p.analog_axes()).unwrap_or_default();
    let caps = Capabilities::from_mapping(&table, &analog_axes);
    let outputs = VirtualOutputs::create(&caps)?;

    info!(
        "monitoring {} lines on {} (offsets {}..={end}, {})",
        lines.len(),
        chip_info.name,
        cli.start,
        if active_low { "active-low" } else { "active-high" }
    );
    info!(
        "mapping: {} lines, {} pins, debounce {}us",
        table.lines.len(),
        table.pins.len(),
        cli.debounce_us
    );

    EventLoop {
        lines,
        mapping: table,
        debouncer: Debouncer::new(cli.debounce_us * 1000),
        outputs,
        poller,
        active_low,
    }
    .run()
}

/// Ask for SCHED_FIFO so edge-to-event latency stays low under load.
/// Needs CAP_SYS_NICE; failure is expected for unprivileged runs.
fn raise_scheduling_priority() {
    let param = libc::sched_param {
        sched_priority: unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) },
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!("could not switch to SCHED_FIFO, continuing with normal scheduling");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_interval_floors_at_one_ms() {
        assert_eq!(effective_interval(0), Duration::from_millis(1));
        assert_eq!(effective_interval(1), Duration::from_millis(1));
        assert_eq!(effective_interval(5), Duration::from_millis(5));
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("0x42"), Ok(0x42));
        assert_eq!(parse_addr("0X10"), Ok(0x10));
        assert_eq!(parse_addr("66"), Ok(66));
        assert!(parse_addr("zz").is_err());
        assert!(parse_addr("0x").is_err());
    }
}
