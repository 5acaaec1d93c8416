//! wattmond — per-process energy telemetry daemon.
//!
//! Wires the components together: capture workers, energy meter, watchdog,
//! row sink, and the sampling loop. Rows land in a daily CSV next to the
//! binary (or on stdout), diagnostics in `logs/`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(not(windows))]
use wattmon::collector::MockSystem;
#[cfg(windows)]
use wattmon::collector::WindowsSystem;
#[cfg(windows)]
use wattmon::energy::DriverMsrReader;
use wattmon::energy::EnergyMeter;
#[cfg(not(windows))]
use wattmon::energy::MockMsr;
use wattmon::net::{PortCounters, Sniffer};
use wattmon::probe::{Probe, ProbeConfig};
use wattmon::sink::{CsvFileSink, RowSink, StdoutSink, current_username};
use wattmon::watchdog::UsageWatchdog;

/// Per-process energy telemetry probe.
#[derive(Parser)]
#[command(name = "wattmond", about = "Per-process energy telemetry probe", version)]
struct Args {
    /// Hide the console window (Windows only).
    #[arg(short = 'c', long)]
    hide_console: bool,

    /// Disable the self-usage watchdog.
    #[arg(short = 'w', long)]
    no_watchdog: bool,

    /// Sampling interval in seconds.
    #[arg(short, long, default_value_t = 10)]
    interval: u64,

    /// Disk read energy cost in mW per MB/s.
    #[arg(long, default_value_t = 0.78)]
    drcost: f64,

    /// Disk write energy cost in mW per MB/s.
    #[arg(long, default_value_t = 0.98)]
    dwcost: f64,

    /// Drop loopback traffic instead of charging it to both endpoints.
    #[arg(short = 'l', long)]
    no_loopbackcap: bool,

    /// Write rows to stdout instead of the daily CSV file.
    #[arg(long)]
    stdoutput: bool,

    /// Read the platform energy register instead of the package register.
    #[arg(long)]
    use_platform: bool,
}

/// Diagnostics go to a rolling file under `logs/`; the level defaults to
/// INFO and follows `RUST_LOG` when set.
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let appender = tracing_appender::rolling::daily("logs", "log.txt");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging();

    if args.hide_console {
        #[cfg(windows)]
        wattmon::collector::windows::hide_console();
        #[cfg(not(windows))]
        warn!("--hide-console has no effect on this platform");
    }

    info!("wattmond {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "config: interval={}s drcost={} dwcost={} watchdog={} loopback_capture={} register={}",
        args.interval,
        args.drcost,
        args.dwcost,
        !args.no_watchdog,
        !args.no_loopbackcap,
        if args.use_platform { "platform" } else { "package" },
    );

    let counters = Arc::new(PortCounters::new());
    let lockdown = Arc::new(AtomicBool::new(false));

    let sniffer = Sniffer::start(
        Arc::clone(&counters),
        Arc::clone(&lockdown),
        !args.no_loopbackcap,
    )
    .context("starting packet capture")?;
    info!("{} capture workers running", sniffer.worker_count());

    #[cfg(windows)]
    let meter = {
        let driver = DriverMsrReader::open().context("opening the MSR driver device")?;
        EnergyMeter::new(driver, args.use_platform).context("calibrating energy units")?
    };
    #[cfg(not(windows))]
    let meter = {
        warn!("no MSR driver on this platform; energy readings will be zero");
        EnergyMeter::new(MockMsr::new(), args.use_platform).context("calibrating energy units")?
    };

    #[cfg(windows)]
    let source = WindowsSystem::new();
    #[cfg(not(windows))]
    let source = {
        warn!("no native process source on this platform; sampling scripted data");
        MockSystem::typical_host()
    };

    let sink: Box<dyn RowSink> = if args.stdoutput {
        Box::new(StdoutSink)
    } else {
        Box::new(CsvFileSink::open(".", current_username()).context("opening the daily CSV file")?)
    };

    let watchdog = UsageWatchdog::new(!args.no_watchdog);

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to install signal handler: {e}");
    }

    let config = ProbeConfig {
        interval: Duration::from_secs(args.interval.max(1)),
        disk_read_cost: args.drcost,
        disk_write_cost: args.dwcost,
    };
    let mut probe = Probe::new(source, meter, watchdog, sink, counters, lockdown, config);

    info!("sampling every {} s", args.interval.max(1));
    probe.run(&running);

    info!("shutdown complete");
    Ok(())
}
