//! Capture workers: one thread per usable interface, each blocked in the
//! capture library and charging every parsed packet to a per-port counter.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use pcap::{Active, Capture, Device, Error as PcapError, Linktype};
use tracing::{debug, info, warn};

use crate::net::counters::PortCounters;
use crate::net::parser::{Charge, LinkKind, charge_for, parse_frame};

/// Snapshot length: large enough for the whole frame on every link layer.
const SNAPLEN: i32 = 65_536;
/// Capture read timeout; bounds how long a worker stays blocked with no
/// traffic.
const READ_TIMEOUT_MS: i32 = 1_000;

#[derive(Debug)]
pub enum SniffError {
    /// The capture library could not enumerate interfaces at all. Fatal at
    /// startup; typically the capture driver is not installed.
    DeviceList(String),
}

impl fmt::Display for SniffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniffError::DeviceList(msg) => {
                write!(f, "cannot enumerate capture interfaces: {}", msg)
            }
        }
    }
}

impl std::error::Error for SniffError {}

/// The running capture pipeline. Workers live for the whole process; the
/// handles are kept only so the count is observable.
pub struct Sniffer {
    workers: Vec<JoinHandle<()>>,
}

impl Sniffer {
    /// Spawns one capture worker per usable interface.
    ///
    /// An interface qualifies if it is a loopback, or if it is up, running,
    /// and connected. A single interface failing to open is logged and
    /// skipped; an empty device list is not an error (the probe then simply
    /// sees no traffic).
    pub fn start(
        counters: Arc<PortCounters>,
        lockdown: Arc<AtomicBool>,
        capture_loopback: bool,
    ) -> Result<Self, SniffError> {
        let devices = Device::list().map_err(|e| SniffError::DeviceList(e.to_string()))?;

        let mut workers = Vec::new();
        for device in devices {
            let label = device
                .desc
                .clone()
                .unwrap_or_else(|| device.name.clone());
            if !usable(&device) {
                debug!("skipping interface {label}");
                continue;
            }
            match spawn_worker(
                device,
                label.clone(),
                Arc::clone(&counters),
                Arc::clone(&lockdown),
                capture_loopback,
            ) {
                Ok(handle) => {
                    info!("capturing on {label}");
                    workers.push(handle);
                }
                Err(e) => warn!("could not open {label}: {e}"),
            }
        }

        if workers.is_empty() {
            warn!("no capture workers started; network attribution will be empty");
        }
        Ok(Self { workers })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn usable(device: &Device) -> bool {
    let flags = &device.flags;
    flags.is_loopback()
        || (flags.is_up()
            && flags.is_running()
            && flags.connection_status == pcap::ConnectionStatus::Connected)
}

fn spawn_worker(
    device: Device,
    label: String,
    counters: Arc<PortCounters>,
    lockdown: Arc<AtomicBool>,
    capture_loopback: bool,
) -> Result<JoinHandle<()>, PcapError> {
    // The interface's own addresses decide packet direction on non-loopback
    // links; take them before the device is consumed by the capture.
    let local_addrs: HashSet<IpAddr> = device.addresses.iter().map(|a| a.addr).collect();

    let capture = Capture::from_device(device)?
        .snaplen(SNAPLEN)
        .promisc(false)
        .timeout(READ_TIMEOUT_MS)
        .open()?;

    Ok(std::thread::spawn(move || {
        run_worker(
            capture,
            label,
            local_addrs,
            counters,
            lockdown,
            capture_loopback,
        );
    }))
}

fn run_worker(
    mut capture: Capture<Active>,
    label: String,
    local_addrs: HashSet<IpAddr>,
    counters: Arc<PortCounters>,
    lockdown: Arc<AtomicBool>,
    capture_loopback: bool,
) {
    let link = match capture.get_datalink() {
        Linktype::NULL => LinkKind::Loopback,
        Linktype::ETHERNET => LinkKind::Ethernet,
        other => {
            warn!("{label}: unsupported link type {:?}, not capturing", other);
            return;
        }
    };

    loop {
        match capture.next_packet() {
            Ok(packet) => {
                if lockdown.load(Ordering::Relaxed) {
                    continue;
                }
                if link == LinkKind::Loopback && !capture_loopback {
                    continue;
                }

                // Charge the wire length, not the (identical here, but
                // contractually distinct) captured length.
                let wire_len = u64::from(packet.header.len);
                let Some(parsed) = parse_frame(link, packet.data) else {
                    continue;
                };
                match charge_for(link, &parsed, &local_addrs) {
                    Some(Charge::Both { tx, rx }) => {
                        counters.add_tx(tx, wire_len);
                        counters.add_rx(rx, wire_len);
                    }
                    Some(Charge::Tx(port)) => counters.add_tx(port, wire_len),
                    Some(Charge::Rx(port)) => counters.add_rx(port, wire_len),
                    None => {}
                }
            }
            // Quiet interface; keep waiting.
            Err(PcapError::TimeoutExpired) => continue,
            Err(e) => {
                warn!("{label}: capture ended: {e}");
                return;
            }
        }
    }
}
