//! wattmon — host-resident energy and resource telemetry.
//!
//! Samples per-process CPU, memory, disk, and network activity on a fixed
//! interval, prices each bucket into milliwatt-hours using the hardware
//! RAPL counters, and appends one CSV row per bucket per tick.
//!
//! - `collector` — OS access traits, per-PID counter store, CPU/disk samplers
//! - `net` — port ownership, per-port byte counters, capture workers
//! - `energy` — RAPL unit decoding and the kernel-driver MSR reader
//! - `watchdog` — self-usage anomaly detector
//! - `probe` — the sampling loop and bucket/row arithmetic
//! - `sink` — CSV file and stdout row sinks

pub mod collector;
pub mod energy;
pub mod net;
pub mod probe;
pub mod sink;
pub mod watchdog;
