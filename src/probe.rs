//! The sampling loop.
//!
//! One `Probe` value owns every component: the OS source, the counter
//! store, the CPU/disk samplers, the port map, the shared per-port byte
//! counters, the energy meter, the watchdog, and the row sink. Each tick it
//! walks the process table, merges measurements into named buckets, prices
//! them into milliwatt-hours, and hands the rows to the sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, Utc};
use tracing::{debug, info, warn};

use crate::collector::{CounterStore, CpuSampler, IoDelta, SystemSource, disk_delta};
use crate::energy::{EnergyMeter, MsrReader};
use crate::net::{PortCounters, PortMap};
use crate::sink::RowSink;
use crate::watchdog::UsageWatchdog;

/// Bucket holding every process on the host.
pub const SYSTEM_TOTAL: &str = "System Total";
/// Bucket holding named, non-service processes.
pub const APPLICATION_TOTAL: &str = "Application Total";
/// Bucket holding services and unnamed processes.
pub const NOT_RECORDED_TOTAL: &str = "Not recorded Total";
/// Pseudo-bucket carrying the tick's CPU energy scale.
pub const CPU_ENERGY: &str = "CPU Energy";
/// Name used when a process cannot be resolved.
pub const UNKNOWN_PROCESS: &str = "<unknown>";

/// Network transfer cost: mWh per MB/s of sustained bandwidth.
/// 10 Mb/s => 306 mW => 244.8 mW per MB/s => 0.068 mWh per MB/s.
const NET_WH_PER_MBPS: f64 = 0.068;
/// How long the loop pauses when the watchdog trips.
const LOCKDOWN_PAUSE: Duration = Duration::from_secs(60);
/// Granularity of the interruptible sleep.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Loop parameters fixed at startup.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Tick period.
    pub interval: Duration,
    /// Disk read cost, mW per MB/s.
    pub disk_read_cost: f64,
    /// Disk write cost, mW per MB/s.
    pub disk_write_cost: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            disk_read_cost: 0.78,
            disk_write_cost: 0.98,
        }
    }
}

/// Raw quantities accumulated into one named bucket during a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketTotals {
    pub cpu_fraction: f64,
    pub ram_bytes: u64,
    pub net_up_bytes: u64,
    pub net_down_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// One output row: a named bucket priced for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub name: String,
    pub cpu_percent: f64,
    pub cpu_wh: f64,
    pub net_up_mbps: f64,
    pub net_up_wh: f64,
    pub net_down_mbps: f64,
    pub net_down_wh: f64,
    pub disk_read_mbps: f64,
    pub disk_write_mbps: f64,
    pub disk_read_wh: f64,
    pub disk_write_wh: f64,
    pub ram_bytes: u64,
    pub total_wh: f64,
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

fn accumulate(buckets: &mut HashMap<String, BucketTotals>, name: &str, sample: &BucketTotals) {
    let bucket = buckets.entry(name.to_string()).or_default();
    bucket.cpu_fraction += sample.cpu_fraction;
    bucket.ram_bytes += sample.ram_bytes;
    bucket.net_up_bytes += sample.net_up_bytes;
    bucket.net_down_bytes += sample.net_down_bytes;
    bucket.disk_read_bytes += sample.disk_read_bytes;
    bucket.disk_write_bytes += sample.disk_write_bytes;
}

/// Prices every bucket into a row.
///
/// `duration_secs` is the gathering duration, already clamped to at least
/// one interval; `energy_wh` is the tick's total CPU energy in mWh,
/// distributed across buckets in proportion to their CPU fraction.
pub fn build_rows(
    buckets: &HashMap<String, BucketTotals>,
    energy_wh: f64,
    duration_secs: f64,
    config: &ProbeConfig,
    timestamp: i64,
) -> Vec<Row> {
    let mut rows = Vec::with_capacity(buckets.len());
    for (name, totals) in buckets {
        let net_up_mbps = totals.net_up_bytes as f64 / 1e6 / duration_secs;
        let net_down_mbps = totals.net_down_bytes as f64 / 1e6 / duration_secs;
        let net_up_wh = NET_WH_PER_MBPS * net_up_mbps;
        let net_down_wh = NET_WH_PER_MBPS * net_down_mbps;

        let cpu_wh = finite_or_zero(energy_wh * totals.cpu_fraction);
        let cpu_percent = finite_or_zero(totals.cpu_fraction * 100.0);

        let disk_read_mbps = totals.disk_read_bytes as f64 / 1e6 / duration_secs;
        let disk_write_mbps = totals.disk_write_bytes as f64 / 1e6 / duration_secs;
        let disk_read_wh = disk_read_mbps * config.disk_read_cost / 3_600.0;
        let disk_write_wh = disk_write_mbps * config.disk_write_cost / 3_600.0;

        rows.push(Row {
            timestamp,
            name: name.clone(),
            cpu_percent,
            cpu_wh,
            net_up_mbps,
            net_up_wh,
            net_down_mbps,
            net_down_wh,
            disk_read_mbps,
            disk_write_mbps,
            disk_read_wh,
            disk_write_wh,
            ram_bytes: totals.ram_bytes,
            total_wh: cpu_wh + net_up_wh + net_down_wh + disk_read_wh + disk_write_wh,
        });
    }
    rows
}

/// The assembled probe. Owns all sampling state; capture workers share only
/// the counter arrays and the lockdown flag.
pub struct Probe<S: SystemSource, R: MsrReader> {
    config: ProbeConfig,
    source: S,
    meter: EnergyMeter<R>,
    watchdog: UsageWatchdog,
    sink: Box<dyn RowSink>,
    counters: Arc<PortCounters>,
    lockdown: Arc<AtomicBool>,
    port_map: PortMap,
    store: CounterStore,
    cpu: CpuSampler,
    current_day: Option<u32>,
}

impl<S: SystemSource, R: MsrReader> Probe<S, R> {
    pub fn new(
        source: S,
        meter: EnergyMeter<R>,
        watchdog: UsageWatchdog,
        sink: Box<dyn RowSink>,
        counters: Arc<PortCounters>,
        lockdown: Arc<AtomicBool>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            config,
            source,
            meter,
            watchdog,
            sink,
            counters,
            lockdown,
            port_map: PortMap::new(),
            store: CounterStore::new(),
            cpu: CpuSampler::new(),
            current_day: None,
        }
    }

    /// Overrides the CPU sampler (fixed processor count in tests).
    pub fn with_cpu_sampler(mut self, sampler: CpuSampler) -> Self {
        self.cpu = sampler;
        self
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Runs until `running` is cleared. Sleeps are sliced so a shutdown
    /// signal interrupts them promptly.
    pub fn run(&mut self, running: &AtomicBool) {
        self.refresh_port_map();

        while running.load(Ordering::SeqCst) {
            if self.watchdog.is_lockdown() {
                info!(
                    "watchdog lockdown, pausing for {} s",
                    LOCKDOWN_PAUSE.as_secs()
                );
                interruptible_sleep(LOCKDOWN_PAUSE, running);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                // The tick below pushes a fresh self-usage sample, which
                // decides whether the lockdown persists.
            }

            let started = Instant::now();
            self.tick();
            debug!("tick took {} ms", started.elapsed().as_millis());

            if let Some(remaining) = self.config.interval.checked_sub(started.elapsed()) {
                interruptible_sleep(remaining, running);
            }
        }

        self.sink.flush();
        info!("sampling loop stopped");
    }

    /// One sampling pass: measure, bucket, price, emit, housekeep.
    pub fn tick(&mut self) {
        let started = Instant::now();
        self.roll_day_if_needed();

        let energy_wh = match self.meter.read_wh() {
            Ok(wh) => wh,
            Err(e) => {
                warn!("energy read failed, accounting 0 for this tick: {e}");
                0.0
            }
        };

        self.store.begin_tick();

        let pids = match self.source.pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!("{e}; skipping this tick");
                self.refresh_port_map();
                return;
            }
        };
        self.source.refresh_services();

        let own_pid = self.source.own_pid();
        let mut own_cpu_fraction = 0.0;
        let mut buckets: HashMap<String, BucketTotals> = HashMap::new();

        for pid in pids {
            let wall = self.source.wall_clock();
            let (name, cpu_fraction, ram_bytes, io) = match self.source.open_process(pid) {
                Some(probe) => {
                    let name = probe
                        .name()
                        .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());
                    let cpu_fraction = match probe.cpu_times() {
                        Some(times) => {
                            self.cpu
                                .sample(&mut self.store, pid, times.user, times.kernel, wall)
                        }
                        None => 0.0,
                    };
                    let io = match probe.io_counters() {
                        Some(counters) => disk_delta(&mut self.store, pid, counters),
                        None => IoDelta::default(),
                    };
                    (name, cpu_fraction, probe.working_set(), io)
                }
                // Access denied: zero CPU/RAM/disk, but the port map still
                // attributes network bytes to the PID below.
                None => (UNKNOWN_PROCESS.to_string(), 0.0, 0, IoDelta::default()),
            };
            let cpu_fraction = finite_or_zero(cpu_fraction);

            let ports = self.port_map.ports_for(pid);
            let (net_up_bytes, net_down_bytes) = self.counters.sum_for(&ports);

            let sample = BucketTotals {
                cpu_fraction,
                ram_bytes,
                net_up_bytes,
                net_down_bytes,
                disk_read_bytes: io.read_bytes,
                disk_write_bytes: io.write_bytes,
            };

            accumulate(&mut buckets, SYSTEM_TOTAL, &sample);
            if !self.source.is_service(pid) && name != UNKNOWN_PROCESS {
                accumulate(&mut buckets, &name, &sample);
                accumulate(&mut buckets, APPLICATION_TOTAL, &sample);
            } else {
                accumulate(&mut buckets, NOT_RECORDED_TOTAL, &sample);
            }

            if pid == own_pid {
                own_cpu_fraction = cpu_fraction;
            }
        }

        // The energy scale itself, as a bucket: full CPU fraction, nothing
        // else, so consumers can divide cpu_wh rows by it.
        accumulate(
            &mut buckets,
            CPU_ENERGY,
            &BucketTotals {
                cpu_fraction: 1.0,
                ..BucketTotals::default()
            },
        );

        self.counters.reset();
        self.store.purge_stale();

        let duration_secs = started
            .elapsed()
            .as_secs_f64()
            .max(self.config.interval.as_secs_f64());
        let rows = build_rows(
            &buckets,
            energy_wh,
            duration_secs,
            &self.config,
            Utc::now().timestamp(),
        );
        for row in &rows {
            if let Err(e) = self.sink.write_row(row) {
                warn!("sink write failed: {e}");
            }
        }
        self.sink.flush();

        self.watchdog.push_sample(own_cpu_fraction);
        self.lockdown
            .store(self.watchdog.is_lockdown(), Ordering::Relaxed);

        self.refresh_port_map();
    }

    fn refresh_port_map(&mut self) {
        match self.source.socket_rows() {
            Ok(rows) => self.port_map.rebuild(&rows),
            Err(e) => warn!("{e}; keeping previous port map"),
        }
    }

    fn roll_day_if_needed(&mut self) {
        let today = Local::now().day();
        match self.current_day {
            None => self.current_day = Some(today),
            Some(day) if day != today => {
                debug!("new day, rotating sink");
                if let Err(e) = self.sink.rotate() {
                    warn!("sink rotation failed: {e}");
                }
                self.current_day = Some(today);
            }
            Some(_) => {}
        }
    }
}

/// Sleeps `total` in short slices, returning early when `running` clears.
fn interruptible_sleep(total: Duration, running: &AtomicBool) {
    let mut remaining = total;
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        let nap = remaining.min(SLEEP_SLICE);
        std::thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::collector::{MockProcess, MockSystem};
    use crate::energy::{MSR_PKG_ENERGY_STATUS, MockMsr};

    /// Sink that hands every row back to the test.
    struct TestSink {
        rows: Arc<Mutex<Vec<Row>>>,
    }

    impl RowSink for TestSink {
        fn write_row(&mut self, row: &Row) -> std::io::Result<()> {
            self.rows.lock().unwrap().push(row.clone());
            Ok(())
        }

        fn rotate(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn flush(&mut self) {}
    }

    struct Harness {
        probe: Probe<MockSystem, MockMsr>,
        rows: Arc<Mutex<Vec<Row>>>,
        counters: Arc<PortCounters>,
        msr: MockMsr,
    }

    fn harness(system: MockSystem, watchdog: UsageWatchdog) -> Harness {
        let counters = Arc::new(PortCounters::new());
        let lockdown = Arc::new(AtomicBool::new(false));
        let rows = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(TestSink {
            rows: Arc::clone(&rows),
        });
        let msr = MockMsr::new();
        let meter = EnergyMeter::new(msr.clone(), false).unwrap();
        let probe = Probe::new(
            system,
            meter,
            watchdog,
            sink,
            Arc::clone(&counters),
            lockdown,
            ProbeConfig::default(),
        )
        .with_cpu_sampler(CpuSampler::with_cpus(4));
        Harness {
            probe,
            rows,
            counters,
            msr,
        }
    }

    fn take_rows(harness: &Harness) -> Vec<Row> {
        std::mem::take(&mut *harness.rows.lock().unwrap())
    }

    fn find<'a>(rows: &'a [Row], name: &str) -> &'a Row {
        rows.iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("no row named {name}"))
    }

    #[test]
    fn test_tick_emits_all_aggregate_rows() {
        let mut h = harness(MockSystem::typical_host(), UsageWatchdog::new(false));
        h.probe.tick();
        let rows = take_rows(&h);

        for name in [SYSTEM_TOTAL, APPLICATION_TOTAL, NOT_RECORDED_TOTAL, CPU_ENERGY] {
            assert!(rows.iter().any(|r| r.name == name), "missing {name}");
        }
        // Named user processes get their own buckets; services do not.
        assert!(rows.iter().any(|r| r.name == "browser.exe"));
        assert!(!rows.iter().any(|r| r.name == "svchost.exe"));
    }

    #[test]
    fn test_full_core_process_reads_25_percent_on_quad_core() {
        let mut system = MockSystem::new();
        system.push(MockProcess::new(10, "miner.exe"));
        let mut h = harness(system, UsageWatchdog::new(false));

        h.probe.tick();
        take_rows(&h);

        // One full core for 100 000 wall units on a 4-cpu sampler.
        let sys = h.probe.source_mut();
        sys.advance_wall(100_000);
        sys.process_mut(10).unwrap().user_time += 100_000;
        h.probe.tick();

        let rows = take_rows(&h);
        let row = find(&rows, "miner.exe");
        assert!((row.cpu_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_ten_megabytes_over_ten_seconds_prices_at_0_068() {
        let mut system = MockSystem::new();
        let mut app = MockProcess::new(10, "uploader.exe");
        app.ports = vec![5000];
        system.push(app);
        let mut h = harness(system, UsageWatchdog::new(false));

        // Prime the port map, then let the sniffer "capture" 10 MB.
        h.probe.refresh_port_map();
        h.counters.add_tx(5000, 10_000_000);
        h.probe.tick();

        let rows = take_rows(&h);
        let row = find(&rows, "uploader.exe");
        assert!((row.net_up_mbps - 1.0).abs() < 1e-9);
        assert!((row.net_up_wh - 0.068).abs() < 1e-9);
        assert_eq!(row.net_down_mbps, 0.0);

        // Counters were reset after aggregation.
        assert_eq!(h.counters.tx_bytes(5000), 0);
    }

    #[test]
    fn test_cpu_energy_row_carries_the_full_tick_energy() {
        let mut h = harness(MockSystem::typical_host(), UsageWatchdog::new(false));
        h.probe.tick();
        take_rows(&h);

        // 36 864 increments at 2^-14 J = 2.25 J = 0.625 mWh.
        h.msr.set(MSR_PKG_ENERGY_STATUS, 36_864);
        h.probe.tick();

        let rows = take_rows(&h);
        let row = find(&rows, CPU_ENERGY);
        assert!((row.cpu_percent - 100.0).abs() < 1e-9);
        assert!((row.cpu_wh - 0.625).abs() < 1e-9);
        assert_eq!(row.ram_bytes, 0);
        assert_eq!(row.net_up_mbps, 0.0);
        assert_eq!(row.total_wh, row.cpu_wh);
    }

    #[test]
    fn test_system_total_covers_application_and_not_recorded() {
        let mut system = MockSystem::typical_host();
        system.process_mut(1200).unwrap().user_time = 0;
        let mut h = harness(system, UsageWatchdog::new(false));

        h.probe.tick();
        take_rows(&h);

        let sys = h.probe.source_mut();
        sys.advance_wall(100_000);
        sys.process_mut(1200).unwrap().user_time += 50_000;
        sys.process_mut(900).unwrap().kernel_time += 20_000;
        h.probe.tick();

        let rows = take_rows(&h);
        let total = find(&rows, SYSTEM_TOTAL).cpu_percent;
        let app = find(&rows, APPLICATION_TOTAL).cpu_percent;
        let rest = find(&rows, NOT_RECORDED_TOTAL).cpu_percent;
        assert!(total >= app + rest - 1e-9);
        assert!(total > 0.0);
    }

    #[test]
    fn test_denied_process_lands_in_not_recorded_with_network_bytes() {
        let mut system = MockSystem::new();
        let mut ghost = MockProcess::new(66, "ghost.exe");
        ghost.deny = true;
        ghost.ports = vec![7777];
        ghost.user_time = 1_000_000;
        ghost.working_set = 1 << 30;
        system.push(ghost);
        let mut h = harness(system, UsageWatchdog::new(false));

        h.probe.refresh_port_map();
        h.counters.add_rx(7777, 4_000);
        h.probe.tick();

        let rows = take_rows(&h);
        assert!(!rows.iter().any(|r| r.name == "ghost.exe"));
        let rest = find(&rows, NOT_RECORDED_TOTAL);
        // Denied handle: no CPU or RAM, but the port map still charges it.
        assert_eq!(rest.cpu_percent, 0.0);
        assert_eq!(rest.ram_bytes, 0);
        assert!(rest.net_down_mbps > 0.0);
    }

    #[test]
    fn test_lockdown_flag_follows_watchdog() {
        let mut system = MockSystem::new();
        system.push(MockProcess::new(4242, "wattmond.exe"));
        system.set_own_pid(4242);
        let watchdog = UsageWatchdog::with_window(true, Duration::ZERO);
        let mut h = harness(system, watchdog);

        // Calibrates on a zero baseline.
        h.probe.tick();
        assert!(!h.probe.lockdown.load(Ordering::Relaxed));

        // The probe itself starts burning CPU: above 3 × 0 baseline.
        let sys = h.probe.source_mut();
        sys.advance_wall(100_000);
        sys.process_mut(4242).unwrap().user_time += 50_000;
        h.probe.tick();
        assert!(h.probe.lockdown.load(Ordering::Relaxed));
    }

    #[test]
    fn test_buckets_merge_same_named_processes() {
        let mut system = MockSystem::new();
        let mut a = MockProcess::new(1, "worker.exe");
        a.working_set = 100;
        let mut b = MockProcess::new(2, "worker.exe");
        b.working_set = 200;
        system.push(a);
        system.push(b);
        let mut h = harness(system, UsageWatchdog::new(false));

        h.probe.tick();
        let rows = take_rows(&h);
        let row = find(&rows, "worker.exe");
        assert_eq!(row.ram_bytes, 300);
    }

    #[test]
    fn test_build_rows_handles_empty_buckets() {
        let rows = build_rows(&HashMap::new(), 1.0, 10.0, &ProbeConfig::default(), 0);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_disk_pricing_uses_costs_over_3600() {
        let mut buckets = HashMap::new();
        buckets.insert(
            "d.exe".to_string(),
            BucketTotals {
                disk_read_bytes: 10_000_000,
                disk_write_bytes: 20_000_000,
                ..BucketTotals::default()
            },
        );
        let config = ProbeConfig::default();
        let rows = build_rows(&buckets, 0.0, 10.0, &config, 0);
        let row = &rows[0];
        assert!((row.disk_read_mbps - 1.0).abs() < 1e-9);
        assert!((row.disk_write_mbps - 2.0).abs() < 1e-9);
        assert!((row.disk_read_wh - 0.78 / 3_600.0).abs() < 1e-12);
        assert!((row.disk_write_wh - 2.0 * 0.98 / 3_600.0).abs() < 1e-12);
        let expected_total =
            row.disk_read_wh + row.disk_write_wh + row.net_up_wh + row.net_down_wh + row.cpu_wh;
        assert!((row.total_wh - expected_total).abs() < 1e-12);
    }
}
