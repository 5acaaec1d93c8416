//! Per-process CPU fraction sampler.
//!
//! The usage of one process is the share of wall time its user+kernel CPU
//! time advanced since the previous tick, divided by the number of logical
//! processors so a fully loaded single core on an N-core host reads 1/N
//! rather than 1.

use crate::collector::store::{CounterStore, CpuTimes};
use crate::collector::traits::Pid;

/// Computes normalized CPU fractions from cumulative kernel counters.
#[derive(Debug, Clone, Copy)]
pub struct CpuSampler {
    cpus: u32,
}

impl CpuSampler {
    /// Sampler normalized to the host's logical processor count.
    pub fn new() -> Self {
        Self {
            cpus: num_cpus::get() as u32,
        }
    }

    /// Sampler with an explicit processor count.
    pub fn with_cpus(cpus: u32) -> Self {
        Self { cpus: cpus.max(1) }
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    /// Returns the CPU fraction for `pid` over the interval since its prior
    /// snapshot, and records the current snapshot.
    ///
    /// The first observation of a PID yields 0 (the prior defaults to the
    /// current reading). A user or kernel counter running backwards means
    /// the PID was reused; the fraction is 0 and the store is reset to the
    /// new process's counters. A zero wall delta also yields 0.
    pub fn sample(
        &self,
        store: &mut CounterStore,
        pid: Pid,
        user: u64,
        kernel: u64,
        wall: u64,
    ) -> f64 {
        let current = CpuTimes { user, kernel, wall };
        let prior = store.cpu(pid).unwrap_or(current);
        store.record_cpu(pid, current);

        if user < prior.user || kernel < prior.kernel {
            return 0.0;
        }
        let denom = wall.saturating_sub(prior.wall);
        if denom == 0 {
            return 0.0;
        }

        let numer = (user - prior.user) + (kernel - prior.kernel);
        let fraction = numer as f64 / denom as f64 / f64::from(self.cpus);
        if fraction.is_finite() { fraction } else { 0.0 }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_zero() {
        let sampler = CpuSampler::with_cpus(4);
        let mut store = CounterStore::new();
        store.begin_tick();
        assert_eq!(sampler.sample(&mut store, 1, 500, 500, 10_000), 0.0);
    }

    #[test]
    fn test_full_core_on_quad_core_reads_quarter() {
        let sampler = CpuSampler::with_cpus(4);
        let mut store = CounterStore::new();
        store.begin_tick();
        sampler.sample(&mut store, 1, 0, 0, 0);

        // One interval later the process burned the whole interval on one core.
        store.begin_tick();
        let fraction = sampler.sample(&mut store, 1, 80_000, 20_000, 100_000);
        assert!((fraction - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_idle_process_reads_zero() {
        let sampler = CpuSampler::with_cpus(8);
        let mut store = CounterStore::new();
        store.begin_tick();
        sampler.sample(&mut store, 1, 1_000, 1_000, 0);
        store.begin_tick();
        assert_eq!(sampler.sample(&mut store, 1, 1_000, 1_000, 100_000), 0.0);
    }

    #[test]
    fn test_backward_counter_means_pid_reuse() {
        let sampler = CpuSampler::with_cpus(4);
        let mut store = CounterStore::new();
        store.begin_tick();
        sampler.sample(&mut store, 1, 900, 900, 0);

        store.begin_tick();
        assert_eq!(sampler.sample(&mut store, 1, 100, 50, 100_000), 0.0);

        // The store now holds the new process's counters, so the next
        // interval is measured normally.
        store.begin_tick();
        let fraction = sampler.sample(&mut store, 1, 100_100, 50, 100_200);
        assert!(fraction > 0.0);
    }

    #[test]
    fn test_zero_wall_delta_is_zero_not_infinite() {
        let sampler = CpuSampler::with_cpus(4);
        let mut store = CounterStore::new();
        store.begin_tick();
        sampler.sample(&mut store, 1, 0, 0, 5_000);
        store.begin_tick();
        assert_eq!(sampler.sample(&mut store, 1, 10, 10, 5_000), 0.0);
    }

    #[test]
    fn test_fraction_bounded_for_monotonic_counters() {
        let sampler = CpuSampler::with_cpus(2);
        let mut store = CounterStore::new();
        store.begin_tick();
        sampler.sample(&mut store, 3, 0, 0, 0);
        store.begin_tick();
        // Both cores fully busy: fraction is exactly 1.0 after normalization.
        let fraction = sampler.sample(&mut store, 3, 100_000, 100_000, 100_000);
        assert!((0.0..=1.0).contains(&fraction));
        assert!((fraction - 1.0).abs() < 1e-9);
    }
}
