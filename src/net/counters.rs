//! Per-port byte counters shared between the capture workers and the
//! sampling loop.
//!
//! Two dense arrays of 65 536 atomic counters, one for transmitted and one
//! for received bytes. Capture workers only ever fetch-add; the sampler
//! reads sums through the port map once per tick and then zeroes both
//! arrays. Relaxed increments suffice: a worker racing the reset can
//! misplace at most one packet per tick, which the model tolerates.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of the 16-bit port space.
pub const PORT_SPACE: usize = 1 << 16;

/// Dense tx/rx byte counters indexed by local port.
pub struct PortCounters {
    tx: Box<[AtomicU64]>,
    rx: Box<[AtomicU64]>,
}

impl PortCounters {
    pub fn new() -> Self {
        Self {
            tx: (0..PORT_SPACE).map(|_| AtomicU64::new(0)).collect(),
            rx: (0..PORT_SPACE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn add_tx(&self, port: u16, bytes: u64) {
        self.tx[usize::from(port)].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rx(&self, port: u16, bytes: u64) {
        self.rx[usize::from(port)].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tx_bytes(&self, port: u16) -> u64 {
        self.tx[usize::from(port)].load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self, port: u16) -> u64 {
        self.rx[usize::from(port)].load(Ordering::Relaxed)
    }

    /// Sums `(tx, rx)` over a process's local ports.
    pub fn sum_for(&self, ports: &BTreeSet<u16>) -> (u64, u64) {
        let mut tx = 0u64;
        let mut rx = 0u64;
        for &port in ports {
            tx += self.tx_bytes(port);
            rx += self.rx_bytes(port);
        }
        (tx, rx)
    }

    /// Zeroes every counter. Called once per tick after aggregation.
    pub fn reset(&self) {
        for counter in self.tx.iter().chain(self.rx.iter()) {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

impl Default for PortCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increments_accumulate() {
        let counters = PortCounters::new();
        counters.add_tx(5000, 100);
        counters.add_tx(5000, 50);
        counters.add_rx(80, 1500);
        assert_eq!(counters.tx_bytes(5000), 150);
        assert_eq!(counters.rx_bytes(80), 1500);
        assert_eq!(counters.tx_bytes(80), 0);
    }

    #[test]
    fn test_sum_over_port_set() {
        let counters = PortCounters::new();
        counters.add_tx(1, 10);
        counters.add_tx(2, 20);
        counters.add_tx(3, 40);
        counters.add_rx(2, 5);

        let ports: BTreeSet<u16> = [1, 2].into_iter().collect();
        assert_eq!(counters.sum_for(&ports), (30, 5));
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let counters = PortCounters::new();
        counters.add_tx(0, 1);
        counters.add_tx(u16::MAX, 2);
        counters.add_rx(443, 3);
        counters.reset();
        assert_eq!(counters.tx_bytes(0), 0);
        assert_eq!(counters.tx_bytes(u16::MAX), 0);
        assert_eq!(counters.rx_bytes(443), 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        use std::sync::Arc;

        let counters = Arc::new(PortCounters::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counters = Arc::clone(&counters);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1_000 {
                    counters.add_tx(9999, 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.tx_bytes(9999), 4_000);
    }
}
