//! Per-PID counter store.
//!
//! Keeps the previously observed CPU times and I/O counters for every PID so
//! the samplers can turn cumulative OS counters into per-tick deltas. Only
//! the sampling thread touches it, so there is no synchronization.

use std::collections::HashMap;

use crate::collector::traits::{IoCounters, Pid};

/// Entries unseen for this many ticks are dropped, so the store does not
/// grow without bound across months of PID churn.
const STALE_TICKS: u64 = 8;

/// Prior CPU snapshot for one PID: cumulative occupancy plus the wall clock
/// at the moment it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub user: u64,
    pub kernel: u64,
    pub wall: u64,
}

#[derive(Debug, Default)]
struct Entry {
    cpu: Option<CpuTimes>,
    io: Option<IoCounters>,
    last_seen: u64,
}

/// Last-seen counter values keyed by PID.
///
/// Stale entries are harmless until purged; a PID that was reused in the
/// meantime is caught by the samplers' backward-counter guards.
#[derive(Debug, Default)]
pub struct CounterStore {
    entries: HashMap<Pid, Entry>,
    tick: u64,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the tick counter. Call once at the start of every sampling
    /// pass, before any record.
    pub fn begin_tick(&mut self) {
        self.tick += 1;
    }

    pub fn cpu(&self, pid: Pid) -> Option<CpuTimes> {
        self.entries.get(&pid).and_then(|e| e.cpu)
    }

    pub fn record_cpu(&mut self, pid: Pid, times: CpuTimes) {
        let entry = self.entries.entry(pid).or_default();
        entry.cpu = Some(times);
        entry.last_seen = self.tick;
    }

    pub fn io(&self, pid: Pid) -> Option<IoCounters> {
        self.entries.get(&pid).and_then(|e| e.io)
    }

    pub fn record_io(&mut self, pid: Pid, counters: IoCounters) {
        let entry = self.entries.entry(pid).or_default();
        entry.io = Some(counters);
        entry.last_seen = self.tick;
    }

    /// Drops entries for PIDs that have not been recorded recently.
    pub fn purge_stale(&mut self) {
        let tick = self.tick;
        self.entries
            .retain(|_, e| tick.saturating_sub(e.last_seen) < STALE_TICKS);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_pid_has_no_priors() {
        let store = CounterStore::new();
        assert!(store.cpu(1).is_none());
        assert!(store.io(1).is_none());
    }

    #[test]
    fn test_record_and_read_back() {
        let mut store = CounterStore::new();
        store.begin_tick();
        let times = CpuTimes { user: 10, kernel: 20, wall: 100 };
        store.record_cpu(7, times);
        assert_eq!(store.cpu(7), Some(times));
    }

    #[test]
    fn test_purge_drops_unseen_pids() {
        let mut store = CounterStore::new();
        store.begin_tick();
        store.record_cpu(1, CpuTimes::default());
        store.record_io(2, IoCounters::default());

        // PID 1 keeps getting observed, PID 2 goes quiet.
        for _ in 0..STALE_TICKS {
            store.begin_tick();
            store.record_cpu(1, CpuTimes::default());
        }
        store.purge_stale();

        assert!(store.cpu(1).is_some());
        assert!(store.io(2).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_recently_seen_pid_survives_purge() {
        let mut store = CounterStore::new();
        for _ in 0..3 {
            store.begin_tick();
        }
        store.record_io(9, IoCounters { read_bytes: 1, write_bytes: 2 });
        store.begin_tick();
        store.purge_stale();
        assert!(store.io(9).is_some());
    }
}
