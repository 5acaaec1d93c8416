//! Per-process disk byte-delta sampler.

use crate::collector::store::CounterStore;
use crate::collector::traits::{IoCounters, Pid};

/// Bytes read and written by one process during the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoDelta {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Returns the byte deltas for `pid` since its prior snapshot and records
/// the current counters.
///
/// A PID seen for the first time yields `(0, 0)`; using the absolute
/// counters instead would charge the process's whole lifetime of I/O to one
/// interval. A counter running backwards means the PID was reused; both
/// deltas are 0 and the store restarts from the current values.
pub fn disk_delta(store: &mut CounterStore, pid: Pid, current: IoCounters) -> IoDelta {
    let prior = store.io(pid);
    store.record_io(pid, current);

    match prior {
        None => IoDelta::default(),
        Some(p)
            if current.read_bytes < p.read_bytes || current.write_bytes < p.write_bytes =>
        {
            IoDelta::default()
        }
        Some(p) => IoDelta {
            read_bytes: current.read_bytes - p.read_bytes,
            write_bytes: current.write_bytes - p.write_bytes,
        },
    }
}
