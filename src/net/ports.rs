//! Port-to-process ownership map.
//!
//! Rebuilt from scratch every tick from the OS socket tables. The sampler is
//! the only writer; the guard below only has to prevent a reentrant rebuild,
//! so a `try_lock` that bails out when the map is busy is enough.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use crate::collector::traits::{Pid, SocketRow};

/// Which process owns which local ports.
#[derive(Debug, Default)]
pub struct PortMap {
    inner: Mutex<HashMap<Pid, BTreeSet<u16>>>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the mapping with one built from `rows`.
    ///
    /// Duplicate ports within one PID collapse into the set. A port listed
    /// under two PIDs keeps only the later owner, so no port is ever counted
    /// twice in one snapshot. If another rebuild is already running the call
    /// returns immediately without touching the map.
    pub fn rebuild(&self, rows: &[SocketRow]) {
        let Ok(mut map) = self.inner.try_lock() else {
            return;
        };

        map.clear();
        let mut owner: HashMap<u16, Pid> = HashMap::new();
        for row in rows {
            if let Some(previous) = owner.insert(row.local_port, row.pid) {
                if previous != row.pid {
                    if let Some(ports) = map.get_mut(&previous) {
                        ports.remove(&row.local_port);
                    }
                }
            }
            map.entry(row.pid).or_default().insert(row.local_port);
        }
    }

    /// The local ports currently attributed to `pid`; empty when the process
    /// has no sockets.
    pub fn ports_for(&self, pid: Pid) -> BTreeSet<u16> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of processes with at least one port.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
