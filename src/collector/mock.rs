//! Scripted `SystemSource` used by unit tests and by builds on platforms
//! without a native backend.

use crate::collector::traits::{
    IoCounters, Pid, ProcessCpu, ProcessProbe, SocketRow, SourceError, SystemSource,
};

/// One scripted process. Fields map one-to-one onto what a `ProcessProbe`
/// would report for it.
#[derive(Debug, Clone)]
pub struct MockProcess {
    pub pid: Pid,
    /// `None` simulates a name-resolution failure.
    pub name: Option<String>,
    pub user_time: u64,
    pub kernel_time: u64,
    pub working_set: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Registered-service membership.
    pub service: bool,
    /// When set, `open_process` returns `None` (access denied).
    pub deny: bool,
    /// Local ports owned by this process, fed into the socket tables.
    pub ports: Vec<u16>,
}

impl MockProcess {
    pub fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: Some(name.to_string()),
            user_time: 0,
            kernel_time: 0,
            working_set: 0,
            read_bytes: 0,
            write_bytes: 0,
            service: false,
            deny: false,
            ports: Vec::new(),
        }
    }
}

/// Scripted system: a fixed process table plus a manually advanced wall
/// clock. Tests mutate the processes between ticks to simulate activity.
#[derive(Debug, Default)]
pub struct MockSystem {
    processes: Vec<MockProcess>,
    wall: u64,
    own_pid: Pid,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small plausible host: an init-like service, a browser with open
    /// ports, a background service, and the probe itself.
    pub fn typical_host() -> Self {
        let mut sys = Self::new();
        let mut init = MockProcess::new(4, "wininit.exe");
        init.service = true;
        sys.push(init);

        let mut browser = MockProcess::new(1200, "browser.exe");
        browser.working_set = 512 * 1024 * 1024;
        browser.ports = vec![50_000, 50_001];
        sys.push(browser);

        let mut svc = MockProcess::new(900, "svchost.exe");
        svc.service = true;
        svc.ports = vec![135];
        sys.push(svc);

        let mut own = MockProcess::new(4242, "wattmond.exe");
        own.working_set = 8 * 1024 * 1024;
        sys.push(own);
        sys.own_pid = 4242;
        sys
    }

    pub fn push(&mut self, process: MockProcess) {
        self.processes.push(process);
    }

    pub fn remove(&mut self, pid: Pid) {
        self.processes.retain(|p| p.pid != pid);
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut MockProcess> {
        self.processes.iter_mut().find(|p| p.pid == pid)
    }

    pub fn set_own_pid(&mut self, pid: Pid) {
        self.own_pid = pid;
    }

    pub fn set_wall(&mut self, wall: u64) {
        self.wall = wall;
    }

    /// Moves the scripted wall clock forward.
    pub fn advance_wall(&mut self, delta: u64) {
        self.wall += delta;
    }
}

struct MockProbe {
    process: MockProcess,
}

impl ProcessProbe for MockProbe {
    fn name(&self) -> Option<String> {
        self.process.name.clone()
    }

    fn cpu_times(&self) -> Option<ProcessCpu> {
        Some(ProcessCpu {
            user: self.process.user_time,
            kernel: self.process.kernel_time,
        })
    }

    fn working_set(&self) -> u64 {
        self.process.working_set
    }

    fn io_counters(&self) -> Option<IoCounters> {
        Some(IoCounters {
            read_bytes: self.process.read_bytes,
            write_bytes: self.process.write_bytes,
        })
    }
}

impl SystemSource for MockSystem {
    fn pids(&mut self) -> Result<Vec<Pid>, SourceError> {
        Ok(self.processes.iter().map(|p| p.pid).collect())
    }

    fn open_process(&self, pid: Pid) -> Option<Box<dyn ProcessProbe + '_>> {
        let process = self.processes.iter().find(|p| p.pid == pid)?;
        if process.deny {
            return None;
        }
        Some(Box::new(MockProbe {
            process: process.clone(),
        }))
    }

    fn refresh_services(&mut self) {}

    fn is_service(&self, pid: Pid) -> bool {
        self.processes
            .iter()
            .any(|p| p.pid == pid && p.service)
    }

    fn socket_rows(&mut self) -> Result<Vec<SocketRow>, SourceError> {
        let mut rows = Vec::new();
        for process in &self.processes {
            for &port in &process.ports {
                rows.push(SocketRow {
                    pid: process.pid,
                    local_port: port,
                });
            }
        }
        Ok(rows)
    }

    fn own_pid(&self) -> Pid {
        self.own_pid
    }

    fn wall_clock(&self) -> u64 {
        self.wall
    }
}
