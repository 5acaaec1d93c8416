//! Per-process sampling: OS access traits, the per-PID counter store, and
//! the CPU/disk delta samplers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       sampling loop                      │
//! │   CpuSampler ──┐                        ┌── disk_delta   │
//! │                ├──── CounterStore ──────┤                │
//! │                │   (per-PID priors)     │                │
//! │        ┌───────▼───────┐                                 │
//! │        │ SystemSource  │ (trait)                         │
//! │        └───────┬───────┘                                 │
//! └────────────────┼─────────────────────────────────────────┘
//!                  │
//!         ┌────────┴────────┐
//!  ┌──────▼──────┐   ┌──────▼──────┐
//!  │WindowsSystem│   │ MockSystem  │
//!  │ (production)│   │ (tests/CI)  │
//!  └─────────────┘   └─────────────┘
//! ```

pub mod cpu;
pub mod disk;
pub mod mock;
pub mod store;
pub mod traits;
#[cfg(windows)]
pub mod windows;

pub use cpu::CpuSampler;
pub use disk::{IoDelta, disk_delta};
pub use mock::{MockProcess, MockSystem};
pub use store::{CounterStore, CpuTimes};
pub use traits::{
    IoCounters, Pid, ProcessCpu, ProcessProbe, SocketRow, SourceError, SystemSource,
};
#[cfg(windows)]
pub use windows::WindowsSystem;
