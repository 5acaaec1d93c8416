//! Hardware energy accounting: RAPL unit decoding, wrap-safe counter
//! deltas, and the kernel-driver MSR reader.

#[cfg(windows)]
pub mod driver;
pub mod msr;

#[cfg(windows)]
pub use driver::{DRIVER_PATH, DriverMsrReader};
pub use msr::{
    EnergyDomain, EnergyError, EnergyMeter, MockMsr, MsrReader, RaplUnits,
    MSR_DRAM_ENERGY_STATUS, MSR_PKG_ENERGY_STATUS, MSR_PLATFORM_ENERGY_STATUS,
    MSR_PP0_ENERGY_STATUS, MSR_PP1_ENERGY_STATUS, MSR_RAPL_POWER_UNIT,
};
