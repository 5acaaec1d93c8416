//! RAPL energy accounting over raw MSR reads.
//!
//! The hardware exposes cumulative 32-bit energy counters that tick in
//! firmware-defined units and wrap. This module decodes the unit register,
//! keeps the last raw value per MSR, and turns successive reads into
//! wrap-safe milliwatt-hour deltas.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// RAPL unit register.
pub const MSR_RAPL_POWER_UNIT: u64 = 0x606;
/// Package-domain cumulative energy.
pub const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
/// DRAM-domain cumulative energy.
pub const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;
/// Power plane 0 (cores).
pub const MSR_PP0_ENERGY_STATUS: u64 = 0x639;
/// Power plane 1 (uncore/graphics).
pub const MSR_PP1_ENERGY_STATUS: u64 = 0x641;
/// Whole-platform cumulative energy, where implemented.
pub const MSR_PLATFORM_ENERGY_STATUS: u64 = 0x64D;

/// Joules per milliwatt-hour.
const JOULES_PER_MWH: f64 = 3.6;

#[derive(Debug)]
pub enum EnergyError {
    /// The driver device could not be opened. Fatal at startup.
    Open(String),
    /// A single MSR read failed; the tick is accounted with zero energy.
    Read { msr: u64, message: String },
}

impl fmt::Display for EnergyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnergyError::Open(msg) => write!(f, "cannot open energy driver: {}", msg),
            EnergyError::Read { msr, message } => {
                write!(f, "MSR {:#x} read failed: {}", msr, message)
            }
        }
    }
}

impl std::error::Error for EnergyError {}

/// Raw MSR access, implemented by the kernel driver in production and by a
/// scripted reader in tests.
pub trait MsrReader {
    fn read_msr(&self, msr: u64) -> Result<u64, EnergyError>;
}

/// Scale factors decoded from the RAPL unit register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaplUnits {
    /// Seconds per time unit.
    pub time_unit: f64,
    /// Joules per energy-counter increment.
    pub energy_unit: f64,
    /// Watts per power unit.
    pub power_unit: f64,
}

impl RaplUnits {
    /// Decodes the three 2^-n scale fields of MSR 0x606.
    pub fn decode(raw: u64) -> Self {
        Self {
            time_unit: 2f64.powi(-(((raw >> 16) & 0xF) as i32)),
            energy_unit: 2f64.powi(-(((raw >> 8) & 0x1F) as i32)),
            power_unit: 2f64.powi(-((raw & 0xF) as i32)),
        }
    }
}

/// RAPL measurement domains exposed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyDomain {
    Package,
    Dram,
    PowerPlane0,
    PowerPlane1,
    Platform,
}

impl EnergyDomain {
    pub fn msr(self) -> u64 {
        match self {
            EnergyDomain::Package => MSR_PKG_ENERGY_STATUS,
            EnergyDomain::Dram => MSR_DRAM_ENERGY_STATUS,
            EnergyDomain::PowerPlane0 => MSR_PP0_ENERGY_STATUS,
            EnergyDomain::PowerPlane1 => MSR_PP1_ENERGY_STATUS,
            EnergyDomain::Platform => MSR_PLATFORM_ENERGY_STATUS,
        }
    }
}

/// Converts successive energy-counter reads into milliwatt-hour deltas.
pub struct EnergyMeter<R: MsrReader> {
    reader: R,
    units: RaplUnits,
    /// Last raw 32-bit counter per MSR. Baselines at zero, so the first
    /// sample of an MSR reports the counter's full accumulated value.
    last: HashMap<u64, u32>,
    tick_domain: EnergyDomain,
}

impl<R: MsrReader> EnergyMeter<R> {
    /// Opens the meter: reads the unit register once and selects the domain
    /// the sampling loop will charge CPU energy from.
    pub fn new(reader: R, use_platform: bool) -> Result<Self, EnergyError> {
        let raw = reader.read_msr(MSR_RAPL_POWER_UNIT)?;
        let units = RaplUnits::decode(raw);
        let tick_domain = if use_platform {
            EnergyDomain::Platform
        } else {
            EnergyDomain::Package
        };
        Ok(Self {
            reader,
            units,
            last: HashMap::new(),
            tick_domain,
        })
    }

    pub fn units(&self) -> RaplUnits {
        self.units
    }

    pub fn tick_domain(&self) -> EnergyDomain {
        self.tick_domain
    }

    /// Milliwatt-hours consumed by the selected domain since the previous
    /// call.
    pub fn read_wh(&mut self) -> Result<f64, EnergyError> {
        self.read_domain_wh(self.tick_domain)
    }

    /// Milliwatt-hours consumed by an arbitrary domain since its previous
    /// read.
    pub fn read_domain_wh(&mut self, domain: EnergyDomain) -> Result<f64, EnergyError> {
        Ok(self.delta_joules(domain.msr())? / JOULES_PER_MWH)
    }

    /// Wrap-safe joule delta for one MSR. The counter is 32 bits wide and
    /// monotonic, so `wrapping_sub` stays correct across at most one wrap
    /// between reads.
    fn delta_joules(&mut self, msr: u64) -> Result<f64, EnergyError> {
        let raw = self.reader.read_msr(msr)?;
        let current = raw as u32;
        let previous = self.last.insert(msr, current).unwrap_or(0);
        let delta = current.wrapping_sub(previous);
        Ok(f64::from(delta) * self.units.energy_unit)
    }
}

/// Scripted MSR reader for tests and for platforms without the driver.
///
/// Register values are set explicitly; energy-status registers can also be
/// given a per-read step so repeated samples look like steady consumption.
/// Clones share the register bank, so a test can keep a handle while the
/// meter owns the reader.
#[derive(Clone)]
pub struct MockMsr {
    registers: Rc<RefCell<HashMap<u64, u64>>>,
    step: u64,
}

/// Typical unit-register content: time 2^-10 s, energy 2^-14 J,
/// power 2^-3 W.
pub const TYPICAL_UNIT_REGISTER: u64 = 0xA_0E03;

impl MockMsr {
    pub fn new() -> Self {
        let mut registers = HashMap::new();
        registers.insert(MSR_RAPL_POWER_UNIT, TYPICAL_UNIT_REGISTER);
        Self {
            registers: Rc::new(RefCell::new(registers)),
            step: 0,
        }
    }

    /// Energy-status registers advance by `step` increments on every read.
    pub fn with_step(step: u64) -> Self {
        let mut mock = Self::new();
        mock.step = step;
        mock
    }

    pub fn set(&self, msr: u64, value: u64) {
        self.registers.borrow_mut().insert(msr, value);
    }
}

impl Default for MockMsr {
    fn default() -> Self {
        Self::new()
    }
}

impl MsrReader for MockMsr {
    fn read_msr(&self, msr: u64) -> Result<u64, EnergyError> {
        let mut registers = self.registers.borrow_mut();
        let value = *registers.get(&msr).unwrap_or(&0);
        let is_energy_status = matches!(
            msr,
            MSR_PKG_ENERGY_STATUS
                | MSR_DRAM_ENERGY_STATUS
                | MSR_PP0_ENERGY_STATUS
                | MSR_PP1_ENERGY_STATUS
                | MSR_PLATFORM_ENERGY_STATUS
        );
        if is_energy_status && self.step > 0 {
            registers.insert(msr, value.wrapping_add(self.step));
        }
        Ok(value)
    }
}
