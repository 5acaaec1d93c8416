//! MSR access through the kernel driver device.
//!
//! The driver exposes a single buffered ioctl: write a 64-bit MSR id, read
//! back the 64-bit register value.

use std::ffi::c_void;

use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_MODE, OPEN_EXISTING,
};
use windows::Win32::System::IO::DeviceIoControl;
use windows::core::PCWSTR;

use crate::energy::msr::{EnergyError, MSR_RAPL_POWER_UNIT, MsrReader};

/// Device path of the MSR driver.
pub const DRIVER_PATH: &str = r"\\.\ScaphandreDriver";

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_READ_DATA: u32 = 0x1;
const FILE_WRITE_DATA: u32 = 0x2;

const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// The driver registers its read ioctl under the unit-register number.
const MSR_IOCTL: u32 = ctl_code(
    FILE_DEVICE_UNKNOWN,
    MSR_RAPL_POWER_UNIT as u32,
    METHOD_BUFFERED,
    FILE_READ_DATA | FILE_WRITE_DATA,
);

/// Open handle onto the driver device.
pub struct DriverMsrReader {
    handle: HANDLE,
}

// The handle is only ever used for ioctls, which the driver serializes.
unsafe impl Send for DriverMsrReader {}

impl DriverMsrReader {
    /// Opens the device for read+write access. Fails when the driver is not
    /// loaded, which the daemon treats as fatal.
    pub fn open() -> Result<Self, EnergyError> {
        let path: Vec<u16> = DRIVER_PATH.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe {
            CreateFileW(
                PCWSTR(path.as_ptr()),
                GENERIC_READ.0 | GENERIC_WRITE.0,
                FILE_SHARE_MODE(0),
                None,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                None,
            )
        }
        .map_err(|e| EnergyError::Open(e.to_string()))?;
        Ok(Self { handle })
    }
}

impl MsrReader for DriverMsrReader {
    fn read_msr(&self, msr: u64) -> Result<u64, EnergyError> {
        let mut value = 0u64;
        let mut returned = 0u32;
        unsafe {
            DeviceIoControl(
                self.handle,
                MSR_IOCTL,
                Some(&msr as *const u64 as *const c_void),
                std::mem::size_of::<u64>() as u32,
                Some(&mut value as *mut u64 as *mut c_void),
                std::mem::size_of::<u64>() as u32,
                Some(&mut returned),
                None,
            )
        }
        .map_err(|e| EnergyError::Read {
            msr,
            message: e.to_string(),
        })?;
        Ok(value)
    }
}

impl Drop for DriverMsrReader {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}
