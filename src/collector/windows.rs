//! Native Windows `SystemSource` built on psapi, the service control
//! manager, and the IP helper socket tables.

use std::collections::HashSet;
use std::ffi::c_void;
use std::mem;
use std::slice;

use tracing::warn;
use windows::Win32::Foundation::{CloseHandle, ERROR_INSUFFICIENT_BUFFER, FILETIME, HANDLE};
use windows::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, GetExtendedUdpTable, MIB_TCP6TABLE_OWNER_PID, MIB_TCPTABLE_OWNER_PID,
    MIB_UDP6TABLE_OWNER_PID, MIB_UDPTABLE_OWNER_PID, TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_OWNER_PID,
};
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};
use windows::Win32::System::ProcessStatus::{
    K32EnumProcessModulesEx, K32EnumProcesses, K32GetModuleBaseNameW, K32GetProcessMemoryInfo,
    LIST_MODULES_ALL, PROCESS_MEMORY_COUNTERS, PROCESS_MEMORY_COUNTERS_EX,
};
use windows::Win32::System::Services::{
    ENUM_SERVICE_STATUS_PROCESSW, EnumServicesStatusExW, OpenSCManagerW, SC_ENUM_PROCESS_INFO,
    SC_HANDLE, SC_MANAGER_ENUMERATE_SERVICE, SERVICE_DRIVER, SERVICE_STATE_ALL, SERVICE_WIN32,
};
use windows::Win32::System::SystemInformation::GetSystemTimeAsFileTime;
use windows::Win32::System::Threading::{
    GetCurrentProcessId, GetProcessIoCounters, GetProcessTimes, IO_COUNTERS, OpenProcess,
    PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use crate::collector::traits::{
    IoCounters, Pid, ProcessCpu, ProcessProbe, SocketRow, SourceError, SystemSource,
};

fn filetime_to_u64(ft: FILETIME) -> u64 {
    (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
}

/// Short-lived process handle. Closed on drop.
struct WindowsProbe {
    handle: HANDLE,
}

impl Drop for WindowsProbe {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl ProcessProbe for WindowsProbe {
    fn name(&self) -> Option<String> {
        let mut module = windows::Win32::Foundation::HMODULE::default();
        let mut needed = 0u32;
        unsafe {
            K32EnumProcessModulesEx(
                self.handle,
                &mut module,
                mem::size_of_val(&module) as u32,
                &mut needed,
                LIST_MODULES_ALL,
            )
            .ok()
            .ok()?;

            let mut buf = [0u16; 260];
            let len = K32GetModuleBaseNameW(self.handle, Some(module), &mut buf);
            if len == 0 {
                return None;
            }
            Some(String::from_utf16_lossy(&buf[..len as usize]))
        }
    }

    fn cpu_times(&self) -> Option<ProcessCpu> {
        let mut creation = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        unsafe {
            GetProcessTimes(self.handle, &mut creation, &mut exit, &mut kernel, &mut user).ok()?;
        }
        Some(ProcessCpu {
            user: filetime_to_u64(user),
            kernel: filetime_to_u64(kernel),
        })
    }

    fn working_set(&self) -> u64 {
        let mut counters = PROCESS_MEMORY_COUNTERS_EX::default();
        let ok = unsafe {
            K32GetProcessMemoryInfo(
                self.handle,
                &mut counters as *mut PROCESS_MEMORY_COUNTERS_EX as *mut PROCESS_MEMORY_COUNTERS,
                mem::size_of::<PROCESS_MEMORY_COUNTERS_EX>() as u32,
            )
        };
        if ok.as_bool() {
            counters.PrivateUsage as u64
        } else {
            0
        }
    }

    fn io_counters(&self) -> Option<IoCounters> {
        let mut counters = IO_COUNTERS::default();
        unsafe {
            GetProcessIoCounters(self.handle, &mut counters).ok()?;
        }
        Some(IoCounters {
            read_bytes: counters.ReadTransferCount,
            write_bytes: counters.WriteTransferCount,
        })
    }
}

/// Real system source: process table via psapi, service membership via the
/// service control manager, socket ownership via the IP helper tables.
pub struct WindowsSystem {
    scm: Option<SC_HANDLE>,
    service_pids: HashSet<Pid>,
}

impl WindowsSystem {
    pub fn new() -> Self {
        let scm = match unsafe { OpenSCManagerW(None, None, SC_MANAGER_ENUMERATE_SERVICE) } {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("cannot open service control manager: {e}");
                None
            }
        };
        Self {
            scm,
            service_pids: HashSet::new(),
        }
    }

    fn tcp4_rows(&self, rows: &mut Vec<SocketRow>) {
        if let Some(buf) = socket_table_buffer(|buf, size| unsafe {
            GetExtendedTcpTable(
                buf,
                size,
                false,
                AF_INET.0 as u32,
                TCP_TABLE_OWNER_PID_ALL,
                0,
            )
        }) {
            unsafe {
                let table = &*(buf.as_ptr() as *const MIB_TCPTABLE_OWNER_PID);
                let entries =
                    slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
                for entry in entries {
                    rows.push(SocketRow {
                        pid: entry.dwOwningPid,
                        local_port: u16::from_be(entry.dwLocalPort as u16),
                    });
                }
            }
        }
    }

    fn tcp6_rows(&self, rows: &mut Vec<SocketRow>) {
        if let Some(buf) = socket_table_buffer(|buf, size| unsafe {
            GetExtendedTcpTable(
                buf,
                size,
                false,
                AF_INET6.0 as u32,
                TCP_TABLE_OWNER_PID_ALL,
                0,
            )
        }) {
            unsafe {
                let table = &*(buf.as_ptr() as *const MIB_TCP6TABLE_OWNER_PID);
                let entries =
                    slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
                for entry in entries {
                    rows.push(SocketRow {
                        pid: entry.dwOwningPid,
                        local_port: u16::from_be(entry.dwLocalPort as u16),
                    });
                }
            }
        }
    }

    fn udp_rows(&self, af: u32, rows: &mut Vec<SocketRow>) {
        let Some(buf) = socket_table_buffer(|buf, size| unsafe {
            GetExtendedUdpTable(buf, size, false, af, UDP_TABLE_OWNER_PID, 0)
        }) else {
            return;
        };
        unsafe {
            if af == AF_INET6.0 as u32 {
                let table = &*(buf.as_ptr() as *const MIB_UDP6TABLE_OWNER_PID);
                let entries =
                    slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
                for entry in entries {
                    rows.push(SocketRow {
                        pid: entry.dwOwningPid,
                        local_port: u16::from_be(entry.dwLocalPort as u16),
                    });
                }
            } else {
                let table = &*(buf.as_ptr() as *const MIB_UDPTABLE_OWNER_PID);
                let entries =
                    slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
                for entry in entries {
                    rows.push(SocketRow {
                        pid: entry.dwOwningPid,
                        local_port: u16::from_be(entry.dwLocalPort as u16),
                    });
                }
            }
        }
    }
}

impl Default for WindowsSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the usual two-call size-then-fill dance of the IP helper table
/// functions. Returns the filled buffer, or `None` on any error.
fn socket_table_buffer<F>(mut call: F) -> Option<Vec<u8>>
where
    F: FnMut(Option<*mut c_void>, *mut u32) -> u32,
{
    let mut size = 0u32;
    let rc = call(None, &mut size);
    if rc != ERROR_INSUFFICIENT_BUFFER.0 && rc != 0 {
        warn!("socket table size query failed: {rc}");
        return None;
    }
    // The table can grow between the two calls; retry a couple of times.
    for _ in 0..3 {
        let mut buf = vec![0u8; size.max(16) as usize];
        let rc = call(Some(buf.as_mut_ptr() as *mut c_void), &mut size);
        match rc {
            0 => return Some(buf),
            rc if rc == ERROR_INSUFFICIENT_BUFFER.0 => continue,
            rc => {
                warn!("socket table query failed: {rc}");
                return None;
            }
        }
    }
    None
}

impl SystemSource for WindowsSystem {
    fn pids(&mut self) -> Result<Vec<Pid>, SourceError> {
        // Grow until the OS reports fewer bytes than the buffer holds,
        // meaning the whole table fit.
        let mut pids = vec![0u32; 1024];
        loop {
            let mut returned = 0u32;
            let bytes = (pids.len() * mem::size_of::<u32>()) as u32;
            unsafe {
                K32EnumProcesses(pids.as_mut_ptr(), bytes, &mut returned)
                    .ok()
                    .map_err(|e| SourceError::Processes(e.to_string()))?;
            }
            if returned < bytes {
                pids.truncate(returned as usize / mem::size_of::<u32>());
                return Ok(pids);
            }
            pids.resize(pids.len() * 2, 0);
        }
    }

    fn open_process(&self, pid: Pid) -> Option<Box<dyn ProcessProbe + '_>> {
        let handle =
            unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) }.ok()?;
        Some(Box::new(WindowsProbe { handle }))
    }

    fn refresh_services(&mut self) {
        let Some(scm) = self.scm else {
            return;
        };
        self.service_pids.clear();

        let service_types = SERVICE_WIN32 | SERVICE_DRIVER;
        let mut needed = 0u32;
        let mut returned = 0u32;
        let mut resume = 0u32;

        // Size query; ERROR_MORE_DATA is the expected "outcome".
        unsafe {
            let _ = EnumServicesStatusExW(
                scm,
                SC_ENUM_PROCESS_INFO,
                service_types,
                SERVICE_STATE_ALL,
                None,
                &mut needed,
                &mut returned,
                Some(&mut resume),
                None,
            );
        }
        if needed == 0 {
            return;
        }

        let mut buf = vec![0u8; needed as usize];
        resume = 0;
        let result = unsafe {
            EnumServicesStatusExW(
                scm,
                SC_ENUM_PROCESS_INFO,
                service_types,
                SERVICE_STATE_ALL,
                Some(&mut buf),
                &mut needed,
                &mut returned,
                Some(&mut resume),
                None,
            )
        };
        if let Err(e) = result {
            warn!("service enumeration failed: {e}");
            return;
        }

        // The records returned by the SCM are a packed array of fixed-size
        // structs; walk exactly the count it reported.
        let records = unsafe {
            slice::from_raw_parts(
                buf.as_ptr() as *const ENUM_SERVICE_STATUS_PROCESSW,
                returned as usize,
            )
        };
        for record in records {
            let pid = record.ServiceStatusProcess.dwProcessId;
            if pid != 0 {
                self.service_pids.insert(pid);
            }
        }
    }

    fn is_service(&self, pid: Pid) -> bool {
        self.service_pids.contains(&pid)
    }

    fn socket_rows(&mut self) -> Result<Vec<SocketRow>, SourceError> {
        let mut rows = Vec::new();
        self.tcp4_rows(&mut rows);
        self.tcp6_rows(&mut rows);
        self.udp_rows(AF_INET.0 as u32, &mut rows);
        self.udp_rows(AF_INET6.0 as u32, &mut rows);
        Ok(rows)
    }

    fn own_pid(&self) -> Pid {
        unsafe { GetCurrentProcessId() }
    }

    fn wall_clock(&self) -> u64 {
        let ft = unsafe { GetSystemTimeAsFileTime() };
        filetime_to_u64(ft)
    }
}

/// Hides the console window the daemon was launched from.
pub fn hide_console() {
    use windows::Win32::System::Console::GetConsoleWindow;
    use windows::Win32::UI::WindowsAndMessaging::{SW_HIDE, ShowWindow};

    unsafe {
        let window = GetConsoleWindow();
        if !window.is_invalid() {
            let _ = ShowWindow(window, SW_HIDE);
        }
    }
}
