use core::mem;

use ntapi::ntpsapi::{
    NtQueryInformationThread, ThreadBasicInformation, ThreadQuerySetWin32StartAddress,
    THREAD_BASIC_INFORMATION,
};
use tracing::trace;
use winapi::ctypes::c_void;
use winapi::shared::minwindef::{BOOL, FALSE};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::CloseHandle;
use winapi::um::memoryapi::{ReadProcessMemory, VirtualQueryEx};
use winapi::um::processthreadsapi::{GetThreadContext, OpenProcess, OpenThread};
use winapi::um::winbase::Wow64GetThreadContext;
use winapi::um::winnt::{HANDLE, MEMORY_BASIC_INFORMATION};
use winapi::um::winnt::{CONTEXT, WOW64_CONTEXT};
use winapi::um::wow64apiset::IsWow64Process;

use crate::context::{RegisterSnapshot, StackBounds};
use crate::error::{Result, ScanError};
use crate::memory::{read_ptr, MemoryRegion, RemoteProcess};
use crate::nt::{
    nt_success, CONTEXT_CONTROL, CONTEXT_INTEGER, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    TEB32_STACK_BASE, TEB32_STACK_LIMIT, TEB64_STACK_BASE, TEB64_STACK_LIMIT, THREAD_GET_CONTEXT,
    THREAD_QUERY_INFORMATION, THREAD_QUERY_LIMITED_INFORMATION, WOW64_CONTEXT_CONTROL,
    WOW64_CONTEXT_INTEGER, WOW64_TEB_OFFSET,
};

pub(crate) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

// Handles are plain kernel object references, usable from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

pub(crate) fn open_thread(tid: u32, access: u32) -> Result<OwnedHandle> {
    let handle = unsafe { OpenThread(access, FALSE, tid) };
    if handle.is_null() {
        let code = unsafe { GetLastError() };
        return Err(ScanError::ContextUnavailable {
            tid,
            reason: format!("OpenThread failed with error {}", code),
        });
    }
    Ok(OwnedHandle(handle))
}

/// Win32 start address of a thread, as recorded by the kernel.
pub(crate) fn query_thread_win32_start_address(tid: u32) -> Option<u64> {
    let thread = open_thread(tid, THREAD_QUERY_INFORMATION).ok()?;
    let mut start: usize = 0;
    let mut return_len: u32 = 0;
    let status = unsafe {
        NtQueryInformationThread(
            thread.raw(),
            ThreadQuerySetWin32StartAddress,
            &mut start as *mut _ as *mut c_void,
            mem::size_of::<usize>() as u32,
            &mut return_len as *mut u32,
        )
    };

    if !nt_success(status) || start == 0 {
        return None;
    }

    Some(start as u64)
}

/// A live process opened for reading.
pub struct WinProcess {
    pid: u32,
    handle: OwnedHandle,
    is_wow64: bool,
}

impl WinProcess {
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, FALSE, pid) };
        if handle.is_null() {
            let code = unsafe { GetLastError() };
            return Err(ScanError::AccessDenied(format!(
                "OpenProcess({}) failed with error {}",
                pid, code
            )));
        }
        let handle = OwnedHandle(handle);

        let mut wow64: BOOL = FALSE;
        let ok = unsafe { IsWow64Process(handle.raw(), &mut wow64) };
        if ok == FALSE {
            trace!(pid, "IsWow64Process failed, assuming native");
            wow64 = FALSE;
        }

        Ok(Self {
            pid,
            handle,
            is_wow64: wow64 != FALSE,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_wow64(&self) -> bool {
        self.is_wow64
    }

    pub(crate) fn raw_handle(&self) -> HANDLE {
        self.handle.raw()
    }

    fn native_context(&self, tid: u32, thread: &OwnedHandle) -> Result<RegisterSnapshot> {
        let mut ctx: CONTEXT = unsafe { mem::zeroed() };
        ctx.ContextFlags = CONTEXT_CONTROL | CONTEXT_INTEGER;
        if unsafe { GetThreadContext(thread.raw(), &mut ctx) } == FALSE {
            let code = unsafe { GetLastError() };
            return Err(ScanError::ContextUnavailable {
                tid,
                reason: format!("GetThreadContext failed with error {}", code),
            });
        }
        Ok(RegisterSnapshot {
            is64bit: true,
            ip: ctx.Rip,
            sp: ctx.Rsp,
            fp: ctx.Rbp,
        })
    }

    fn wow64_context(&self, tid: u32, thread: &OwnedHandle) -> Result<RegisterSnapshot> {
        let mut ctx: WOW64_CONTEXT = unsafe { mem::zeroed() };
        ctx.ContextFlags = WOW64_CONTEXT_CONTROL | WOW64_CONTEXT_INTEGER;
        if unsafe { Wow64GetThreadContext(thread.raw(), &mut ctx) } == FALSE {
            let code = unsafe { GetLastError() };
            return Err(ScanError::ContextUnavailable {
                tid,
                reason: format!("Wow64GetThreadContext failed with error {}", code),
            });
        }
        Ok(RegisterSnapshot {
            is64bit: false,
            ip: ctx.Eip as u64,
            sp: ctx.Esp as u64,
            fp: ctx.Ebp as u64,
        })
    }

    fn teb_address(&self, tid: u32) -> Option<u64> {
        let thread = open_thread(tid, THREAD_QUERY_LIMITED_INFORMATION | THREAD_QUERY_INFORMATION).ok()?;
        let mut info: THREAD_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let mut return_len: u32 = 0;
        let status = unsafe {
            NtQueryInformationThread(
                thread.raw(),
                ThreadBasicInformation,
                &mut info as *mut _ as *mut c_void,
                mem::size_of::<THREAD_BASIC_INFORMATION>() as u32,
                &mut return_len as *mut u32,
            )
        };
        if !nt_success(status) || info.TebBaseAddress.is_null() {
            return None;
        }
        Some(info.TebBaseAddress as u64)
    }
}

impl RemoteProcess for WinProcess {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut read_len: usize = 0;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.raw(),
                address as usize as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                &mut read_len,
            )
        };
        // ERROR_PARTIAL_COPY still reports the bytes that made it
        if ok == FALSE && read_len == 0 {
            return Err(ScanError::ReadFailed {
                address,
                size: buf.len(),
            });
        }
        Ok(read_len)
    }

    fn query_region(&self, address: u64) -> Result<MemoryRegion> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let written = unsafe {
            VirtualQueryEx(
                self.handle.raw(),
                address as usize as *const c_void,
                &mut mbi,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Err(ScanError::QueryFailed { address });
        }
        Ok(MemoryRegion {
            base_address: mbi.BaseAddress as u64,
            allocation_base: mbi.AllocationBase as u64,
            region_size: mbi.RegionSize as u64,
            state: mbi.State,
            protect: mbi.Protect,
            region_type: mbi.Type,
        })
    }

    fn thread_context(&self, tid: u32) -> Result<RegisterSnapshot> {
        let thread = open_thread(tid, THREAD_GET_CONTEXT | THREAD_QUERY_INFORMATION)?;
        if self.is_wow64 {
            self.wow64_context(tid, &thread)
        } else {
            self.native_context(tid, &thread)
        }
    }

    fn stack_bounds(&self, tid: u32, is64bit: bool) -> Option<StackBounds> {
        let teb = self.teb_address(tid)?;
        let bounds = if is64bit {
            StackBounds {
                high: read_ptr(self, teb + TEB64_STACK_BASE, true).ok()?,
                low: read_ptr(self, teb + TEB64_STACK_LIMIT, true).ok()?,
            }
        } else {
            let teb32 = teb + WOW64_TEB_OFFSET;
            StackBounds {
                high: read_ptr(self, teb32 + TEB32_STACK_BASE, false).ok()?,
                low: read_ptr(self, teb32 + TEB32_STACK_LIMIT, false).ok()?,
            }
        };
        trace!(tid, "TEB {:#x} stack {:#x}..{:#x}", teb, bounds.low, bounds.high);
        Some(bounds)
    }
}
