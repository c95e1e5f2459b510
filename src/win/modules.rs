use core::mem;
use core::ptr;

use tracing::{debug, trace};
use winapi::shared::minwindef::{DWORD, FALSE, HMODULE, MAX_PATH};
use winapi::um::psapi::{
    EnumProcessModulesEx, GetModuleBaseNameW, GetModuleFileNameExW, GetModuleInformation,
    LIST_MODULES_ALL, MODULEINFO,
};

use super::process::WinProcess;
use crate::error::{Result, ScanError};
use crate::modules::{ModuleInfo, ModuleList};

const MAX_MODULES: usize = 0x4000;

/// Loaded modules of the process, 32-bit and 64-bit alike.
pub fn enumerate_modules(process: &WinProcess) -> Result<ModuleList> {
    let handle = process.raw_handle();
    let mut handles: Vec<HMODULE> = vec![ptr::null_mut(); 256];

    loop {
        let mut needed: DWORD = 0;
        let ok = unsafe {
            EnumProcessModulesEx(
                handle,
                handles.as_mut_ptr(),
                (handles.len() * mem::size_of::<HMODULE>()) as DWORD,
                &mut needed,
                LIST_MODULES_ALL,
            )
        };
        if ok == FALSE {
            return Err(ScanError::AccessDenied(format!(
                "EnumProcessModulesEx failed for pid {}",
                process.pid()
            )));
        }
        let count = needed as usize / mem::size_of::<HMODULE>();
        if count > handles.len() && count <= MAX_MODULES {
            handles.resize(count, ptr::null_mut());
            continue;
        }
        handles.truncate(count.min(handles.len()));
        break;
    }

    let mut modules = Vec::with_capacity(handles.len());
    for &hmod in &handles {
        let mut info: MODULEINFO = unsafe { mem::zeroed() };
        let ok = unsafe {
            GetModuleInformation(handle, hmod, &mut info, mem::size_of::<MODULEINFO>() as DWORD)
        };
        if ok == FALSE || info.lpBaseOfDll.is_null() || info.SizeOfImage == 0 {
            trace!("skipping module {:p} without image info", hmod);
            continue;
        }

        let mut name_buf = [0u16; MAX_PATH];
        let name_len =
            unsafe { GetModuleBaseNameW(handle, hmod, name_buf.as_mut_ptr(), MAX_PATH as DWORD) };
        let mut path_buf = [0u16; MAX_PATH];
        let path_len =
            unsafe { GetModuleFileNameExW(handle, hmod, path_buf.as_mut_ptr(), MAX_PATH as DWORD) };

        modules.push(ModuleInfo {
            base_address: info.lpBaseOfDll as u64,
            size: info.SizeOfImage as u64,
            base_name: utf16_name(&name_buf, name_len as usize),
            full_name: utf16_name(&path_buf, path_len as usize),
        });
    }

    debug!(pid = process.pid(), count = modules.len(), "modules enumerated");
    Ok(ModuleList::new(modules))
}

fn utf16_name(buf: &[u16], len: usize) -> Option<String> {
    if len == 0 {
        return None;
    }
    Some(String::from_utf16_lossy(&buf[..len.min(buf.len())]))
}
