use core::mem;
use core::ptr;

use ntapi::ntexapi::{
    NtQuerySystemInformation, SystemProcessInformation, SYSTEM_PROCESS_INFORMATION,
    SYSTEM_THREAD_INFORMATION,
};
use tracing::{debug, trace};
use winapi::ctypes::c_void;

use super::process::query_thread_win32_start_address;
use crate::context::{ThreadInfo, ThreadState};
use crate::error::{Result, ScanError};
use crate::nt::{nt_success, STATUS_INFO_LENGTH_MISMATCH};

const MAX_SNAPSHOT_BUFFER: usize = 16 * 1024 * 1024;
const MAX_THREADS_PER_PROCESS: usize = 0x20000;

/// Threads of `pid` with their scheduling state and start address.
pub fn list_threads(pid: u32) -> Result<Vec<ThreadInfo>> {
    let buffer = query_system_processes()?;
    let mut threads = unsafe { parse_process_threads(&buffer, pid) }
        .ok_or_else(|| ScanError::AccessDenied(format!("process {} not in system snapshot", pid)))?;

    for info in threads.iter_mut() {
        if let Some(start) = query_thread_win32_start_address(info.tid) {
            info.start_address = Some(start);
        }
    }
    debug!(pid, count = threads.len(), "threads enumerated");
    Ok(threads)
}

fn query_system_processes() -> Result<Vec<u8>> {
    let mut size: usize = 0x10000;

    for _ in 0..6 {
        let mut buffer = vec![0u8; size];
        let mut return_len: u32 = 0;
        let status = unsafe {
            NtQuerySystemInformation(
                SystemProcessInformation,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len() as u32,
                &mut return_len as *mut u32,
            )
        };

        if status == STATUS_INFO_LENGTH_MISMATCH {
            let reported = return_len as usize;
            size = if reported > size {
                reported + 0x1000
            } else {
                size.saturating_mul(2)
            };
            size = size.min(MAX_SNAPSHOT_BUFFER);
            continue;
        }

        if !nt_success(status) {
            return Err(ScanError::AccessDenied(format!(
                "NtQuerySystemInformation failed with status {:#x}",
                status
            )));
        }

        return Ok(buffer);
    }

    Err(ScanError::AccessDenied(
        "system process snapshot kept growing".to_string(),
    ))
}

/// Walks the process entries of a snapshot and returns the threads of `pid`.
unsafe fn parse_process_threads(buffer: &[u8], pid: u32) -> Option<Vec<ThreadInfo>> {
    let buf_end = buffer.as_ptr() as usize + buffer.len();
    let mut offset: usize = 0;

    while offset < buffer.len() {
        let entry_ptr = buffer.as_ptr().add(offset) as *const SYSTEM_PROCESS_INFORMATION;
        let entry_addr = entry_ptr as usize;
        if entry_addr + mem::size_of::<SYSTEM_PROCESS_INFORMATION>() > buf_end {
            break;
        }

        let entry = ptr::read_unaligned(entry_ptr);
        if entry.NextEntryOffset != 0 {
            let off = entry.NextEntryOffset as usize;
            if off < mem::size_of::<SYSTEM_PROCESS_INFORMATION>() || (off & 7) != 0 {
                break;
            }
        }

        if entry.UniqueProcessId as usize as u32 == pid {
            let entry_size = if entry.NextEntryOffset == 0 {
                buf_end.saturating_sub(entry_addr)
            } else {
                entry.NextEntryOffset as usize
            };
            return Some(read_thread_entries(entry_ptr, &entry, entry_size, buf_end));
        }

        if entry.NextEntryOffset == 0 {
            break;
        }
        offset = offset.saturating_add(entry.NextEntryOffset as usize);
    }

    None
}

unsafe fn read_thread_entries(
    entry_ptr: *const SYSTEM_PROCESS_INFORMATION,
    entry: &SYSTEM_PROCESS_INFORMATION,
    entry_size: usize,
    buf_end: usize,
) -> Vec<ThreadInfo> {
    let entry_addr = entry_ptr as usize;
    let thread_count = (entry.NumberOfThreads as usize).min(MAX_THREADS_PER_PROCESS);
    let thread_info_size = mem::size_of::<SYSTEM_THREAD_INFORMATION>();
    let threads_ptr = ptr::addr_of!((*entry_ptr).Threads) as *const SYSTEM_THREAD_INFORMATION;

    let mut threads = Vec::with_capacity(thread_count);
    let mut t_ptr = threads_ptr;
    for _ in 0..thread_count {
        let t_addr = t_ptr as usize;
        if t_addr + thread_info_size > buf_end || t_addr + thread_info_size > entry_addr + entry_size {
            trace!("thread array truncated after {} entries", threads.len());
            break;
        }
        let t = ptr::read_unaligned(t_ptr);
        let start = t.StartAddress as usize as u64;
        threads.push(ThreadInfo {
            tid: t.ClientId.UniqueThread as usize as u32,
            start_address: if start != 0 { Some(start) } else { None },
            state: Some(ThreadState {
                state: t.ThreadState as u32,
                wait_reason: t.WaitReason as u32,
                wait_time: t.WaitTime,
            }),
        });
        t_ptr = t_ptr.add(1);
    }
    threads
}
