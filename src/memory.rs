//! Remote-process primitives and memory-region helpers.

use serde::Serialize;

use crate::context::{RegisterSnapshot, StackBounds, ThreadState};
use crate::error::{Result, ScanError};
use crate::nt::{
    MEM_COMMIT, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub allocation_base: u64,
    pub region_size: u64,
    pub state: u32,
    pub protect: u32,
    pub region_type: u32,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base_address.saturating_add(self.region_size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.end()
    }

    pub fn is_committed(&self) -> bool {
        self.state == MEM_COMMIT
    }
}

/// Access to another process. Every call may observe a different, racing state.
///
/// Implementations must tolerate concurrent use from several thread scans.
pub trait RemoteProcess: Sync {
    /// Reads up to `buf.len()` bytes, returning how many were copied.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize>;

    fn query_region(&self, address: u64) -> Result<MemoryRegion>;

    fn thread_context(&self, tid: u32) -> Result<RegisterSnapshot>;

    fn thread_state(&self, _tid: u32) -> Option<ThreadState> {
        None
    }

    fn stack_bounds(&self, _tid: u32, _is64bit: bool) -> Option<StackBounds> {
        None
    }
}

pub fn read_exact(process: &dyn RemoteProcess, address: u64, buf: &mut [u8]) -> Result<()> {
    let read_len = process.read_memory(address, buf)?;
    if read_len < buf.len() {
        return Err(ScanError::ReadFailed {
            address,
            size: buf.len(),
        });
    }
    Ok(())
}

/// Reads one pointer-sized little-endian value.
pub fn read_ptr(process: &dyn RemoteProcess, address: u64, is64bit: bool) -> Result<u64> {
    if is64bit {
        let mut buf = [0u8; 8];
        read_exact(process, address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    } else {
        let mut buf = [0u8; 4];
        read_exact(process, address, &mut buf)?;
        Ok(u32::from_le_bytes(buf) as u64)
    }
}

pub fn is_executable(protect: u32) -> bool {
    let exec_mask =
        PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;
    (protect & exec_mask) != 0
}

pub fn is_readable(protect: u32) -> bool {
    if protect == 0 || (protect & PAGE_NOACCESS) != 0 {
        return false;
    }
    if (protect & PAGE_GUARD) != 0 {
        return false;
    }
    protect != PAGE_EXECUTE
}

/// Remembers regions already queried during one stack walk.
#[derive(Debug, Default)]
pub struct RegionCache {
    regions: Vec<MemoryRegion>,
    misses: Vec<u64>,
}

impl RegionCache {
    pub fn lookup(&mut self, process: &dyn RemoteProcess, address: u64) -> Option<MemoryRegion> {
        if let Some(region) = self.regions.iter().find(|r| r.contains(address)) {
            return Some(*region);
        }
        let page = address & !0xFFF;
        if self.misses.contains(&page) {
            return None;
        }
        match process.query_region(address) {
            Ok(region) if region.contains(address) => {
                self.regions.push(region);
                Some(region)
            }
            _ => {
                self.misses.push(page);
                None
            }
        }
    }

    /// Committed, executable memory: what a return address must point into.
    pub fn is_executable_address(&mut self, process: &dyn RemoteProcess, address: u64) -> bool {
        self.lookup(process, address)
            .map(|r| r.is_committed() && is_executable(r.protect))
            .unwrap_or(false)
    }
}
