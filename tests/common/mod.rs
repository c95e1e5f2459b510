#![allow(dead_code)]

use std::collections::HashMap;

use ThreadSieve::consts::{MEM_COMMIT, MEM_IMAGE, MEM_PRIVATE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_READWRITE};
use ThreadSieve::{
    Collaborators, EntropyStatsCollector, ExportTable, MemoryRegion, ModuleInfo, ModuleList,
    RegisterSnapshot, RemoteProcess, Result, ScanError, ScanOptions, StackBounds, ThreadInfo,
    ThreadScanReport, ThreadScanner, X86CallSiteDecoder,
};

pub const KERNEL32_BASE: u64 = 0x7ffa_1000_0000;
pub const NTDLL_BASE: u64 = 0x7ffa_2000_0000;
pub const APP_BASE: u64 = 0x7ff6_0000_0000;
pub const CLR_BASE: u64 = 0x7ffa_3000_0000;
pub const MODULE_SIZE: u64 = 0x10_0000;

pub const STACK_LOW: u64 = 0x50_0000;
pub const STACK_HIGH: u64 = 0x52_0000;

pub const SHELLCODE_BASE: u64 = 0x2_0000_0000;
pub const SHELLCODE_SIZE: u64 = 0x1000;

pub const JIT_BASE: u64 = 0x3_0000_0000;

pub const WOW_APP_BASE: u64 = 0x0100_0000;
pub const WOW_KERNEL32_BASE: u64 = 0x7600_0000;
pub const WOW_NTDLL_BASE: u64 = 0x7700_0000;

/// An in-memory stand-in for a live process.
#[derive(Default)]
pub struct FakeProcess {
    pages: HashMap<u64, Vec<u8>>,
    regions: Vec<MemoryRegion>,
    contexts: HashMap<u32, RegisterSnapshot>,
    bounds: HashMap<u32, StackBounds>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a zero-filled region; its bytes become readable when `protect` allows it.
    pub fn map(&mut self, base: u64, size: u64, protect: u32, region_type: u32) {
        self.regions.push(MemoryRegion {
            base_address: base,
            allocation_base: base,
            region_size: size,
            state: MEM_COMMIT,
            protect,
            region_type,
        });
        self.pages.insert(base, vec![0u8; size as usize]);
    }

    pub fn map_image(&mut self, base: u64) {
        self.map(base, MODULE_SIZE, PAGE_EXECUTE_READ, MEM_IMAGE);
    }

    pub fn map_stack(&mut self, tid: u32) {
        self.map(STACK_LOW, STACK_HIGH - STACK_LOW, PAGE_READWRITE, MEM_PRIVATE);
        self.bounds.insert(
            tid,
            StackBounds {
                low: STACK_LOW,
                high: STACK_HIGH,
            },
        );
    }

    pub fn map_shellcode(&mut self) {
        self.map(SHELLCODE_BASE, SHELLCODE_SIZE, PAGE_EXECUTE_READWRITE, MEM_PRIVATE);
        let body: Vec<u8> = (0..SHELLCODE_SIZE).map(|i| (i * 37 % 251) as u8).collect();
        self.write(SHELLCODE_BASE, &body);
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        for (base, data) in self.pages.iter_mut() {
            let end = base + data.len() as u64;
            if address >= *base && address + bytes.len() as u64 <= end {
                let off = (address - base) as usize;
                data[off..off + bytes.len()].copy_from_slice(bytes);
                return;
            }
        }
        panic!("write outside mapped memory at {:#x}", address);
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write(address, &value.to_le_bytes());
    }

    /// Places `call rel32` right before `ret` so it looks like a genuine return site.
    pub fn plant_call_before(&mut self, ret: u64) {
        self.write(ret - 5, &[0xE8, 0x10, 0x20, 0x00, 0x00]);
    }

    pub fn set_context(&mut self, tid: u32, ip: u64, sp: u64, fp: u64) {
        self.contexts.insert(
            tid,
            RegisterSnapshot {
                is64bit: true,
                ip,
                sp,
                fp,
            },
        );
    }

    /// A WOW64 thread; values wider than 32 bits model a context read with the wrong layout.
    pub fn set_context32(&mut self, tid: u32, ip: u64, sp: u64, fp: u64) {
        self.contexts.insert(
            tid,
            RegisterSnapshot {
                is64bit: false,
                ip,
                sp,
                fp,
            },
        );
    }

    fn region_of(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }
}

impl RemoteProcess for FakeProcess {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        let failed = ScanError::ReadFailed {
            address,
            size: buf.len(),
        };
        let region = match self.region_of(address) {
            Some(r) => r,
            None => return Err(failed),
        };
        if !ThreadSieve::memory::is_readable(region.protect) {
            return Err(failed);
        }
        let data = match self.pages.get(&region.base_address) {
            Some(d) => d,
            None => return Err(failed),
        };
        let off = (address - region.base_address) as usize;
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn query_region(&self, address: u64) -> Result<MemoryRegion> {
        self.region_of(address)
            .copied()
            .ok_or(ScanError::QueryFailed { address })
    }

    fn thread_context(&self, tid: u32) -> Result<RegisterSnapshot> {
        self.contexts
            .get(&tid)
            .copied()
            .ok_or(ScanError::ContextUnavailable {
                tid,
                reason: "thread exited".into(),
            })
    }

    fn stack_bounds(&self, tid: u32, _is64bit: bool) -> Option<StackBounds> {
        self.bounds.get(&tid).copied()
    }
}

pub fn standard_modules() -> ModuleList {
    ModuleList::new(vec![
        ModuleInfo::new(APP_BASE, MODULE_SIZE, "app.exe"),
        ModuleInfo::new(KERNEL32_BASE, MODULE_SIZE, "kernel32.dll"),
        ModuleInfo::new(NTDLL_BASE, MODULE_SIZE, "ntdll.dll"),
        ModuleInfo::new(CLR_BASE, MODULE_SIZE, "coreclr.dll"),
    ])
}

pub fn map_standard_images(process: &mut FakeProcess) {
    for base in [APP_BASE, KERNEL32_BASE, NTDLL_BASE, CLR_BASE] {
        process.map_image(base);
    }
}

pub fn wow64_modules() -> ModuleList {
    ModuleList::new(vec![
        ModuleInfo::new(WOW_APP_BASE, MODULE_SIZE, "app32.exe"),
        ModuleInfo::new(WOW_KERNEL32_BASE, MODULE_SIZE, "kernel32.dll"),
        ModuleInfo::new(WOW_NTDLL_BASE, MODULE_SIZE, "ntdll.dll"),
    ])
}

pub fn map_wow64_images(process: &mut FakeProcess) {
    for base in [WOW_APP_BASE, WOW_KERNEL32_BASE, WOW_NTDLL_BASE] {
        process.map_image(base);
    }
}

pub fn scan(
    process: &FakeProcess,
    modules: &ModuleList,
    exports: Option<&ExportTable>,
    info: &ThreadInfo,
    options: ScanOptions,
) -> ThreadScanReport {
    let stats = EntropyStatsCollector::default();
    let decoder = X86CallSiteDecoder;
    let collab = Collaborators {
        process,
        modules,
        exports: exports.map(|e| e as &dyn ThreadSieve::ExportMap),
        symbols: None,
        stats: &stats,
        decoder: &decoder,
    };
    ThreadScanner::new(collab, info, options)
        .expect("valid options")
        .scan_remote()
}
