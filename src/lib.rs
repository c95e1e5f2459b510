//! ThreadSieve - thread execution-state anomaly scanner
//!
//! Decides, per thread of a live process, whether its instruction pointer and
//! call stack look like legitimate module code or like injected code
//! (shellcode, stack pivots, spoofed return addresses).

#![allow(non_snake_case)]

pub mod callsite;
pub mod config;
pub mod context;
pub mod entropy;
pub mod error;
pub mod indicators;
pub mod memory;
pub mod modules;
mod nt;
pub mod pe;
pub mod report;
pub mod scanner;
pub mod stack_unwind;
pub mod symbols;

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod win;

pub use callsite::{CallSiteDecoder, X86CallSiteDecoder};
pub use config::ScanOptions;
pub use context::{CtxDetails, RegisterSnapshot, StackBounds, ThreadInfo, ThreadState};
pub use entropy::{AreaStats, EntropyStatsCollector, StatsCollector};
pub use error::{Result, ScanError};
pub use indicators::ThreadIndicator;
pub use memory::{MemoryRegion, RemoteProcess};
pub use modules::{ModuleInfo, ModuleList, ModuleMap};
pub use report::{Reportable, ScanStatus, ThreadScanReport};
pub use scanner::{scan_threads, Collaborators, ThreadScanner};
pub use symbols::{ExportMap, ExportTable, SymbolResolver};

/// Page, region and thread-state constants used in reports and by process backends.
pub mod consts {
    pub use crate::nt::{
        MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_MAPPED, MEM_PRIVATE, MEM_RESERVE, PAGE_EXECUTE,
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
        THREAD_STATE_INITIALIZED, THREAD_STATE_READY, THREAD_STATE_RUNNING,
        THREAD_STATE_TERMINATED, THREAD_STATE_TRANSITION, THREAD_STATE_UNKNOWN,
        THREAD_STATE_WAITING, WAIT_REASON_DELAY_EXECUTION, WAIT_REASON_USER_REQUEST,
        WAIT_REASON_WR_QUEUE,
    };
}
