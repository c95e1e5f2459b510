use std::collections::BTreeSet;

use serde::Serialize;

use crate::nt::{MAX_USER_ADDRESS_32, MAX_USER_ADDRESS_64, MIN_USER_ADDRESS};

/// OS-reported scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadState {
    pub state: u32,
    pub wait_reason: u32,
    pub wait_time: u32,
}

/// Identity and OS-side metadata of the thread to scan. Read-only to the scanner.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreadInfo {
    pub tid: u32,
    pub start_address: Option<u64>,
    pub state: Option<ThreadState>,
}

impl ThreadInfo {
    pub fn new(tid: u32) -> Self {
        Self {
            tid,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub is64bit: bool,
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

impl RegisterSnapshot {
    /// A 32-bit snapshot carrying 64-bit wide values was read with the wrong layout.
    pub fn fits_bitness(&self) -> bool {
        if self.is64bit {
            return true;
        }
        self.ip <= MAX_USER_ADDRESS_32 && self.sp <= MAX_USER_ADDRESS_32 && self.fp <= MAX_USER_ADDRESS_32
    }
}

/// `low` is the stack limit, `high` the stack base (exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackBounds {
    pub low: u64,
    pub high: u64,
}

impl StackBounds {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.low && addr < self.high
    }

    pub fn is_valid(&self) -> bool {
        self.high > self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameSource {
    ReturnSlot,
    StackScan,
    FramePointer,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    pub stack_address: u64,
    pub return_address: u64,
    pub module_name: Option<String>,
    pub has_symbol: bool,
    pub source: FrameSource,
}

/// Register state and stack-walk results of one thread, for one scan attempt.
#[derive(Debug, Clone, Default)]
pub struct CtxDetails {
    pub is64bit: bool,
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    /// The most recent return address found while walking the stack.
    pub last_ret: u64,
    /// Raw value of the return slot at the stack pointer, before validation.
    pub ret_on_stack: u64,
    pub is_ret_as_syscall: bool,
    /// The return slot is vouched for beyond its shape and sits below the caller's frame.
    pub is_ret_in_frame: bool,
    pub is_managed: bool,
    pub stack_frames_count: usize,
    pub shc_candidates: BTreeSet<u64>,
    pub frames: Vec<StackFrame>,
    pub stack_ptr_plausible: bool,
    pub chain_consistent: bool,
}

impl CtxDetails {
    pub fn from_registers(regs: &RegisterSnapshot) -> Self {
        Self {
            is64bit: regs.is64bit,
            rip: regs.ip,
            rsp: regs.sp,
            rbp: regs.fp,
            stack_ptr_plausible: true,
            chain_consistent: true,
            ..Self::default()
        }
    }

    pub fn ptr_size(&self) -> u64 {
        if self.is64bit {
            8
        } else {
            4
        }
    }
}

pub fn is_user_address(addr: u64, is64bit: bool) -> bool {
    let max = if is64bit {
        MAX_USER_ADDRESS_64
    } else {
        MAX_USER_ADDRESS_32
    };
    (MIN_USER_ADDRESS..=max).contains(&addr)
}
