#![allow(dead_code)]

pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
pub const PAGE_GUARD: u32 = 0x100;
pub const PAGE_NOCACHE: u32 = 0x200;
pub const PAGE_WRITECOMBINE: u32 = 0x400;

pub const MEM_COMMIT: u32 = 0x00001000;
pub const MEM_RESERVE: u32 = 0x00002000;
pub const MEM_FREE: u32 = 0x00010000;

pub const MEM_PRIVATE: u32 = 0x00020000;
pub const MEM_MAPPED: u32 = 0x00040000;
pub const MEM_IMAGE: u32 = 0x01000000;

pub const MIN_USER_ADDRESS: u64 = 0x10000;
pub const MAX_USER_ADDRESS_64: u64 = 0x0000_7FFF_FFFF_FFFF;
pub const MAX_USER_ADDRESS_32: u64 = 0xFFFF_FFFF;

// KTHREAD_STATE
pub const THREAD_STATE_INITIALIZED: u32 = 0;
pub const THREAD_STATE_READY: u32 = 1;
pub const THREAD_STATE_RUNNING: u32 = 2;
pub const THREAD_STATE_STANDBY: u32 = 3;
pub const THREAD_STATE_TERMINATED: u32 = 4;
pub const THREAD_STATE_WAITING: u32 = 5;
pub const THREAD_STATE_TRANSITION: u32 = 6;
pub const THREAD_STATE_DEFERRED_READY: u32 = 7;
pub const THREAD_STATE_GATE_WAIT_OBSOLETE: u32 = 8;
pub const THREAD_STATE_WAITING_FOR_PROCESS_IN_SWAP: u32 = 9;
pub const THREAD_STATE_UNKNOWN: u32 = u32::MAX;

// KWAIT_REASON, the subset referenced directly
pub const WAIT_REASON_EXECUTIVE: u32 = 0;
pub const WAIT_REASON_DELAY_EXECUTION: u32 = 4;
pub const WAIT_REASON_SUSPENDED: u32 = 5;
pub const WAIT_REASON_USER_REQUEST: u32 = 6;
pub const WAIT_REASON_WR_USER_REQUEST: u32 = 13;
pub const WAIT_REASON_WR_QUEUE: u32 = 15;
pub const WAIT_REASON_WR_ALERT_BY_THREAD_ID: u32 = 37;

pub const THREAD_GET_CONTEXT: u32 = 0x0008;
pub const THREAD_QUERY_INFORMATION: u32 = 0x0040;
pub const THREAD_QUERY_LIMITED_INFORMATION: u32 = 0x0800;

pub const PROCESS_VM_READ: u32 = 0x0010;
pub const PROCESS_QUERY_INFORMATION: u32 = 0x0400;
pub const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;

pub const WOW64_CONTEXT_I386: u32 = 0x00010000;
pub const WOW64_CONTEXT_CONTROL: u32 = WOW64_CONTEXT_I386 | 0x00000001;
pub const WOW64_CONTEXT_INTEGER: u32 = WOW64_CONTEXT_I386 | 0x00000002;

pub const CONTEXT_AMD64: u32 = 0x00100000;
pub const CONTEXT_CONTROL: u32 = CONTEXT_AMD64 | 0x00000001;
pub const CONTEXT_INTEGER: u32 = CONTEXT_AMD64 | 0x00000002;

pub const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;

// TEB offsets of NT_TIB.StackBase / StackLimit, and of the WOW64 TEB
pub const TEB64_STACK_BASE: u64 = 0x08;
pub const TEB64_STACK_LIMIT: u64 = 0x10;
pub const TEB32_STACK_BASE: u64 = 0x04;
pub const TEB32_STACK_LIMIT: u64 = 0x08;
pub const WOW64_TEB_OFFSET: u64 = 0x2000;

#[inline]
pub const fn nt_success(status: i32) -> bool {
    status >= 0
}
