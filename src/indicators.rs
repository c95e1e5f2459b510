//! Anomaly tags and the thread-state vocabulary used in thread reports.

use serde::Serialize;

use crate::nt::{THREAD_STATE_UNKNOWN, THREAD_STATE_WAITING};

/// Closed set of causes a thread report can carry.
///
/// Declaration order is the emission order in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ThreadIndicator {
    None,
    SuspiciousStart,
    SuspiciousInstructionPointer,
    SuspiciousReturnAddress,
    ShellcodeCallstackCandidate,
    CallIntegrityViolation,
    CorruptCallstack,
}

impl ThreadIndicator {
    pub const fn as_str(self) -> &'static str {
        match self {
            ThreadIndicator::None => "NONE",
            ThreadIndicator::SuspiciousStart => "SUS_START",
            ThreadIndicator::SuspiciousInstructionPointer => "SUS_IP",
            ThreadIndicator::SuspiciousReturnAddress => "SUS_RET",
            ThreadIndicator::ShellcodeCallstackCandidate => "SUS_CALLSTACK_SHC",
            ThreadIndicator::CallIntegrityViolation => "SUS_CALLS_INTEGRITY",
            ThreadIndicator::CorruptCallstack => "SUS_CALLSTACK_CORRUPT",
        }
    }
}

impl std::fmt::Display for ThreadIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const THREAD_STATE_NAMES: [&str; 10] = [
    "Initialized",
    "Ready",
    "Running",
    "Standby",
    "Terminated",
    "Waiting",
    "Transition",
    "DeferredReady",
    "GateWaitObsolete",
    "WaitingForProcessInSwap",
];

const WAIT_REASON_NAMES: [&str; 41] = [
    "Executive",
    "FreePage",
    "PageIn",
    "PoolAllocation",
    "DelayExecution",
    "Suspended",
    "UserRequest",
    "WrExecutive",
    "WrFreePage",
    "WrPageIn",
    "WrPoolAllocation",
    "WrDelayExecution",
    "WrSuspended",
    "WrUserRequest",
    "WrEventPair",
    "WrQueue",
    "WrLpcReceive",
    "WrLpcReply",
    "WrVirtualMemory",
    "WrPageOut",
    "WrRendezvous",
    "WrKeyedEvent",
    "WrTerminated",
    "WrProcessInSwap",
    "WrCpuRateControl",
    "WrCalloutStack",
    "WrKernel",
    "WrResource",
    "WrPushLock",
    "WrMutex",
    "WrQuantumEnd",
    "WrDispatchInt",
    "WrPreempted",
    "WrYieldExecution",
    "WrFastMutex",
    "WrGuardedMutex",
    "WrRundown",
    "WrAlertByThreadId",
    "WrDeferredPreempt",
    "WrPhysicalFault",
    "WrIoRing",
];

/// Unknown values render as their decimal form.
pub fn translate_thread_state(state: u32) -> String {
    if state == THREAD_STATE_UNKNOWN {
        return "Unknown".to_string();
    }
    match THREAD_STATE_NAMES.get(state as usize) {
        Some(name) => (*name).to_string(),
        None => state.to_string(),
    }
}

pub fn translate_wait_reason(wait_reason: u32) -> String {
    match WAIT_REASON_NAMES.get(wait_reason as usize) {
        Some(name) => (*name).to_string(),
        None => wait_reason.to_string(),
    }
}

/// Whether the live register context of a thread in this state is worth reading.
///
/// Only a waiting thread holds still long enough for its stack to be read.
pub fn should_scan_context(state: u32) -> bool {
    state == THREAD_STATE_WAITING
}
