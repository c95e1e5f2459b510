mod common;

use serde_json::{json, Value};

use common::*;
use ThreadSieve::consts::{
    MEM_PRIVATE, PAGE_EXECUTE_READ, THREAD_STATE_INITIALIZED, THREAD_STATE_RUNNING,
    THREAD_STATE_TRANSITION, THREAD_STATE_WAITING, WAIT_REASON_DELAY_EXECUTION,
    WAIT_REASON_WR_QUEUE,
};
use ThreadSieve::symbols::ExportEntry;
use ThreadSieve::{
    scan_threads, Collaborators, EntropyStatsCollector, ExportTable, Reportable, ScanOptions,
    ScanStatus, ThreadIndicator, ThreadInfo, ThreadScanReport, ThreadState, X86CallSiteDecoder,
};

const CLEAN_TID: u32 = 100;
const SHELLCODE_TID: u32 = 200;

const RSP: u64 = 0x51_0000;
const RBP: u64 = 0x51_0100;
const OUTER_FP: u64 = 0x51_0200;

fn waiting(tid: u32, start: u64) -> ThreadInfo {
    ThreadInfo {
        tid,
        start_address: Some(start),
        state: Some(ThreadState {
            state: THREAD_STATE_WAITING,
            wait_reason: WAIT_REASON_WR_QUEUE,
            wait_time: 12,
        }),
    }
}

/// A thread blocked in kernel32 with a two-link frame chain back to the app and the thread thunk.
fn clean_process(slot_value: u64) -> FakeProcess {
    let mut process = FakeProcess::new();
    map_standard_images(&mut process);
    process.map_stack(CLEAN_TID);

    let caller = APP_BASE + 0x2005;
    let thunk = KERNEL32_BASE + 0x3005;
    for ret in [APP_BASE + 0x1105, caller, thunk] {
        process.plant_call_before(ret);
    }

    process.write_u64(RSP, slot_value);
    process.write_u64(RBP, OUTER_FP);
    process.write_u64(RBP + 8, caller);
    process.write_u64(OUTER_FP, 0);
    process.write_u64(OUTER_FP + 8, thunk);

    process.set_context(CLEAN_TID, KERNEL32_BASE + 0x1234, RSP, RBP);
    process
}

fn fields(report: &ThreadScanReport) -> Value {
    report.to_json()["thread_scan"].clone()
}

fn indicators(report: &ThreadScanReport) -> Vec<ThreadIndicator> {
    report.indicators.iter().copied().collect()
}

#[test]
fn clean_thread_reports_none() {
    let process = clean_process(APP_BASE + 0x1105);
    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);

    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(indicators(&report), vec![ThreadIndicator::None]);
    assert_eq!(report.susp_addr, 0);
    assert_eq!(report.status(), ScanStatus::NotSuspicious);
    assert_eq!(report.frames_count, 3);
    assert!(report.stats.is_none());

    let f = fields(&report);
    assert_eq!(f["status"], json!(0));
    assert_eq!(f["indicators"], json!(["NONE"]));
    assert_eq!(f["stack_ptr"], json!("510000"));
    assert_eq!(f["frames_count"], json!(3));
    assert_eq!(f["thread_state"], json!("Waiting"));
    assert_eq!(f["thread_wait_reason"], json!("WrQueue"));
    assert!(f.get("susp_addr").is_none());
    assert!(f.get("susp_return_addr").is_none());
    assert!(f.get("entropy").is_none());
}

#[test]
fn shellcode_thread_reports_start_and_corrupt_stack() {
    let mut process = FakeProcess::new();
    map_standard_images(&mut process);
    process.map_shellcode();
    let rip = SHELLCODE_BASE + 0x40;
    process.set_context(SHELLCODE_TID, rip, 0x7000_0000, 0);

    let modules = standard_modules();
    let info = waiting(SHELLCODE_TID, rip);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(
        indicators(&report),
        vec![ThreadIndicator::SuspiciousStart, ThreadIndicator::CorruptCallstack]
    );
    assert_eq!(report.susp_addr, rip);
    assert_eq!(report.frames_count, 0);
    assert!(report.is_suspicious());
    assert!(report.is_code);

    let stats = report.stats.as_ref().expect("entropy for unnamed region");
    assert_eq!(stats.area_start, SHELLCODE_BASE);
    assert_eq!(stats.area_size as u64, SHELLCODE_SIZE);
    assert!(stats.entropy > 0.0);

    let f = fields(&report);
    assert_eq!(f["status"], json!(1));
    assert_eq!(f["indicators"], json!(["SUS_START", "SUS_CALLSTACK_CORRUPT"]));
    assert_eq!(f["susp_addr"], json!(format!("{:x}", rip)));
    assert_eq!(f["module"], json!(format!("{:x}", SHELLCODE_BASE)));
    assert_eq!(f["protection"], json!("40"));
    assert!(f.get("frames_count").is_none());
    assert!(f["entropy"].is_object());
}

#[test]
fn return_address_outside_modules_is_reported() {
    let mut process = clean_process(0);
    process.map_shellcode();
    let ret = SHELLCODE_BASE + 0x105;
    process.plant_call_before(ret);
    process.write_u64(RSP, ret);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert!(report.has_indicator(ThreadIndicator::SuspiciousReturnAddress));
    assert!(report.has_indicator(ThreadIndicator::ShellcodeCallstackCandidate));
    assert!(!report.has_indicator(ThreadIndicator::CallIntegrityViolation));
    assert!(!report.has_indicator(ThreadIndicator::CorruptCallstack));
    assert_eq!(report.susp_addr, ret);
    assert!(report.stats.is_some());
}

#[test]
fn return_slot_without_call_violates_integrity() {
    let ret = KERNEL32_BASE + 0x4000;
    let process = clean_process(ret);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    // nothing vouches for the slot either, so the walk is not trusted
    assert_eq!(
        indicators(&report),
        vec![ThreadIndicator::CallIntegrityViolation, ThreadIndicator::CorruptCallstack]
    );
    assert_eq!(report.susp_addr, ret);
    // named module memory gets its region but no entropy pass
    assert_eq!(report.base.module, KERNEL32_BASE);
    assert_eq!(report.protection, PAGE_EXECUTE_READ);
    assert!(report.stats.is_none());
    assert!(fields(&report).get("entropy").is_none());
}

#[test]
fn unreadable_stack_pointer_yields_zero_frames() {
    let mut process = FakeProcess::new();
    map_standard_images(&mut process);
    process.set_context(CLEAN_TID, KERNEL32_BASE + 0x1234, 0x6000_0000, 0x6000_0100);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(indicators(&report), vec![ThreadIndicator::CorruptCallstack]);
    assert_eq!(report.frames_count, 0);
    assert_eq!(report.susp_addr, 0);
    assert!(report.stats.is_none());
}

#[test]
fn syscall_return_site_needs_no_call() {
    let ret = NTDLL_BASE + 0x5014;
    let mut process = clean_process(ret);
    // mov eax, 0x34; syscall
    process.write(ret - 7, &[0xB8, 0x34, 0x00, 0x00, 0x00, 0x0F, 0x05]);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(indicators(&report), vec![ThreadIndicator::None]);
    assert_eq!(report.frames_count, 3);

    process.write(ret - 7, &[0x90; 7]);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());
    assert!(report.has_indicator(ThreadIndicator::CallIntegrityViolation));
}

#[test]
fn frame_pointer_below_stack_pointer_is_corrupt() {
    let ret = NTDLL_BASE + 0x1105;
    let mut process = clean_process(ret);
    process.plant_call_before(ret);
    let stale_fp = RSP - 0x40;
    process.write_u64(stale_fp, 0);
    process.write_u64(stale_fp + 8, APP_BASE + 0x2005);
    process.set_context(CLEAN_TID, KERNEL32_BASE + 0x1234, RSP, stale_fp);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(indicators(&report), vec![ThreadIndicator::CorruptCallstack]);
    assert_eq!(report.susp_addr, 0);

    // the same slot under a frame pointer above the stack pointer is clean
    process.set_context(CLEAN_TID, KERNEL32_BASE + 0x1234, RSP, RBP);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());
    assert_eq!(indicators(&report), vec![ThreadIndicator::None]);
}

#[test]
fn wow64_thread_walks_32bit_stack() {
    let mut process = FakeProcess::new();
    map_wow64_images(&mut process);
    process.map_stack(CLEAN_TID);

    let first = WOW_APP_BASE + 0x1105;
    let caller = WOW_APP_BASE + 0x2005;
    let thunk = WOW_KERNEL32_BASE + 0x3005;
    for ret in [first, caller, thunk] {
        process.plant_call_before(ret);
    }
    process.write_u32(RSP, first as u32);
    process.write_u32(RBP, OUTER_FP as u32);
    process.write_u32(RBP + 4, caller as u32);
    process.write_u32(OUTER_FP, 0);
    process.write_u32(OUTER_FP + 4, thunk as u32);
    process.set_context32(CLEAN_TID, WOW_KERNEL32_BASE + 0x1234, RSP, RBP);

    let modules = wow64_modules();
    let info = waiting(CLEAN_TID, WOW_APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(indicators(&report), vec![ThreadIndicator::None]);
    assert_eq!(report.stack_ptr, RSP);
    assert_eq!(report.frames_count, 3);
}

#[test]
fn wide_values_in_32bit_context_are_corrupt() {
    let mut process = FakeProcess::new();
    map_wow64_images(&mut process);
    process.map_stack(CLEAN_TID);
    process.set_context32(
        CLEAN_TID,
        WOW_KERNEL32_BASE + 0x1234,
        0x0000_00a1_0051_0000,
        0,
    );

    let modules = wow64_modules();
    let info = waiting(CLEAN_TID, WOW_APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(indicators(&report), vec![ThreadIndicator::CorruptCallstack]);
    assert_eq!(report.frames_count, 0);
    assert_eq!(report.susp_addr, 0);
}

#[test]
fn descending_frame_chain_is_corrupt() {
    let mut process = clean_process(APP_BASE + 0x1105);
    process.write_u64(RBP, RBP - 0x80);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(indicators(&report), vec![ThreadIndicator::CorruptCallstack]);
    assert_eq!(report.susp_addr, 0);
}

#[test]
fn instruction_pointer_outside_modules_is_reported() {
    let mut process = clean_process(APP_BASE + 0x1105);
    process.map_shellcode();
    let rip = SHELLCODE_BASE + 0x80;
    process.set_context(CLEAN_TID, rip, RSP, RBP);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    let report = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(
        indicators(&report),
        vec![ThreadIndicator::SuspiciousInstructionPointer]
    );
    assert_eq!(report.susp_addr, rip);
}

#[test]
fn wait_reason_is_rendered_only_for_waiting_threads() {
    let process = clean_process(APP_BASE + 0x1105);
    let modules = standard_modules();

    let mut info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    info.state = Some(ThreadState {
        state: THREAD_STATE_WAITING,
        wait_reason: WAIT_REASON_DELAY_EXECUTION,
        wait_time: 0,
    });
    let f = fields(&scan(&process, &modules, None, &info, ScanOptions::default()));
    assert_eq!(f["thread_wait_reason"], json!("DelayExecution"));

    info.state = Some(ThreadState {
        state: THREAD_STATE_RUNNING,
        wait_reason: WAIT_REASON_DELAY_EXECUTION,
        wait_time: 0,
    });
    let report = scan(&process, &modules, None, &info, ScanOptions::default());
    let f = fields(&report);
    assert_eq!(f["thread_state"], json!("Running"));
    assert!(f.get("thread_wait_reason").is_none());
    // running threads are only checked for their start address
    assert_eq!(report.stack_ptr, 0);
    assert_eq!(indicators(&report), vec![ThreadIndicator::None]);
}

#[test]
fn only_waiting_threads_get_a_context_scan() {
    let process = clean_process(KERNEL32_BASE + 0x4000);
    let modules = standard_modules();
    let mut info = waiting(CLEAN_TID, APP_BASE + 0x1000);

    for state in [THREAD_STATE_INITIALIZED, THREAD_STATE_TRANSITION] {
        info.state = Some(ThreadState {
            state,
            wait_reason: 0,
            wait_time: 0,
        });
        let report = scan(&process, &modules, None, &info, ScanOptions::default());
        assert_eq!(report.stack_ptr, 0, "state {}", state);
        assert_eq!(indicators(&report), vec![ThreadIndicator::None]);
    }
}

#[test]
fn state_filter_can_be_disabled() {
    let process = clean_process(APP_BASE + 0x1105);
    let modules = standard_modules();
    let mut info = waiting(CLEAN_TID, APP_BASE + 0x1000);
    info.state = Some(ThreadState {
        state: THREAD_STATE_RUNNING,
        wait_reason: 0,
        wait_time: 0,
    });

    let options = ScanOptions {
        filter_by_state: false,
        ..ScanOptions::default()
    };
    let report = scan(&process, &modules, None, &info, options);
    assert_eq!(report.stack_ptr, RSP);
    assert_eq!(report.frames_count, 3);
}

#[test]
fn scanning_twice_gives_identical_reports() {
    let mut process = FakeProcess::new();
    map_standard_images(&mut process);
    process.map_shellcode();
    let rip = SHELLCODE_BASE + 0x40;
    process.set_context(SHELLCODE_TID, rip, 0x7000_0000, 0);

    let modules = standard_modules();
    let info = waiting(SHELLCODE_TID, rip);
    let first = scan(&process, &modules, None, &info, ScanOptions::default());
    let second = scan(&process, &modules, None, &info, ScanOptions::default());

    assert_eq!(first, second);
    assert_eq!(
        first.to_json_string().unwrap(),
        second.to_json_string().unwrap()
    );
}

#[test]
fn jit_frames_are_filtered_on_managed_stacks() {
    let mut process = clean_process(0);
    process.map(JIT_BASE, 0x1000, PAGE_EXECUTE_READ, MEM_PRIVATE);
    let jit_ret = JIT_BASE + 0x105;
    process.plant_call_before(jit_ret);
    process.write_u64(RSP, jit_ret);
    process.set_context(CLEAN_TID, CLR_BASE + 0x500, RSP, RBP);

    let modules = standard_modules();
    let info = waiting(CLEAN_TID, APP_BASE + 0x1000);

    let report = scan(&process, &modules, None, &info, ScanOptions::default());
    assert_eq!(indicators(&report), vec![ThreadIndicator::None]);
    assert_eq!(report.susp_addr, 0);

    let unfiltered = ScanOptions {
        filter_managed: false,
        ..ScanOptions::default()
    };
    let report = scan(&process, &modules, None, &info, unfiltered);
    assert!(report.has_indicator(ThreadIndicator::SuspiciousReturnAddress));
    assert_eq!(report.susp_addr, jit_ret);
}

#[test]
fn exact_export_start_is_a_valid_thunk() {
    let mut process = FakeProcess::new();
    map_standard_images(&mut process);
    process.map_shellcode();

    let mut exports = ExportTable::new();
    exports.extend([ExportEntry {
        address: SHELLCODE_BASE,
        module: "kernelbase.dll".into(),
        name: "ThreadThunk".into(),
        module_base: SHELLCODE_BASE,
        module_end: SHELLCODE_BASE + SHELLCODE_SIZE,
    }]);

    let modules = standard_modules();
    let running = Some(ThreadState {
        state: THREAD_STATE_RUNNING,
        wait_reason: 0,
        wait_time: 0,
    });

    let thunk = ThreadInfo {
        tid: 7,
        start_address: Some(SHELLCODE_BASE),
        state: running,
    };
    let report = scan(&process, &modules, Some(&exports), &thunk, ScanOptions::default());
    assert_eq!(indicators(&report), vec![ThreadIndicator::None]);

    let displaced = ThreadInfo {
        start_address: Some(SHELLCODE_BASE + 0x10),
        ..thunk
    };
    let report = scan(&process, &modules, Some(&exports), &displaced, ScanOptions::default());
    assert_eq!(indicators(&report), vec![ThreadIndicator::SuspiciousStart]);
    assert_eq!(report.susp_addr, SHELLCODE_BASE + 0x10);
}

#[test]
fn missing_context_degrades_to_error_report() {
    let process = FakeProcess::new();
    let modules = standard_modules();
    let info = waiting(999, APP_BASE + 0x1000);

    let report = scan(&process, &modules, None, &info, ScanOptions::default());
    assert_eq!(report.status(), ScanStatus::Error);
    assert!(report.indicators.is_empty());

    let f = fields(&report);
    assert_eq!(f["status"], json!(-1));
    assert!(f.get("thread_state").is_none());
}

#[test]
fn batch_scan_keeps_input_order() {
    let mut process = clean_process(APP_BASE + 0x1105);
    process.map_shellcode();
    process.set_context(SHELLCODE_TID, SHELLCODE_BASE + 0x40, 0x7000_0000, 0);

    let modules = standard_modules();
    let stats = EntropyStatsCollector::default();
    let decoder = X86CallSiteDecoder;
    let collab = Collaborators {
        process: &process,
        modules: &modules,
        exports: None,
        symbols: None,
        stats: &stats,
        decoder: &decoder,
    };
    let threads = vec![
        waiting(SHELLCODE_TID, SHELLCODE_BASE + 0x40),
        waiting(CLEAN_TID, APP_BASE + 0x1000),
        waiting(999, APP_BASE + 0x1000),
    ];

    let reports = scan_threads(collab, &threads, ScanOptions::default()).unwrap();
    let tids: Vec<u32> = reports.iter().map(|r| r.tid).collect();
    assert_eq!(tids, vec![SHELLCODE_TID, CLEAN_TID, 999]);
    assert!(reports[0].is_suspicious());
    assert!(!reports[1].is_suspicious());
    assert_eq!(reports[2].status(), ScanStatus::Error);
}
