//! Per-thread scan: context fetch, stack walk, classification, enrichment.

use rayon::prelude::*;
use tracing::{debug, warn, Level};

use crate::callsite::CallSiteDecoder;
use crate::config::ScanOptions;
use crate::context::{is_user_address, CtxDetails, ThreadInfo};
use crate::entropy::StatsCollector;
use crate::error::Result;
use crate::indicators::{should_scan_context, ThreadIndicator};
use crate::memory::{is_executable, is_readable, RemoteProcess};
use crate::modules::ModuleMap;
use crate::nt::THREAD_STATE_UNKNOWN;
use crate::report::{ScanStatus, ThreadScanReport};
use crate::stack_unwind::StackWalker;
use crate::symbols::{format_resolved, resolve_low_level_func_name, ExportMap, SymbolResolver};

/// Read-only services shared by every thread scan of one process.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub process: &'a dyn RemoteProcess,
    pub modules: &'a dyn ModuleMap,
    pub exports: Option<&'a dyn ExportMap>,
    pub symbols: Option<&'a dyn SymbolResolver>,
    pub stats: &'a dyn StatsCollector,
    pub decoder: &'a dyn CallSiteDecoder,
}

/// One heuristic hit and the address that triggered it (0 when it has none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Finding {
    indicator: ThreadIndicator,
    address: u64,
}

impl Finding {
    fn new(indicator: ThreadIndicator, address: u64) -> Self {
        Self { indicator, address }
    }
}

pub struct ThreadScanner<'a> {
    collab: Collaborators<'a>,
    info: &'a ThreadInfo,
    options: ScanOptions,
}

impl<'a> ThreadScanner<'a> {
    pub fn new(collab: Collaborators<'a>, info: &'a ThreadInfo, options: ScanOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            collab,
            info,
            options,
        })
    }

    pub fn scan_remote(&self) -> ThreadScanReport {
        let tid = self.info.tid;
        let mut report = ThreadScanReport::new(tid);

        let state = self
            .info
            .state
            .or_else(|| self.collab.process.thread_state(tid));
        if let Some(state) = state {
            report.thread_state = state.state;
            report.thread_wait_reason = state.wait_reason;
            report.thread_wait_time = state.wait_time;
        }

        if self.skips_context_scan(report.thread_state) {
            debug!(tid, "thread not waiting, checking start address only");
            let findings = self.classify(None);
            self.apply_findings(&mut report, &findings);
            self.enrich(&mut report);
            return report;
        }

        let ctx = match self.fetch_thread_ctx_details() {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(tid, %err, "could not fetch thread context");
                report.thread_state = THREAD_STATE_UNKNOWN;
                report.base.status = ScanStatus::Error;
                return report;
            }
        };
        report.stack_ptr = ctx.rsp;
        report.frames_count = ctx.stack_frames_count;

        let findings = self.classify(Some(&ctx));
        let findings = self.filter_managed(&ctx, findings);
        self.apply_findings(&mut report, &findings);
        self.log_resolved_names(&ctx, report.susp_addr);
        self.enrich(&mut report);
        report
    }

    fn skips_context_scan(&self, thread_state: u32) -> bool {
        if self.options.is_reflection || !self.options.filter_by_state {
            return false;
        }
        thread_state != THREAD_STATE_UNKNOWN && !should_scan_context(thread_state)
    }

    fn walker(&self) -> StackWalker<'a> {
        StackWalker::new(
            self.collab.process,
            self.collab.modules,
            self.collab.exports,
            self.collab.symbols,
            self.collab.decoder,
            self.options,
        )
    }

    fn fetch_thread_ctx_details(&self) -> Result<CtxDetails> {
        let tid = self.info.tid;
        let regs = self.collab.process.thread_context(tid)?;
        let mut ctx = CtxDetails::from_registers(&regs);

        if !regs.fits_bitness() {
            warn!(tid, "32-bit context carries 64-bit values, layout mismatch");
            ctx.stack_ptr_plausible = false;
        } else if !is_user_address(ctx.rsp, ctx.is64bit) {
            warn!(tid, "stack pointer {:#x} outside user space", ctx.rsp);
            ctx.stack_ptr_plausible = false;
        }

        let frames = self.walker().fill_call_stack_info(tid, &mut ctx);
        debug!(
            tid,
            frames,
            candidates = ctx.shc_candidates.len(),
            managed = ctx.is_managed,
            "stack walked"
        );
        Ok(ctx)
    }

    /// Runs the heuristics in precedence order. `None` means the context was not
    /// read and only the start address can be judged.
    fn classify(&self, ctx: Option<&CtxDetails>) -> Vec<Finding> {
        let mut findings = Vec::new();

        let flagged_start = self
            .info
            .start_address
            .filter(|&start| self.is_suspicious_start(start));
        if let Some(start) = flagged_start {
            findings.push(Finding::new(ThreadIndicator::SuspiciousStart, start));
        }

        let Some(ctx) = ctx else {
            return findings;
        };

        if ctx.rip != 0 && !self.in_named_module(ctx.rip) && flagged_start != Some(ctx.rip) {
            findings.push(Finding::new(
                ThreadIndicator::SuspiciousInstructionPointer,
                ctx.rip,
            ));
        }

        if ctx.last_ret != 0 && !self.in_named_module(ctx.last_ret) {
            findings.push(Finding::new(
                ThreadIndicator::SuspiciousReturnAddress,
                ctx.last_ret,
            ));
        }

        if ctx.shc_candidates.len() >= self.options.shellcode_candidate_threshold {
            if let Some(&first) = ctx.shc_candidates.iter().next() {
                findings.push(Finding::new(
                    ThreadIndicator::ShellcodeCallstackCandidate,
                    first,
                ));
            }
        }

        if self.violates_call_integrity(ctx) {
            findings.push(Finding::new(
                ThreadIndicator::CallIntegrityViolation,
                ctx.last_ret,
            ));
        }

        if ctx.stack_frames_count == 0
            || !ctx.is_ret_in_frame
            || !ctx.chain_consistent
            || !ctx.stack_ptr_plausible
        {
            findings.push(Finding::new(ThreadIndicator::CorruptCallstack, 0));
        }

        findings
    }

    fn is_suspicious_start(&self, start: u64) -> bool {
        start != 0 && !self.in_named_module(start) && !self.is_valid_thunk(start)
    }

    /// An exact export hit, such as a trampoline registered by the loader.
    fn is_valid_thunk(&self, addr: u64) -> bool {
        self.collab
            .exports
            .and_then(|e| e.lookup(addr))
            .map(|hit| hit.offset == 0)
            .unwrap_or(false)
    }

    fn violates_call_integrity(&self, ctx: &CtxDetails) -> bool {
        if ctx.last_ret == 0 || ctx.is_ret_as_syscall {
            return false;
        }
        match self.walker().read_call_site(ctx.last_ret) {
            Some(bytes) => !self.collab.decoder.is_valid_call_site(&bytes, ctx.is64bit),
            None => false,
        }
    }

    /// Drops return-trail findings that only JIT-compiled code would explain.
    fn filter_managed(&self, ctx: &CtxDetails, findings: Vec<Finding>) -> Vec<Finding> {
        if !self.options.filter_managed || !(ctx.is_managed || self.options.is_managed_process) {
            return findings;
        }
        findings
            .into_iter()
            .filter(|f| {
                let jit_shaped = matches!(
                    f.indicator,
                    ThreadIndicator::SuspiciousReturnAddress
                        | ThreadIndicator::ShellcodeCallstackCandidate
                        | ThreadIndicator::CallIntegrityViolation
                ) && !self.in_named_module(f.address);
                if jit_shaped {
                    debug!(tid = self.info.tid, indicator = %f.indicator, "dropped on managed stack");
                }
                !jit_shaped
            })
            .collect()
    }

    fn apply_findings(&self, report: &mut ThreadScanReport, findings: &[Finding]) {
        for finding in findings {
            debug!(
                tid = self.info.tid,
                indicator = %finding.indicator,
                "indicator at {:#x}",
                finding.address
            );
            report.indicators.insert(finding.indicator);
        }
        report.susp_addr = findings
            .iter()
            .map(|f| f.address)
            .find(|&addr| addr != 0)
            .unwrap_or(0);

        if report.indicators.is_empty() {
            report.indicators.insert(ThreadIndicator::None);
            report.base.status = ScanStatus::NotSuspicious;
        } else {
            report.base.status = ScanStatus::Suspicious;
        }
    }

    fn enrich(&self, report: &mut ThreadScanReport) {
        let addr = report.susp_addr;
        if addr == 0 {
            return;
        }
        let region = match self.collab.process.query_region(addr) {
            Ok(region) if region.contains(addr) => region,
            Ok(_) => return,
            Err(err) => {
                debug!(tid = self.info.tid, %err, "no region for suspicious address");
                return;
            }
        };

        report.base.module = if region.allocation_base != 0 {
            region.allocation_base
        } else {
            region.base_address
        };
        report.base.module_size = region.region_size;
        report.protection = region.protect;
        report.is_code = is_executable(region.protect);

        if self.in_named_module(addr) {
            return;
        }
        if !region.is_committed() || !is_readable(region.protect) {
            return;
        }
        let stats = self.collab.stats.summarize(
            self.collab.process,
            region.base_address,
            region.region_size as usize,
        );
        if stats.is_filled() {
            report.stats = Some(stats);
        }
    }

    fn log_resolved_names(&self, ctx: &CtxDetails, susp_addr: u64) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        for (label, addr) in [("ip", ctx.rip), ("last_ret", ctx.last_ret), ("susp", susp_addr)] {
            if addr == 0 {
                continue;
            }
            let name = resolve_low_level_func_name(
                addr,
                self.collab.exports,
                self.collab.symbols,
                self.options.max_symbol_displacement,
            );
            debug!(tid = self.info.tid, "{}: {}", label, format_resolved(addr, name.as_deref()));
        }
    }

    fn in_named_module(&self, addr: u64) -> bool {
        self.collab.modules.is_in_named_module(addr)
    }
}

/// Scans every thread in parallel. Reports come back in the order of `threads`.
pub fn scan_threads(
    collab: Collaborators<'_>,
    threads: &[ThreadInfo],
    options: ScanOptions,
) -> Result<Vec<ThreadScanReport>> {
    options.validate()?;
    Ok(threads
        .par_iter()
        .map(|info| {
            ThreadScanner {
                collab,
                info,
                options,
            }
            .scan_remote()
        })
        .collect())
}
