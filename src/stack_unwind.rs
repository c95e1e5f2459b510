//! Stack walk over a remote thread's stack.
//!
//! Three sources feed the frame list: the return slot at the stack pointer,
//! a bounded scan of stack words that look like return addresses, and the
//! saved frame-pointer chain. Reads may race with the running target, so a
//! failed read truncates the walk and nothing is synthesized in its place.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::callsite::{CallSiteDecoder, CALL_SITE_WINDOW};
use crate::config::ScanOptions;
use crate::context::{is_user_address, CtxDetails, FrameSource, StackBounds, StackFrame};
use crate::memory::{is_readable, read_exact, read_ptr, RegionCache, RemoteProcess};
use crate::modules::ModuleMap;
use crate::symbols::{resolve_low_level_func_name, ExportMap, SymbolResolver};

pub struct StackWalker<'a> {
    process: &'a dyn RemoteProcess,
    modules: &'a dyn ModuleMap,
    exports: Option<&'a dyn ExportMap>,
    symbols: Option<&'a dyn SymbolResolver>,
    decoder: &'a dyn CallSiteDecoder,
    options: ScanOptions,
}

struct ChainWalk {
    links: Vec<(u64, u64)>,
    consistent: bool,
}

impl<'a> StackWalker<'a> {
    pub fn new(
        process: &'a dyn RemoteProcess,
        modules: &'a dyn ModuleMap,
        exports: Option<&'a dyn ExportMap>,
        symbols: Option<&'a dyn SymbolResolver>,
        decoder: &'a dyn CallSiteDecoder,
        options: ScanOptions,
    ) -> Self {
        Self {
            process,
            modules,
            exports,
            symbols,
            decoder,
            options,
        }
    }

    /// Walks the stack of `tid` and fills the walk-derived fields of `ctx`.
    /// Returns the number of frames found.
    pub fn fill_call_stack_info(&self, tid: u32, ctx: &mut CtxDetails) -> usize {
        ctx.is_managed = self.is_managed_address(ctx.rip);

        let bounds = match self.resolve_stack_bounds(tid, ctx) {
            Some(b) => b,
            None => {
                warn!(tid, "stack pointer {:#x} outside any known stack", ctx.rsp);
                ctx.stack_ptr_plausible = false;
                return 0;
            }
        };
        if !ctx.stack_ptr_plausible || !bounds.contains(ctx.rsp) || ctx.rsp % ctx.ptr_size() != 0 {
            warn!(
                tid,
                "implausible stack pointer {:#x} for stack {:#x}..{:#x}, context layout may not match thread bitness",
                ctx.rsp,
                bounds.low,
                bounds.high
            );
            ctx.stack_ptr_plausible = false;
            return 0;
        }

        ctx.ret_on_stack = match read_ptr(self.process, ctx.rsp, ctx.is64bit) {
            Ok(v) => v,
            Err(err) => {
                trace!(tid, %err, "return slot unreadable");
                return 0;
            }
        };

        let mut cache = RegionCache::default();
        let mut frames: BTreeMap<u64, StackFrame> = BTreeMap::new();

        let slot_shaped = self.is_return_shaped(&mut cache, ctx.ret_on_stack, ctx.is64bit);
        if slot_shaped {
            let ret = ctx.ret_on_stack;
            frames.insert(ctx.rsp, self.make_frame(ctx.rsp, ret, FrameSource::ReturnSlot));
            self.note_candidate(ctx, ret);
        }

        self.scan_stack_words(ctx, bounds, &mut cache, &mut frames);

        let chain = self.walk_frame_pointer_chain(ctx, bounds, &mut cache);
        ctx.chain_consistent = chain.consistent;
        let in_frame = slot_shaped && self.slot_fits_caller_frame(ctx, &chain);
        ctx.is_ret_in_frame = in_frame;
        for (slot, ret) in chain.links {
            self.note_candidate(ctx, ret);
            frames
                .entry(slot)
                .or_insert_with(|| self.make_frame(slot, ret, FrameSource::FramePointer));
        }

        ctx.frames = frames.into_values().take(self.options.max_frames).collect();
        ctx.stack_frames_count = ctx.frames.len();

        ctx.last_ret = if slot_shaped {
            ctx.ret_on_stack
        } else {
            ctx.frames.first().map(|f| f.return_address).unwrap_or(0)
        };
        ctx.is_ret_as_syscall = ctx.last_ret != 0 && self.is_after_syscall(ctx.last_ret, ctx.is64bit);
        ctx.is_managed = ctx.is_managed || ctx.frames.iter().any(|f| self.is_managed_address(f.return_address));

        ctx.stack_frames_count
    }

    /// Reads the bytes preceding `ret`, the window a call instruction would occupy.
    pub fn read_call_site(&self, ret: u64) -> Option<[u8; CALL_SITE_WINDOW]> {
        let start = ret.checked_sub(CALL_SITE_WINDOW as u64)?;
        let mut buf = [0u8; CALL_SITE_WINDOW];
        read_exact(self.process, start, &mut buf).ok()?;
        Some(buf)
    }

    fn resolve_stack_bounds(&self, tid: u32, ctx: &CtxDetails) -> Option<StackBounds> {
        if let Some(bounds) = self.process.stack_bounds(tid, ctx.is64bit) {
            if bounds.is_valid() {
                return Some(bounds);
            }
        }
        let region = self.process.query_region(ctx.rsp).ok()?;
        if !region.contains(ctx.rsp) || !region.is_committed() || !is_readable(region.protect) {
            return None;
        }
        Some(StackBounds {
            low: region.base_address,
            high: region.end(),
        })
    }

    fn scan_stack_words(
        &self,
        ctx: &mut CtxDetails,
        bounds: StackBounds,
        cache: &mut RegionCache,
        frames: &mut BTreeMap<u64, StackFrame>,
    ) {
        let ptr = ctx.ptr_size();
        let start = ctx.rsp + ptr;
        let end = bounds
            .high
            .min(ctx.rsp.saturating_add(self.options.max_stack_scan_bytes as u64));
        let chunk_size = (self.options.stack_read_chunk as u64 / ptr).max(1) * ptr;

        let mut chunk_addr = start;
        while chunk_addr < end {
            let len = chunk_size.min(end - chunk_addr) as usize;
            let mut buf = vec![0u8; len];
            let read_len = match self.process.read_memory(chunk_addr, &mut buf) {
                Ok(n) => n,
                Err(err) => {
                    trace!(%err, "stack scan truncated at {:#x}", chunk_addr);
                    return;
                }
            };

            for (i, word) in buf[..read_len].chunks_exact(ptr as usize).enumerate() {
                if frames.len() >= self.options.max_frames {
                    return;
                }
                let value = if ctx.is64bit {
                    u64::from_le_bytes([
                        word[0], word[1], word[2], word[3], word[4], word[5], word[6], word[7],
                    ])
                } else {
                    u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as u64
                };
                if !self.is_return_shaped(cache, value, ctx.is64bit) {
                    continue;
                }
                if !self.has_call_before(value, ctx.is64bit) {
                    continue;
                }
                let slot = chunk_addr + (i as u64) * ptr;
                self.note_candidate(ctx, value);
                frames
                    .entry(slot)
                    .or_insert_with(|| self.make_frame(slot, value, FrameSource::StackScan));
            }

            if read_len < len {
                trace!("short stack read, scan stops at {:#x}", chunk_addr + read_len as u64);
                return;
            }
            chunk_addr += len as u64;
        }
    }

    /// The return slot must be backed by something other than its own shape:
    /// a call or syscall right before the address, or the same address in the
    /// frame-pointer chain. When a chain exists, the innermost saved frame
    /// must not lie below the stack pointer.
    fn slot_fits_caller_frame(&self, ctx: &CtxDetails, chain: &ChainWalk) -> bool {
        let ret = ctx.ret_on_stack;
        if ret == 0 {
            return false;
        }
        if !chain.links.is_empty() && ctx.rbp < ctx.rsp {
            trace!("frame pointer {:#x} below stack pointer {:#x}", ctx.rbp, ctx.rsp);
            return false;
        }
        chain.links.iter().any(|&(_, r)| r == ret)
            || self.has_call_before(ret, ctx.is64bit)
            || self.is_after_syscall(ret, ctx.is64bit)
    }

    fn walk_frame_pointer_chain(
        &self,
        ctx: &CtxDetails,
        bounds: StackBounds,
        cache: &mut RegionCache,
    ) -> ChainWalk {
        let ptr = ctx.ptr_size();
        let mut links = Vec::new();
        let mut fp = ctx.rbp;

        if !bounds.contains(fp) {
            return ChainWalk {
                links,
                consistent: true,
            };
        }

        while links.len() < self.options.max_frames {
            let saved_fp = match read_ptr(self.process, fp, ctx.is64bit) {
                Ok(v) => v,
                Err(_) => break,
            };
            let ret = match read_ptr(self.process, fp + ptr, ctx.is64bit) {
                Ok(v) => v,
                Err(_) => break,
            };
            if ret == 0 || !self.is_return_shaped(cache, ret, ctx.is64bit) {
                break;
            }
            links.push((fp + ptr, ret));

            if saved_fp == 0 || !bounds.contains(saved_fp) {
                break;
            }
            if saved_fp <= fp {
                trace!("frame chain does not ascend: {:#x} -> {:#x}", fp, saved_fp);
                return ChainWalk {
                    links,
                    consistent: false,
                };
            }
            fp = saved_fp;
        }

        ChainWalk {
            links,
            consistent: true,
        }
    }

    /// Points into a loaded image or into committed executable memory.
    fn is_return_shaped(&self, cache: &mut RegionCache, value: u64, is64bit: bool) -> bool {
        if !is_user_address(value, is64bit) {
            return false;
        }
        if self.modules.find_owning_module(value).is_some() {
            return true;
        }
        cache.is_executable_address(self.process, value)
    }

    fn has_call_before(&self, ret: u64, is64bit: bool) -> bool {
        match self.read_call_site(ret) {
            Some(bytes) => self.decoder.is_valid_call_site(&bytes, is64bit),
            None => false,
        }
    }

    fn is_after_syscall(&self, ret: u64, is64bit: bool) -> bool {
        match self.read_call_site(ret) {
            Some(bytes) => self.decoder.is_syscall_return_site(&bytes, is64bit),
            None => false,
        }
    }

    fn note_candidate(&self, ctx: &mut CtxDetails, ret: u64) {
        if !self.modules.is_in_named_module(ret) {
            ctx.shc_candidates.insert(ret);
        }
    }

    fn is_managed_address(&self, addr: u64) -> bool {
        self.modules
            .find_owning_module(addr)
            .map(|m| m.is_managed_runtime())
            .unwrap_or(false)
    }

    fn make_frame(&self, stack_address: u64, return_address: u64, source: FrameSource) -> StackFrame {
        let module_name = self
            .modules
            .find_owning_module(return_address)
            .and_then(|m| m.name())
            .map(str::to_string);
        let has_symbol = resolve_low_level_func_name(
            return_address,
            self.exports,
            self.symbols,
            self.options.max_symbol_displacement,
        )
        .is_some();

        StackFrame {
            stack_address,
            return_address,
            module_name,
            has_symbol,
            source,
        }
    }
}
