//! Call-site validation for return addresses.
//!
//! A genuine return address is the address right after a `call`. The bytes that
//! precede it must decode as a call instruction of exactly that length.

use iced_x86::{Decoder, DecoderOptions, Mnemonic};

/// Longest x86/x64 call encoding we try to match (`call [rsp+disp32]` with REX).
pub const CALL_SITE_WINDOW: usize = 7;
const MIN_CALL_LEN: usize = 2;

const WOW64_TRANSITION_CALL: [u8; 7] = [0x64, 0xFF, 0x15, 0xC0, 0x00, 0x00, 0x00];

pub trait CallSiteDecoder: Sync {
    /// `preceding` holds the bytes immediately before the return address.
    fn is_valid_call_site(&self, preceding: &[u8], is64bit: bool) -> bool;

    /// Return sites of system-call trampolines, which legitimately follow no `call`.
    fn is_syscall_return_site(&self, preceding: &[u8], is64bit: bool) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct X86CallSiteDecoder;

impl X86CallSiteDecoder {
    fn decode_tail(preceding: &[u8], len: usize, is64bit: bool) -> Option<iced_x86::Instruction> {
        if len > preceding.len() {
            return None;
        }
        let tail = &preceding[preceding.len() - len..];
        let bitness = if is64bit { 64 } else { 32 };
        let mut decoder = Decoder::new(bitness, tail, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() || instruction.len() != len {
            return None;
        }
        Some(instruction)
    }
}

impl CallSiteDecoder for X86CallSiteDecoder {
    fn is_valid_call_site(&self, preceding: &[u8], is64bit: bool) -> bool {
        let max_len = preceding.len().min(CALL_SITE_WINDOW);
        (MIN_CALL_LEN..=max_len).any(|len| {
            Self::decode_tail(preceding, len, is64bit)
                .map(|i| i.mnemonic() == Mnemonic::Call)
                .unwrap_or(false)
        })
    }

    fn is_syscall_return_site(&self, preceding: &[u8], is64bit: bool) -> bool {
        if !is64bit && preceding.ends_with(&WOW64_TRANSITION_CALL) {
            return true;
        }
        if !is64bit && preceding.ends_with(&[0xFF, 0xD2]) {
            // call edx, into Wow64Transition
            return true;
        }
        match Self::decode_tail(preceding, MIN_CALL_LEN, is64bit) {
            Some(i) => match i.mnemonic() {
                Mnemonic::Syscall | Mnemonic::Sysenter => true,
                Mnemonic::Int => i.immediate8() == 0x2E,
                _ => false,
            },
            None => false,
        }
    }
}
