use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, ScanError};

/// Knobs for a single thread scan. Shared read-only across a scan pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScanOptions {
    pub max_frames: usize,
    pub max_stack_scan_bytes: usize,
    pub stack_read_chunk: usize,
    pub shellcode_candidate_threshold: usize,
    pub max_symbol_displacement: u64,
    pub entropy_max_read: usize,
    pub filter_by_state: bool,
    pub filter_managed: bool,
    pub is_reflection: bool,
    pub is_managed_process: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_frames: 64,
            max_stack_scan_bytes: 0x4000,
            stack_read_chunk: 0x1000,
            shellcode_candidate_threshold: 1,
            max_symbol_displacement: 25,
            entropy_max_read: 0x10000,
            filter_by_state: true,
            filter_managed: true,
            is_reflection: false,
            is_managed_process: false,
        }
    }
}

impl ScanOptions {
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(v) = parse_usize_key("THREAD_SCAN_MAX_FRAMES") {
            options.max_frames = v;
        }
        if let Some(v) = parse_usize_key("THREAD_SCAN_STACK_BYTES") {
            options.max_stack_scan_bytes = v;
        }
        if let Some(v) = parse_usize_key("THREAD_SCAN_SHC_THRESHOLD") {
            options.shellcode_candidate_threshold = v;
        }
        if check_env_flag("THREAD_SCAN_ALL_STATES", false) {
            options.filter_by_state = false;
        }
        if check_env_flag("THREAD_SCAN_NO_DOTNET_FILTER", false) {
            options.filter_managed = false;
        }
        options
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frames == 0 {
            return Err(ScanError::InvalidOptions("max_frames must be non-zero"));
        }
        if self.max_stack_scan_bytes < 8 {
            return Err(ScanError::InvalidOptions("max_stack_scan_bytes too small"));
        }
        if self.stack_read_chunk < 8 {
            return Err(ScanError::InvalidOptions("stack_read_chunk too small"));
        }
        if self.shellcode_candidate_threshold == 0 {
            return Err(ScanError::InvalidOptions(
                "shellcode_candidate_threshold must be non-zero",
            ));
        }
        Ok(())
    }
}

pub fn is_verbose_debug() -> bool {
    check_env_flag("VERBOSE_DEBUG", false) || check_env_flag("TRACE_VERBOSE", false)
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the verbose flags.
pub fn init_tracing() {
    let fallback = if is_verbose_debug() { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn get_env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn check_env_flag(key: &str, default_if_unset: bool) -> bool {
    match get_env_var(key) {
        Some(val) => {
            let v = val.to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        }
        None => default_if_unset,
    }
}

fn parse_usize_key(key: &str) -> Option<usize> {
    let raw = get_env_var(key)?;
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return usize::from_str_radix(hex, 16).ok();
    }
    raw.parse::<usize>().ok()
}
