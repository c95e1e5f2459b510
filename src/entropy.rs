use serde::Serialize;

use crate::memory::RemoteProcess;

pub const DEFAULT_MAX_READ: usize = 0x10000;
const MIN_SAMPLE: usize = 64;

/// Statistical summary of a memory area.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AreaStats {
    pub area_start: u64,
    pub area_size: usize,
    pub entropy: f64,
    pub unique_bytes: usize,
    pub most_frequent_byte: u8,
    pub most_frequent_ratio: f64,
}

impl AreaStats {
    pub fn is_filled(&self) -> bool {
        self.area_size > 0
    }

    pub fn from_bytes(area_start: u64, data: &[u8]) -> Self {
        if data.is_empty() {
            return Self {
                area_start,
                ..Self::default()
            };
        }

        let counts = byte_histogram(data);
        let (most_frequent_byte, top) = counts
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| **c)
            .map(|(b, c)| (b as u8, *c))
            .unwrap_or((0, 0));

        Self {
            area_start,
            area_size: data.len(),
            entropy: entropy_from_counts(&counts, data.len()),
            unique_bytes: counts.iter().filter(|c| **c != 0).count(),
            most_frequent_byte,
            most_frequent_ratio: top as f64 / data.len() as f64,
        }
    }
}

/// Produces an `AreaStats` for `length` bytes at `address` of a remote process.
pub trait StatsCollector: Sync {
    fn summarize(&self, process: &dyn RemoteProcess, address: u64, length: usize) -> AreaStats;
}

#[derive(Debug, Clone, Copy)]
pub struct EntropyStatsCollector {
    pub max_read: usize,
}

impl Default for EntropyStatsCollector {
    fn default() -> Self {
        Self {
            max_read: DEFAULT_MAX_READ,
        }
    }
}

impl StatsCollector for EntropyStatsCollector {
    fn summarize(&self, process: &dyn RemoteProcess, address: u64, length: usize) -> AreaStats {
        let read_size = length.min(self.max_read);
        if address == 0 || read_size == 0 {
            return AreaStats::default();
        }

        let mut buf = vec![0u8; read_size];
        let read_len = match process.read_memory(address, &mut buf) {
            Ok(n) => n,
            Err(_) => return AreaStats::default(),
        };
        if read_len < MIN_SAMPLE.min(read_size) {
            return AreaStats::default();
        }

        AreaStats::from_bytes(address, &buf[..read_len])
    }
}

fn byte_histogram(data: &[u8]) -> [u32; 256] {
    let mut counts = [0u32; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    counts
}

fn entropy_from_counts(counts: &[u32; 256], total: usize) -> f64 {
    let len = total as f64;
    let mut entropy = 0.0f64;
    for &count in counts.iter() {
        if count == 0 {
            continue;
        }
        let p = count as f64 / len;
        entropy -= p * p.log2();
    }
    entropy
}
