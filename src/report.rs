//! Thread scan reports and their JSON form.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::entropy::AreaStats;
use crate::error::Result;
use crate::indicators::{translate_thread_state, translate_wait_reason, ThreadIndicator};
use crate::nt::{THREAD_STATE_UNKNOWN, THREAD_STATE_WAITING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStatus {
    Error,
    NotSuspicious,
    Suspicious,
}

impl ScanStatus {
    pub const fn as_code(self) -> i32 {
        match self {
            ScanStatus::Error => -1,
            ScanStatus::NotSuspicious => 0,
            ScanStatus::Suspicious => 1,
        }
    }
}

/// Something a feature scanner produced that can be emitted as JSON.
pub trait Reportable {
    fn json_key(&self) -> &'static str;

    fn fields_to_json(&self, out: &mut Map<String, Value>);

    fn to_json(&self) -> Value {
        let mut fields = Map::new();
        self.fields_to_json(&mut fields);
        let mut root = Map::new();
        root.insert(self.json_key().to_string(), Value::Object(fields));
        Value::Object(root)
    }

    fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_json())?)
    }
}

/// Fields every scan report shares: status and the memory area the finding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReportBase {
    pub status: ScanStatus,
    pub module: u64,
    pub module_size: u64,
}

impl ScanReportBase {
    pub fn new() -> Self {
        Self {
            status: ScanStatus::NotSuspicious,
            module: 0,
            module_size: 0,
        }
    }

    pub fn has_region(&self) -> bool {
        self.module != 0 && self.module_size != 0
    }

    pub fn fields_to_json(&self, out: &mut Map<String, Value>) {
        out.insert("status".into(), json!(self.status.as_code()));
        if self.module != 0 {
            out.insert("module".into(), hex(self.module));
        }
        if self.module_size != 0 {
            out.insert("module_size".into(), hex(self.module_size));
        }
    }
}

impl Default for ScanReportBase {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadScanReport {
    pub base: ScanReportBase,
    pub tid: u32,
    pub indicators: BTreeSet<ThreadIndicator>,
    pub susp_addr: u64,
    pub protection: u32,
    pub stack_ptr: u64,
    pub frames_count: usize,
    pub thread_state: u32,
    pub thread_wait_reason: u32,
    pub thread_wait_time: u32,
    pub stats: Option<AreaStats>,
    pub is_code: bool,
}

impl ThreadScanReport {
    pub fn new(tid: u32) -> Self {
        Self {
            base: ScanReportBase::new(),
            tid,
            indicators: BTreeSet::new(),
            susp_addr: 0,
            protection: 0,
            stack_ptr: 0,
            frames_count: 0,
            thread_state: THREAD_STATE_UNKNOWN,
            thread_wait_reason: 0,
            thread_wait_time: 0,
            stats: None,
            is_code: false,
        }
    }

    pub fn status(&self) -> ScanStatus {
        self.base.status
    }

    pub fn is_suspicious(&self) -> bool {
        self.base.status == ScanStatus::Suspicious
    }

    pub fn has_indicator(&self, indicator: ThreadIndicator) -> bool {
        self.indicators.contains(&indicator)
    }
}

impl Reportable for ThreadScanReport {
    fn json_key(&self) -> &'static str {
        "thread_scan"
    }

    fn fields_to_json(&self, out: &mut Map<String, Value>) {
        self.base.fields_to_json(out);
        out.insert("thread_id".into(), json!(self.tid));

        let indicators: Vec<Value> = self
            .indicators
            .iter()
            .map(|i| Value::String(i.as_str().to_string()))
            .collect();
        out.insert("indicators".into(), Value::Array(indicators));

        if self.stack_ptr != 0 {
            out.insert("stack_ptr".into(), hex(self.stack_ptr));
        }
        if self.frames_count != 0 {
            out.insert("frames_count".into(), json!(self.frames_count));
        }
        if self.thread_state != THREAD_STATE_UNKNOWN {
            out.insert(
                "thread_state".into(),
                Value::String(translate_thread_state(self.thread_state)),
            );
            if self.thread_state == THREAD_STATE_WAITING {
                out.insert(
                    "thread_wait_reason".into(),
                    Value::String(translate_wait_reason(self.thread_wait_reason)),
                );
            }
        }
        if self.susp_addr != 0 {
            let key = if self.base.has_region() {
                "susp_addr"
            } else {
                "susp_return_addr"
            };
            out.insert(key.into(), hex(self.susp_addr));
        }
        if self.base.module != 0 {
            out.insert("protection".into(), hex(self.protection as u64));
            if let Some(stats) = self.stats.as_ref().filter(|s| s.is_filled()) {
                out.insert("entropy".into(), area_stats_to_json(stats));
            }
        }
    }
}

fn area_stats_to_json(stats: &AreaStats) -> Value {
    json!({
        "area_start": format!("{:x}", stats.area_start),
        "area_size": format!("{:x}", stats.area_size),
        "entropy": stats.entropy,
        "unique_bytes": stats.unique_bytes,
        "most_frequent_byte": format!("{:x}", stats.most_frequent_byte),
        "most_frequent_ratio": stats.most_frequent_ratio,
    })
}

fn hex(value: u64) -> Value {
    Value::String(format!("{:x}", value))
}
