//! Best-effort address-to-name resolution. Presentation only, never used to classify.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportHit {
    pub module: String,
    pub symbol: String,
    pub offset: u64,
}

impl ExportHit {
    pub fn display_name(&self) -> String {
        if self.offset == 0 {
            format!("{}!{}", self.module, self.symbol)
        } else {
            format!("{}!{}+{:#x}", self.module, self.symbol, self.offset)
        }
    }
}

/// Exports of the loaded modules, keyed by virtual address.
pub trait ExportMap: Sync {
    /// Nearest export at or below `address` inside the same module.
    fn lookup(&self, address: u64) -> Option<ExportHit>;
}

/// Debug-symbol lookup, when symbols for the target are loaded.
pub trait SymbolResolver: Sync {
    fn lookup(&self, address: u64) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportEntry {
    pub address: u64,
    pub module: String,
    pub name: String,
    pub module_base: u64,
    pub module_end: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    entries: Vec<ExportEntry>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ExportEntry>) {
        self.entries.extend(entries);
        self.entries.sort_by_key(|e| e.address);
        self.entries.dedup_by_key(|e| e.address);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ExportMap for ExportTable {
    fn lookup(&self, address: u64) -> Option<ExportHit> {
        let idx = self.entries.partition_point(|e| e.address <= address);
        if idx == 0 {
            return None;
        }
        let entry = &self.entries[idx - 1];
        if address < entry.module_base || address >= entry.module_end {
            return None;
        }
        Some(ExportHit {
            module: entry.module.clone(),
            symbol: entry.name.clone(),
            offset: address - entry.address,
        })
    }
}

/// Resolves `addr` to a function name. Export hits further than `max_disp` bytes
/// from their export are discarded.
pub fn resolve_low_level_func_name(
    addr: u64,
    exports: Option<&dyn ExportMap>,
    symbols: Option<&dyn SymbolResolver>,
    max_disp: u64,
) -> Option<String> {
    if addr == 0 {
        return None;
    }
    let dbg_symbol = symbols.and_then(|s| s.lookup(addr)).filter(|s| !s.is_empty());
    let manual_symbol = exports
        .and_then(|e| e.lookup(addr))
        .filter(|hit| hit.offset <= max_disp)
        .map(|hit| hit.display_name());

    choose_preferred_function_name(dbg_symbol, manual_symbol)
}

/// The debug symbol wins whenever there is one; the export walk is the fallback.
pub fn choose_preferred_function_name(
    dbg_symbol: Option<String>,
    manual_symbol: Option<String>,
) -> Option<String> {
    dbg_symbol.or(manual_symbol)
}

pub fn format_resolved(addr: u64, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{:#x} ({})", addr, name),
        None => format!("{:#x}", addr),
    }
}
