use serde::Serialize;

/// Runtime modules whose presence on a call trail means JIT-generated frames are expected.
pub const MANAGED_RUNTIME_MODULES: [&str; 7] = [
    "clr.dll",
    "coreclr.dll",
    "clrjit.dll",
    "mscorwks.dll",
    "mscoreei.dll",
    "mscorlib.ni.dll",
    "system.private.corelib.dll",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub base_address: u64,
    pub size: u64,
    pub base_name: Option<String>,
    pub full_name: Option<String>,
}

impl ModuleInfo {
    pub fn new(base_address: u64, size: u64, base_name: &str) -> Self {
        Self {
            base_address,
            size,
            base_name: Some(base_name.to_string()),
            full_name: None,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.base_address.saturating_add(self.size)
    }

    pub fn name(&self) -> Option<&str> {
        self.base_name
            .as_deref()
            .or(self.full_name.as_deref())
            .map(extract_basename)
    }

    pub fn is_managed_runtime(&self) -> bool {
        match self.name() {
            Some(name) => is_managed_runtime_name(name),
            None => false,
        }
    }
}

/// Answers which loaded module, if any, owns an address.
pub trait ModuleMap: Sync {
    fn find_owning_module(&self, address: u64) -> Option<&ModuleInfo>;

    /// Named modules only: an image without a name does not make an address legitimate.
    fn is_in_named_module(&self, address: u64) -> bool {
        self.find_owning_module(address)
            .map(|m| m.name().is_some())
            .unwrap_or(false)
    }
}

/// Modules sorted by base address.
#[derive(Debug, Clone, Default)]
pub struct ModuleList {
    modules: Vec<ModuleInfo>,
}

impl ModuleList {
    pub fn new(mut modules: Vec<ModuleInfo>) -> Self {
        modules.retain(|m| m.size != 0);
        modules.sort_by_key(|m| m.base_address);
        Self { modules }
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn has_managed_runtime(&self) -> bool {
        self.modules.iter().any(ModuleInfo::is_managed_runtime)
    }
}

impl ModuleMap for ModuleList {
    fn find_owning_module(&self, address: u64) -> Option<&ModuleInfo> {
        let idx = self
            .modules
            .partition_point(|m| m.base_address <= address);
        if idx == 0 {
            return None;
        }
        let candidate = &self.modules[idx - 1];
        if candidate.contains(address) {
            Some(candidate)
        } else {
            None
        }
    }
}

pub fn is_managed_runtime_name(name: &str) -> bool {
    let base = extract_basename(name);
    MANAGED_RUNTIME_MODULES
        .iter()
        .any(|m| m.eq_ignore_ascii_case(base))
}

fn extract_basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}
