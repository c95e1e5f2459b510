//! Export-directory parsing of images mapped in a remote process.

use tracing::trace;

use crate::error::{Result, ScanError};
use crate::memory::{read_exact, RemoteProcess};
use crate::modules::ModuleInfo;
use crate::symbols::{ExportEntry, ExportTable};

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
pub const IMAGE_PE_SIGNATURE: u32 = 0x4550; // "PE\0\0"
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

const E_LFANEW_OFFSET: u64 = 0x3C;
const OPTIONAL_HEADER_OFFSET: u64 = 0x18;
const DATA_DIRECTORY_OFFSET_32: u64 = 0x60;
const DATA_DIRECTORY_OFFSET_64: u64 = 0x70;
const EXPORT_DIRECTORY_SIZE: usize = 40;
const MAX_EXPORT_DIRECTORY: u32 = 16 * 1024 * 1024;
const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

fn read_u16(process: &dyn RemoteProcess, addr: u64) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(process, addr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(process: &dyn RemoteProcess, addr: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(process, addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn le_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn export_data_directory(process: &dyn RemoteProcess, base: u64) -> Result<DataDirectory> {
    if read_u16(process, base)? != IMAGE_DOS_SIGNATURE {
        return Err(ScanError::InvalidAddress(base));
    }
    let e_lfanew = read_u32(process, base + E_LFANEW_OFFSET)? as u64;
    let nt = base + e_lfanew;
    if read_u32(process, nt)? != IMAGE_PE_SIGNATURE {
        return Err(ScanError::InvalidAddress(nt));
    }

    let optional = nt + OPTIONAL_HEADER_OFFSET;
    let dir_offset = match read_u16(process, optional)? {
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => DATA_DIRECTORY_OFFSET_32,
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => DATA_DIRECTORY_OFFSET_64,
        _ => return Err(ScanError::InvalidAddress(optional)),
    };

    Ok(DataDirectory {
        rva: read_u32(process, optional + dir_offset)?,
        size: read_u32(process, optional + dir_offset + 4)?,
    })
}

/// Lists the named, non-forwarded exports of `module`.
pub fn read_export_table(process: &dyn RemoteProcess, module: &ModuleInfo) -> Result<Vec<ExportEntry>> {
    let base = module.base_address;
    let dir = export_data_directory(process, base)?;
    if dir.rva == 0 || (dir.size as usize) < EXPORT_DIRECTORY_SIZE || dir.size > MAX_EXPORT_DIRECTORY {
        return Ok(Vec::new());
    }

    let mut data = vec![0u8; dir.size as usize];
    read_exact(process, base + dir.rva as u64, &mut data)?;
    let module_name = module.name().unwrap_or("<unknown>").to_ascii_lowercase();

    Ok(parse_export_directory(&data, dir.rva, base, module.size, &module_name))
}

/// Collects the exports of every module. Images whose headers cannot be read are skipped.
pub fn build_export_table(process: &dyn RemoteProcess, modules: &[ModuleInfo]) -> ExportTable {
    let mut table = ExportTable::new();
    for module in modules {
        match read_export_table(process, module) {
            Ok(entries) => table.extend(entries),
            Err(err) => trace!(module = module.name().unwrap_or("?"), %err, "exports unavailable"),
        }
    }
    table
}

/// `data` is the export directory read from `dir_rva`. RVAs pointing outside it are skipped.
fn parse_export_directory(
    data: &[u8],
    dir_rva: u32,
    base: u64,
    module_size: u64,
    module_name: &str,
) -> Vec<ExportEntry> {
    let mut entries = Vec::new();
    let dir_end = dir_rva as usize + data.len();
    let local = |rva: u32| -> Option<usize> {
        let rva = rva as usize;
        if rva < dir_rva as usize || rva >= dir_end {
            return None;
        }
        Some(rva - dir_rva as usize)
    };

    let (Some(num_functions), Some(num_names), Some(functions_rva), Some(names_rva), Some(ordinals_rva)) = (
        le_u32(data, 20),
        le_u32(data, 24),
        le_u32(data, 28),
        le_u32(data, 32),
        le_u32(data, 36),
    ) else {
        return entries;
    };

    let (Some(functions), Some(names), Some(ordinals)) =
        (local(functions_rva), local(names_rva), local(ordinals_rva))
    else {
        return entries;
    };

    for i in 0..num_names as usize {
        let Some(name_rva) = le_u32(data, names + i * 4) else {
            break;
        };
        let Some(ordinal) = le_u16(data, ordinals + i * 2) else {
            break;
        };
        if ordinal as u32 >= num_functions {
            continue;
        }
        let Some(func_rva) = le_u32(data, functions + ordinal as usize * 4) else {
            continue;
        };
        if func_rva == 0 || local(func_rva).is_some() || func_rva as u64 >= module_size {
            continue;
        }
        let Some(name_off) = local(name_rva) else {
            continue;
        };
        let raw = &data[name_off..data.len().min(name_off + MAX_NAME_LEN)];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        if len == 0 {
            continue;
        }
        entries.push(ExportEntry {
            address: base + func_rva as u64,
            module: module_name.to_string(),
            name: String::from_utf8_lossy(&raw[..len]).into_owned(),
            module_base: base,
            module_end: base + module_size,
        });
    }

    entries
}
