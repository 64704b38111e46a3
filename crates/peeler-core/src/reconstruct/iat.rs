//! Import directory serialization.
//!
//! Resolved thunks are grouped into descriptors: a descriptor covers a run of
//! consecutive IAT slots resolving into the same module. Its `FirstThunk` is
//! the original slot run, so code keeps calling through the addresses it was
//! compiled against. The new section holds, in order: the descriptor array,
//! the lookup tables, the hint/name entries and the module names.
//!
//! Slots that could not be resolved keep their OEP-time value. They are listed
//! after the directory data, behind [`UNRESOLVED_TAG`]:
//!
//! ```text
//! tag[8] count:u32 reserved:u32 { rva:u32 reserved:u32 value:u64 } * count
//! ```

use crate::exports::ResolvedSymbol;
use crate::imports::{Confidence, ImportTable, ResolutionMethod};
use crate::pe;
use crate::types::{Address, Architecture};

/// Opens the list of unresolved slots in the import section.
pub const UNRESOLVED_TAG: &[u8; 8] = b"PEELUNR\0";

const DESCRIPTOR_SIZE: usize = 20;
const UNRESOLVED_RECORD_SIZE: usize = 16;
const ORDINAL_FLAG_32: u64 = 0x8000_0000;
const ORDINAL_FLAG_64: u64 = 0x8000_0000_0000_0000;

/// One thunk as written to the import directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkRecord
{
    /// RVA of the IAT slot.
    pub rva: u32,
    /// The imported function.
    pub symbol: ResolvedSymbol,
    /// How it was resolved.
    pub method: ResolutionMethod,
    /// Trust carried over from resolution.
    pub confidence: Confidence,
}

/// One import descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportModule
{
    /// Module file name.
    pub name: String,
    /// RVA of the first IAT slot.
    pub first_thunk: u32,
    /// Thunks in slot order.
    pub thunks: Vec<ThunkRecord>,
}

/// A slot that stays as it was at the OEP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecoverableThunk
{
    /// RVA of the slot.
    pub rva: u32,
    /// Value left in the slot.
    pub value: Address,
    /// Why it could not be resolved.
    pub reason: String,
}

/// The import section and its directory metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSection
{
    /// Section bytes (not padded).
    pub bytes: Vec<u8>,
    /// RVA of the descriptor array.
    pub descriptors_rva: u32,
    /// Size of the descriptor array including the terminator.
    pub descriptors_size: u32,
    /// `(rva, size)` covering every IAT slot.
    pub iat: (u32, u32),
    /// RVA of the unresolved-slot list, when there is one.
    pub unresolved_rva: Option<u32>,
}

/// Group resolved thunks into descriptors and collect unresolved slots.
#[must_use]
pub fn group(imports: &ImportTable, base: Address, arch: Architecture) -> (Vec<ImportModule>, Vec<UnrecoverableThunk>)
{
    let pointer = arch.pointer_size() as u32;
    let mut modules: Vec<ImportModule> = Vec::new();
    let mut unrecoverable = Vec::new();
    let mut previous_unresolved = false;

    for entry in imports.iter() {
        let Some(rva) = entry.thunk.rva_from(base) else {
            continue;
        };
        let Some(symbol) = &entry.symbol else {
            unrecoverable.push(UnrecoverableThunk {
                rva,
                value: entry.original,
                reason: entry.reason.clone().unwrap_or_default(),
            });
            previous_unresolved = true;
            continue;
        };

        let record = ThunkRecord {
            rva,
            symbol: symbol.clone(),
            method: entry.method,
            confidence: entry.confidence,
        };
        let extends = !previous_unresolved
            && modules.last().is_some_and(|module| {
                module.name.eq_ignore_ascii_case(&symbol.module)
                    && module.thunks.last().is_some_and(|last| last.rva + pointer == rva)
            });
        previous_unresolved = false;
        match modules.last_mut() {
            Some(module) if extends => module.thunks.push(record),
            _ => modules.push(ImportModule {
                name: symbol.module.clone(),
                first_thunk: rva,
                thunks: vec![record],
            }),
        }
    }
    (modules, unrecoverable)
}

/// Serialize the import section placed at `section_rva`
///
/// Also writes each resolved slot in `image` with its lookup entry, which is
/// what an unbound IAT holds on disk. Without resolved thunks the descriptor
/// fields are zero and only the unresolved list is written. `None` when there
/// is nothing to record at all.
#[must_use]
pub fn build(
    modules: &[ImportModule],
    unrecoverable: &[UnrecoverableThunk],
    arch: Architecture,
    section_rva: u32,
    image: &mut [u8],
) -> Option<ImportSection>
{
    if modules.is_empty() && unrecoverable.is_empty() {
        return None;
    }
    let mut section = if modules.is_empty() {
        ImportSection {
            bytes: Vec::new(),
            descriptors_rva: 0,
            descriptors_size: 0,
            iat: (0, 0),
            unresolved_rva: None,
        }
    } else {
        directory(modules, arch, section_rva, image)
    };
    if !unrecoverable.is_empty() {
        let offset = append_unresolved(&mut section.bytes, unrecoverable);
        section.unresolved_rva = Some(section_rva + offset as u32);
    }
    Some(section)
}

fn directory(modules: &[ImportModule], arch: Architecture, section_rva: u32, image: &mut [u8]) -> ImportSection
{
    let pointer = arch.pointer_size() as usize;
    let ordinal_flag = match arch {
        Architecture::X86 => ORDINAL_FLAG_32,
        Architecture::X86_64 => ORDINAL_FLAG_64,
    };

    let descriptors_size = (modules.len() + 1) * DESCRIPTOR_SIZE;
    let lookup_size: usize = modules.iter().map(|m| (m.thunks.len() + 1) * pointer).sum();
    let lookup_start = pe::align_up(descriptors_size as u64, pointer as u64) as usize;
    let names_start = lookup_start + lookup_size;

    // Hint/name entries then module names, each 2-byte aligned.
    let mut strings: Vec<u8> = Vec::new();
    let mut name_offsets = Vec::new();
    for module in modules {
        let mut offsets = Vec::with_capacity(module.thunks.len());
        for thunk in &module.thunks {
            match &thunk.symbol.name {
                Some(name) => {
                    offsets.push(Some(names_start + strings.len()));
                    strings.extend_from_slice(&0u16.to_le_bytes());
                    strings.extend_from_slice(name.as_bytes());
                    strings.push(0);
                    if strings.len() % 2 == 1 {
                        strings.push(0);
                    }
                }
                None => offsets.push(None),
            }
        }
        name_offsets.push(offsets);
    }
    let mut module_names = Vec::with_capacity(modules.len());
    for module in modules {
        module_names.push(names_start + strings.len());
        strings.extend_from_slice(module.name.as_bytes());
        strings.push(0);
        if strings.len() % 2 == 1 {
            strings.push(0);
        }
    }

    let mut bytes = vec![0u8; names_start];
    bytes.extend_from_slice(&strings);
    let rva_of = |offset: usize| section_rva + offset as u32;

    let mut lookup = lookup_start;
    for (index, module) in modules.iter().enumerate() {
        let descriptor = index * DESCRIPTOR_SIZE;
        pe::put_u32(&mut bytes, descriptor, rva_of(lookup));
        pe::put_u32(&mut bytes, descriptor + 12, rva_of(module_names[index]));
        pe::put_u32(&mut bytes, descriptor + 16, module.first_thunk);

        for (thunk, name) in module.thunks.iter().zip(&name_offsets[index]) {
            let value = match name {
                Some(offset) => u64::from(rva_of(*offset)),
                None => ordinal_flag | u64::from(thunk.symbol.ordinal & 0xffff),
            };
            pe::put_pointer(&mut bytes, lookup, value, arch);
            let slot = thunk.rva as usize;
            if slot + pointer <= image.len() {
                pe::put_pointer(image, slot, value, arch);
            }
            lookup += pointer;
        }
        lookup += pointer;
    }

    let first = modules.iter().map(|m| m.first_thunk).min().unwrap_or_default();
    let last = modules
        .iter()
        .filter_map(|m| m.thunks.last())
        .map(|t| t.rva + pointer as u32)
        .max()
        .unwrap_or(first);

    ImportSection {
        bytes,
        descriptors_rva: section_rva,
        descriptors_size: descriptors_size as u32,
        iat: (first, last - first),
        unresolved_rva: None,
    }
}

/// Append the tagged unresolved list at the next 8-byte boundary and return its offset.
fn append_unresolved(bytes: &mut Vec<u8>, unrecoverable: &[UnrecoverableThunk]) -> usize
{
    let start = pe::align_up(bytes.len() as u64, 8) as usize;
    bytes.resize(start + 16 + unrecoverable.len() * UNRESOLVED_RECORD_SIZE, 0);
    bytes[start..start + 8].copy_from_slice(UNRESOLVED_TAG);
    pe::put_u32(bytes, start + 8, unrecoverable.len() as u32);
    for (index, thunk) in unrecoverable.iter().enumerate() {
        let record = start + 16 + index * UNRESOLVED_RECORD_SIZE;
        pe::put_u32(bytes, record, thunk.rva);
        pe::put_u64(bytes, record + 8, thunk.value.value());
    }
    start
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::imports::{ImportEntry, ImportTableBuilder};

    const BASE: u64 = 0x40_0000;

    fn resolved(slot: u64, module: &str, name: Option<&str>) -> ImportEntry
    {
        ImportEntry {
            thunk: Address::new(BASE + slot),
            original: Address::new(0x0100_0000),
            symbol: Some(ResolvedSymbol {
                module: module.to_string(),
                name: name.map(str::to_string),
                ordinal: 17,
                address: Address::new(0x7700_0000 + slot),
            }),
            method: ResolutionMethod::Emulated,
            confidence: Confidence::High,
            reason: None,
        }
    }

    fn unresolved(slot: u64) -> ImportEntry
    {
        ImportEntry {
            thunk: Address::new(BASE + slot),
            original: Address::new(0x0100_0040),
            symbol: None,
            method: ResolutionMethod::Unresolved,
            confidence: Confidence::Low,
            reason: Some("emulation: instruction limit of 10 reached".to_string()),
        }
    }

    fn table(entries: Vec<ImportEntry>) -> ImportTable
    {
        let mut builder = ImportTableBuilder::new();
        for entry in entries {
            builder.push(entry);
        }
        builder.finish()
    }

    #[test]
    fn test_grouping_splits_on_module_and_gaps()
    {
        let imports = table(vec![
            resolved(0x2000, "kernel32.dll", Some("Sleep")),
            resolved(0x2004, "kernel32.dll", Some("ExitProcess")),
            resolved(0x2008, "user32.dll", Some("MessageBoxA")),
            unresolved(0x200c),
            resolved(0x2010, "user32.dll", Some("GetDC")),
        ]);
        let (modules, unrecoverable) = group(&imports, Address::new(BASE), Architecture::X86);
        let shape: Vec<_> = modules.iter().map(|m| (m.name.as_str(), m.first_thunk, m.thunks.len())).collect();
        assert_eq!(
            shape,
            vec![("kernel32.dll", 0x2000, 2), ("user32.dll", 0x2008, 1), ("user32.dll", 0x2010, 1)]
        );
        assert_eq!(unrecoverable.len(), 1);
        assert_eq!(unrecoverable[0].rva, 0x200c);
        assert_eq!(unrecoverable[0].value, Address::new(0x0100_0040));
    }

    #[test]
    fn test_directory_layout_x86()
    {
        let imports = table(vec![
            resolved(0x2000, "kernel32.dll", Some("Sleep")),
            resolved(0x2004, "kernel32.dll", None),
        ]);
        let (modules, _) = group(&imports, Address::new(BASE), Architecture::X86);
        let mut image = vec![0u8; 0x3000];
        let section = build(&modules, &[], Architecture::X86, 0x5000, &mut image).unwrap();
        assert_eq!(section.unresolved_rva, None);

        assert_eq!(section.descriptors_size, 40);
        assert_eq!(section.iat, (0x2000, 8));
        let lookup = pe::get_u32(&section.bytes, 0).unwrap();
        assert_eq!(lookup, 0x5000 + 40);
        assert_eq!(pe::get_u32(&section.bytes, 16), Some(0x2000));
        // Terminating descriptor.
        assert!(section.bytes[20..40].iter().all(|&b| b == 0));

        let hint_name = pe::get_u32(&section.bytes, 40).unwrap() - 0x5000;
        assert_eq!(&section.bytes[hint_name as usize + 2..hint_name as usize + 8], b"Sleep\0");
        assert_eq!(pe::get_u32(&section.bytes, 44), Some(0x8000_0011));
        assert_eq!(pe::get_u32(&section.bytes, 48), Some(0));

        let dll = pe::get_u32(&section.bytes, 12).unwrap() - 0x5000;
        assert_eq!(&section.bytes[dll as usize..dll as usize + 13], b"kernel32.dll\0");
        assert_eq!(pe::get_u32(&image, 0x2000), Some(0x5000 + hint_name));
    }

    #[test]
    fn test_empty_table_yields_no_section()
    {
        let mut image = vec![0u8; 0x3000];
        assert!(build(&[], &[], Architecture::X86, 0x5000, &mut image).is_none());
    }

    #[test]
    fn test_unresolved_slots_are_listed()
    {
        let imports = table(vec![
            resolved(0x2000, "kernel32.dll", Some("Sleep")),
            unresolved(0x2004),
            unresolved(0x2008),
        ]);
        let (modules, unrecoverable) = group(&imports, Address::new(BASE), Architecture::X86);
        let mut image = vec![0u8; 0x3000];
        let section = build(&modules, &unrecoverable, Architecture::X86, 0x5000, &mut image).unwrap();

        let offset = (section.unresolved_rva.unwrap() - 0x5000) as usize;
        assert_eq!(offset % 8, 0);
        assert!(offset >= section.descriptors_size as usize);
        assert_eq!(&section.bytes[offset..offset + 8], UNRESOLVED_TAG);
        assert_eq!(pe::get_u32(&section.bytes, offset + 8), Some(2));
        assert_eq!(pe::get_u32(&section.bytes, offset + 16), Some(0x2004));
        assert_eq!(pe::get_pointer(&section.bytes, offset + 24, Architecture::X86_64), Some(0x0100_0040));
        assert_eq!(pe::get_u32(&section.bytes, offset + 32), Some(0x2008));
        assert_eq!(section.bytes.len(), offset + 16 + 2 * 16);
    }

    #[test]
    fn test_only_unresolved_keeps_directory_empty()
    {
        let imports = table(vec![unresolved(0x2000)]);
        let (modules, unrecoverable) = group(&imports, Address::new(BASE), Architecture::X86);
        assert!(modules.is_empty());
        let mut image = vec![0u8; 0x3000];
        let section = build(&modules, &unrecoverable, Architecture::X86, 0x5000, &mut image).unwrap();

        assert_eq!((section.descriptors_rva, section.descriptors_size), (0, 0));
        assert_eq!(section.iat, (0, 0));
        assert_eq!(section.unresolved_rva, Some(0x5000));
        assert_eq!(&section.bytes[..8], UNRESOLVED_TAG);
        // Nothing was rewritten in the image.
        assert!(image.iter().all(|&b| b == 0));
    }
}
