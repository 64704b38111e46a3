//! PE header inspection and little-endian field helpers.
//!
//! Parsing goes through the `object` crate; the engine keeps only the values
//! it needs plus the byte offsets of the fields the reconstructor rewrites.

use std::path::Path;

use object::pe::{ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{ExportTable, ExportTarget, ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;
use tracing::{debug, warn};

use crate::controller::MemoryView;
use crate::error::{Result, UnpackError};
use crate::types::{Address, Architecture};

/// `IMAGE_FILE_DLL`
pub const IMAGE_FILE_DLL: u16 = 0x2000;
/// `IMAGE_SCN_CNT_CODE`
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
/// `IMAGE_SCN_CNT_INITIALIZED_DATA`
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
/// `IMAGE_SCN_MEM_EXECUTE`
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// `IMAGE_SCN_MEM_READ`
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
/// `IMAGE_SCN_MEM_WRITE`
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Data directory indices used by the engine.
pub mod directory
{
    /// Export table
    pub const EXPORT: usize = 0;
    /// Import table
    pub const IMPORT: usize = 1;
    /// Attribute certificates
    pub const SECURITY: usize = 4;
    /// Bound imports
    pub const BOUND_IMPORT: usize = 11;
    /// Import address table
    pub const IAT: usize = 12;
    /// CLR runtime header
    pub const COM_DESCRIPTOR: usize = 14;
}

/// Size of one section header.
pub const SECTION_HEADER_SIZE: usize = 40;
/// Size of one data directory entry.
pub const DATA_DIRECTORY_SIZE: usize = 8;

/// Whether the target is run directly or hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind
{
    /// Executable.
    Exe,
    /// Dynamic-link library.
    Dll,
}

/// Code format of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryFormat
{
    /// Native machine code.
    Native,
    /// .NET assembly (has a CLR header).
    DotNet,
}

/// One entry of the section table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo
{
    /// Name with trailing NULs removed.
    pub name: String,
    /// Virtual address (RVA).
    pub rva: u32,
    /// Virtual size.
    pub virtual_size: u32,
    /// File offset of the raw data.
    pub raw_offset: u32,
    /// Size of the raw data.
    pub raw_size: u32,
    /// `IMAGE_SCN_*` flags.
    pub characteristics: u32,
}

impl SectionInfo
{
    /// Check whether `rva` falls inside the section's virtual range.
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool
    {
        let span = self.virtual_size.max(self.raw_size);
        rva >= self.rva && rva - self.rva < span
    }

    /// Section is marked executable.
    #[must_use]
    pub fn is_executable(&self) -> bool
    {
        self.characteristics & (IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE) != 0
    }

    /// Virtual end of the section (exclusive).
    #[must_use]
    pub fn end(&self) -> u32
    {
        self.rva.saturating_add(self.virtual_size.max(self.raw_size))
    }
}

/// Parsed PE headers plus the offsets of the fields the engine rewrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeHeaders
{
    /// Bitness.
    pub architecture: Architecture,
    /// EXE or DLL.
    pub kind: TargetKind,
    /// Native or .NET.
    pub format: BinaryFormat,
    /// Preferred load address.
    pub image_base: u64,
    /// `AddressOfEntryPoint`
    pub entry_rva: u32,
    /// `SizeOfImage`
    pub size_of_image: u32,
    /// `SizeOfHeaders`
    pub size_of_headers: u32,
    /// `SectionAlignment`
    pub section_alignment: u32,
    /// `FileAlignment`
    pub file_alignment: u32,
    /// Section table.
    pub sections: Vec<SectionInfo>,
    /// Data directories as `(rva, size)` pairs.
    pub directories: Vec<(u32, u32)>,
    /// Offset of the `PE\0\0` signature.
    pub nt_offset: usize,
    /// Offset of the optional header.
    pub optional_offset: usize,
    /// Offset of the first section header.
    pub section_table_offset: usize,
    /// Offset of the first data directory.
    pub data_directory_offset: usize,
}

impl PeHeaders
{
    /// Parse the headers at the start of `data`
    ///
    /// `data` may be either a file image or a memory image; only the headers
    /// are read.
    ///
    /// ## Errors
    ///
    /// [`UnpackError::InvalidTarget`] when no valid PE header is found.
    pub fn parse(data: &[u8]) -> Result<Self>
    {
        let dos = ImageDosHeader::parse(data).map_err(|e| UnpackError::InvalidTarget(e.to_string()))?;
        let nt_offset = dos.nt_headers_offset() as usize;

        // Try PE32+ first; the optional header magic decides.
        let mut offset = u64::from(dos.nt_headers_offset());
        if let Ok((nt, dirs)) = ImageNtHeaders64::parse(data, &mut offset) {
            return Self::from_nt(data, nt, &dirs, nt_offset, offset, Architecture::X86_64, 112);
        }
        let mut offset = u64::from(dos.nt_headers_offset());
        let (nt, dirs) = ImageNtHeaders32::parse(data, &mut offset).map_err(|e| UnpackError::InvalidTarget(e.to_string()))?;
        Self::from_nt(data, nt, &dirs, nt_offset, offset, Architecture::X86, 96)
    }

    fn from_nt<Pe: ImageNtHeaders>(
        data: &[u8],
        nt: &Pe,
        dirs: &object::read::pe::DataDirectories<'_>,
        nt_offset: usize,
        section_offset: u64,
        architecture: Architecture,
        directory_offset: usize,
    ) -> Result<Self>
    {
        let machine = nt.file_header().machine.get(LE);
        let expected = match architecture {
            Architecture::X86 => object::pe::IMAGE_FILE_MACHINE_I386,
            Architecture::X86_64 => object::pe::IMAGE_FILE_MACHINE_AMD64,
        };
        if machine != expected {
            return Err(UnpackError::InvalidTarget(format!(
                "unsupported machine 0x{machine:04x} for {architecture}"
            )));
        }

        let optional = nt.optional_header();
        let table = nt
            .sections(data, section_offset)
            .map_err(|e| UnpackError::InvalidTarget(e.to_string()))?;
        let sections = table
            .iter()
            .map(|section| SectionInfo {
                name: String::from_utf8_lossy(section.raw_name()).into_owned(),
                rva: section.virtual_address.get(LE),
                virtual_size: section.virtual_size.get(LE),
                raw_offset: section.pointer_to_raw_data.get(LE),
                raw_size: section.size_of_raw_data.get(LE),
                characteristics: section.characteristics.get(LE),
            })
            .collect();

        let directories: Vec<(u32, u32)> = dirs
            .iter()
            .map(|dir| (dir.virtual_address.get(LE), dir.size.get(LE)))
            .collect();
        let format = match directories.get(directory::COM_DESCRIPTOR) {
            Some(&(rva, size)) if rva != 0 && size != 0 => BinaryFormat::DotNet,
            _ => BinaryFormat::Native,
        };
        let kind = if nt.file_header().characteristics.get(LE) & IMAGE_FILE_DLL != 0 {
            TargetKind::Dll
        } else {
            TargetKind::Exe
        };

        let optional_offset = nt_offset + 24;
        Ok(Self {
            architecture,
            kind,
            format,
            image_base: optional.image_base(),
            entry_rva: optional.address_of_entry_point(),
            size_of_image: optional.size_of_image(),
            size_of_headers: optional.size_of_headers(),
            section_alignment: optional.section_alignment(),
            file_alignment: optional.file_alignment(),
            sections,
            directories,
            nt_offset,
            optional_offset,
            section_table_offset: section_offset as usize,
            data_directory_offset: optional_offset + directory_offset,
        })
    }

    /// Section whose virtual range contains `rva`.
    #[must_use]
    pub fn section_containing(&self, rva: u32) -> Option<&SectionInfo>
    {
        self.sections.iter().find(|section| section.contains(rva))
    }

    /// Data directory `(rva, size)`, `None` when absent or empty.
    #[must_use]
    pub fn directory(&self, index: usize) -> Option<(u32, u32)>
    {
        self.directories
            .get(index)
            .copied()
            .filter(|&(rva, size)| rva != 0 && size != 0)
    }

    /// Translate an RVA into a file offset using the section table.
    #[must_use]
    pub fn rva_to_file_offset(&self, rva: u32) -> Option<usize>
    {
        if rva < self.size_of_headers {
            return Some(rva as usize);
        }
        let section = self.sections.iter().find(|s| rva >= s.rva && rva - s.rva < s.raw_size)?;
        Some((section.raw_offset + (rva - section.rva)) as usize)
    }

    /// Field offsets for the optional header, which differ between PE32 and PE32+.
    #[must_use]
    pub fn field(&self, field: OptionalField) -> usize
    {
        let pe64 = self.architecture == Architecture::X86_64;
        self.optional_offset
            + match field {
                OptionalField::EntryPoint => 16,
                OptionalField::ImageBase => {
                    if pe64 {
                        24
                    } else {
                        28
                    }
                }
                OptionalField::FileAlignment => 36,
                OptionalField::SizeOfImage => 56,
                OptionalField::CheckSum => 64,
            }
    }

    /// Offset of data directory `index`.
    #[must_use]
    pub fn directory_offset(&self, index: usize) -> usize
    {
        self.data_directory_offset + index * DATA_DIRECTORY_SIZE
    }
}

/// Optional header fields rewritten by the reconstructor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalField
{
    /// `AddressOfEntryPoint`
    EntryPoint,
    /// `ImageBase` (4 or 8 bytes)
    ImageBase,
    /// `FileAlignment`
    FileAlignment,
    /// `SizeOfImage`
    SizeOfImage,
    /// `CheckSum`
    CheckSum,
}

/// Offset of `NumberOfSections` relative to the `PE\0\0` signature.
pub const NUMBER_OF_SECTIONS_OFFSET: usize = 6;

/// Static facts about the protected file, read before launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile
{
    /// Parsed headers.
    pub headers: PeHeaders,
    /// Up to 64 bytes at the entry point, used for signature probing.
    pub entry_bytes: Vec<u8>,
    /// Raw header bytes (`SizeOfHeaders`), the fallback header source.
    pub header_bytes: Vec<u8>,
}

impl TargetFile
{
    /// Inspect a file on disk.
    ///
    /// ## Errors
    ///
    /// [`UnpackError::Io`] if the file cannot be read, [`UnpackError::InvalidTarget`]
    /// if it is not a PE image.
    pub fn inspect(path: &Path) -> Result<Self>
    {
        let data = std::fs::read(path)?;
        debug!("Inspecting {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(&data)
    }

    /// Inspect an in-memory file image.
    ///
    /// ## Errors
    ///
    /// [`UnpackError::InvalidTarget`] if the bytes are not a PE image.
    pub fn from_bytes(data: &[u8]) -> Result<Self>
    {
        let headers = PeHeaders::parse(data)?;
        let entry_bytes = headers
            .rva_to_file_offset(headers.entry_rva)
            .filter(|_| headers.entry_rva != 0)
            .and_then(|offset| data.get(offset..))
            .map(|tail| tail[..tail.len().min(64)].to_vec())
            .unwrap_or_default();
        let header_len = (headers.size_of_headers as usize).min(data.len());
        Ok(Self {
            entry_bytes,
            header_bytes: data[..header_len].to_vec(),
            headers,
        })
    }

    /// Names of every section, in table order.
    #[must_use]
    pub fn section_names(&self) -> Vec<&str>
    {
        self.headers.sections.iter().map(|s| s.name.as_str()).collect()
    }
}

/// An exported function of a loaded module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportEntry
{
    /// Export name, `None` for ordinal-only exports.
    pub name: Option<String>,
    /// Biased ordinal.
    pub ordinal: u32,
    /// Address of the function in the target.
    pub address: Address,
}

/// Read the export table of the module mapped at `base`
///
/// Forwarded exports are skipped; the function they forward to is listed by
/// the module that implements it.
///
/// ## Errors
///
/// [`UnpackError::MemoryAccess`] if the header or export directory cannot be
/// read, [`UnpackError::InvalidTarget`] if the header is not PE.
pub fn read_exports(view: &dyn MemoryView, base: Address) -> Result<Vec<ExportEntry>>
{
    let header = view
        .read_bytes(base, 0x1000)
        .ok_or_else(|| UnpackError::memory(base.value(), 0x1000))?;
    let headers = PeHeaders::parse(&header)?;
    let Some((rva, size)) = headers.directory(directory::EXPORT) else {
        return Ok(Vec::new());
    };
    let data = view
        .read_bytes(base + u64::from(rva), size as usize)
        .ok_or_else(|| UnpackError::memory(base.value() + u64::from(rva), size as usize))?;
    let table = ExportTable::parse(&data, rva).map_err(|e| UnpackError::InvalidTarget(e.to_string()))?;
    let exports = match table.exports() {
        Ok(exports) => exports,
        Err(e) => {
            warn!("Export table at {base} is malformed: {e}");
            return Ok(Vec::new());
        }
    };
    Ok(exports
        .into_iter()
        .filter_map(|export| match export.target {
            ExportTarget::Address(target) => Some(ExportEntry {
                name: export.name.map(|name| String::from_utf8_lossy(name).into_owned()),
                ordinal: export.ordinal,
                address: base + u64::from(target),
            }),
            _ => None,
        })
        .collect())
}

/// Write a `u16` at `offset` in little-endian order.
pub fn put_u16(buf: &mut [u8], offset: usize, value: u16)
{
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a `u32` at `offset` in little-endian order.
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32)
{
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write a `u64` at `offset` in little-endian order.
pub fn put_u64(buf: &mut [u8], offset: usize, value: u64)
{
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Write a pointer of the architecture's width.
pub fn put_pointer(buf: &mut [u8], offset: usize, value: u64, arch: Architecture)
{
    match arch {
        Architecture::X86 => put_u32(buf, offset, value as u32),
        Architecture::X86_64 => put_u64(buf, offset, value),
    }
}

/// Read a `u32` at `offset`, `None` when out of bounds.
#[must_use]
pub fn get_u32(buf: &[u8], offset: usize) -> Option<u32>
{
    Some(u32::from_le_bytes(buf.get(offset..offset + 4)?.try_into().ok()?))
}

/// Read a pointer of the architecture's width, `None` when out of bounds.
#[must_use]
pub fn get_pointer(buf: &[u8], offset: usize, arch: Architecture) -> Option<u64>
{
    match arch {
        Architecture::X86 => get_u32(buf, offset).map(u64::from),
        Architecture::X86_64 => Some(u64::from_le_bytes(buf.get(offset..offset + 8)?.try_into().ok()?)),
    }
}

/// Round `value` up to a power-of-two `alignment`.
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64
{
    (value + alignment - 1) & !(alignment - 1)
}
