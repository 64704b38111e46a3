//! # Image Reconstructor
//!
//! Turns a [`MemorySnapshot`] plus the confirmed OEP and the import table into
//! a loadable PE file.
//!
//! The output keeps the memory layout: every raw offset equals its RVA and
//! `FileAlignment` equals `SectionAlignment`, so no byte of the dumped image
//! moves. On top of that the reconstructor:
//!
//! - rebuilds the section table from page protections ([`sections`])
//! - appends an import section and points the import directory at it ([`iat`]);
//!   unresolved slots are listed at its end
//! - rewrites the entry point, `ImageBase`, `SizeOfImage` and section count
//! - clears the bound-import and security directories and the checksum

pub mod iat;
pub mod sections;

use iced_x86::{Decoder, DecoderOptions};
use tracing::{debug, info, warn};

pub use iat::{ImportModule, ThunkRecord, UnrecoverableThunk, UNRESOLVED_TAG};
pub use sections::{OutputSection, PageClass};

use crate::error::{Result, UnpackError};
use crate::imports::ImportTable;
use crate::pe::{self, directory, OptionalField, PeHeaders, SECTION_HEADER_SIZE};
use crate::profile;
use crate::snapshot::MemorySnapshot;
use crate::types::{Address, PAGE_SIZE};

/// Zero bytes at the OEP that mark section padding rather than code.
const PADDING_RUN: usize = 8;

/// Name of the appended import section.
const IMPORT_SECTION: &str = ".imports";

/// A rebuilt PE file and what went into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructedImage
{
    /// File bytes.
    pub bytes: Vec<u8>,
    /// Entry point RVA written to the header.
    pub entry_rva: u32,
    /// Section table, import section included.
    pub sections: Vec<OutputSection>,
    /// Import descriptors with per-thunk method and confidence.
    pub imports: Vec<ImportModule>,
    /// Slots left with their OEP-time value.
    pub unrecoverable: Vec<UnrecoverableThunk>,
    /// RVA of the tagged list of those slots in the import section.
    pub unresolved_rva: Option<u32>,
}

impl ReconstructedImage
{
    /// Number of thunks written to the import directory.
    #[must_use]
    pub fn imported_thunks(&self) -> usize
    {
        self.imports.iter().map(|module| module.thunks.len()).sum()
    }
}

/// Build the output image
///
/// ## Errors
///
/// [`UnpackError::Reconstruction`] when the in-memory header is not a PE
/// header, when `oep` is not executable code in an original section of the
/// image (protector sections and zero padding are refused), or when the
/// new section table does not fit in the header area.
pub fn build(snapshot: &MemorySnapshot, oep: Address, imports: &ImportTable) -> Result<ReconstructedImage>
{
    let base = snapshot.target.base;
    let mut image = snapshot.image_bytes();
    let headers = PeHeaders::parse(&image)
        .map_err(|e| UnpackError::Reconstruction(format!("target header unrecognizable: {e}")))?;
    let entry_rva = validate_oep(snapshot, &headers, oep)?;

    let alignment = u64::from(headers.section_alignment.max(PAGE_SIZE as u32));
    let pages = snapshot.image_pages();
    let mut sections = sections::coalesce(&pages, &headers.sections, headers.size_of_headers);
    let dirty = sections.iter().filter(|s| s.dirty).count();
    debug!("{} sections from page protections ({dirty} modified since load)", sections.len());

    let (modules, unrecoverable) = iat::group(imports, base, snapshot.architecture);
    let section_rva = pe::align_up(image.len() as u64, alignment) as u32;
    let import_section = iat::build(&modules, &unrecoverable, snapshot.architecture, section_rva, &mut image);
    if let Some(section) = &import_section {
        let size = pe::align_up(section.bytes.len() as u64, alignment) as u32;
        image.resize(section_rva as usize, 0);
        image.extend_from_slice(&section.bytes);
        image.resize((section_rva + size) as usize, 0);
        sections.push(OutputSection {
            name: IMPORT_SECTION.to_string(),
            rva: section_rva,
            size,
            characteristics: PageClass::Writable.characteristics(),
            dirty: true,
        });
    }
    image.resize(pe::align_up(image.len() as u64, alignment) as usize, 0);

    write_section_table(&mut image, &headers, &sections)?;

    let size_of_image = image.len() as u32;
    pe::put_u32(&mut image, headers.field(OptionalField::EntryPoint), entry_rva);
    pe::put_u32(&mut image, headers.field(OptionalField::SizeOfImage), size_of_image);
    pe::put_u32(&mut image, headers.field(OptionalField::FileAlignment), alignment as u32);
    pe::put_u32(&mut image, headers.field(OptionalField::CheckSum), 0);
    pe::put_pointer(
        &mut image,
        headers.field(OptionalField::ImageBase),
        base.value(),
        snapshot.architecture,
    );

    let (import_dir, iat_dir) = match &import_section {
        Some(section) if section.descriptors_size != 0 => ((section.descriptors_rva, section.descriptors_size), section.iat),
        _ => ((0, 0), (0, 0)),
    };
    set_directory(&mut image, &headers, directory::IMPORT, import_dir);
    set_directory(&mut image, &headers, directory::IAT, iat_dir);
    set_directory(&mut image, &headers, directory::BOUND_IMPORT, (0, 0));
    set_directory(&mut image, &headers, directory::SECURITY, (0, 0));

    let imported: usize = modules.iter().map(|module| module.thunks.len()).sum();
    info!(
        "Rebuilt image: entry RVA 0x{entry_rva:x}, {} sections, {imported} imports in {} descriptors",
        sections.len(),
        modules.len()
    );
    for thunk in &unrecoverable {
        warn!("Unrecoverable import slot at RVA 0x{:x} ({}): {}", thunk.rva, thunk.value, thunk.reason);
    }

    Ok(ReconstructedImage {
        bytes: image,
        entry_rva,
        sections,
        imports: modules,
        unresolved_rva: import_section.as_ref().and_then(|section| section.unresolved_rva),
        unrecoverable,
    })
}

/// Check that `oep` is decodable code in an original executable section.
fn validate_oep(snapshot: &MemorySnapshot, headers: &PeHeaders, oep: Address) -> Result<u32>
{
    let invalid = |why: &str| UnpackError::Reconstruction(format!("OEP {oep} {why}"));

    let rva = oep
        .rva_from(snapshot.target.base)
        .filter(|&rva| rva != 0 && u64::from(rva) < snapshot.target.size)
        .ok_or_else(|| invalid("is outside the target image"))?;
    let section = headers
        .section_containing(rva)
        .ok_or_else(|| invalid("is not inside a section"))?;
    if profile::is_known_protector_section(&section.name) {
        return Err(invalid(&format!("is inside protector section {}", section.name)));
    }
    let page = snapshot.page(oep).ok_or_else(|| invalid("is not in captured memory"))?;
    if !page.readable {
        return Err(invalid("is on an unreadable page"));
    }
    if !page.protection.execute {
        return Err(invalid("is not executable"));
    }
    let bytes = snapshot.read_tail(oep).ok_or_else(|| invalid("is not in captured memory"))?;
    if bytes.iter().take(PADDING_RUN).all(|&byte| byte == 0) {
        return Err(invalid("is in zero padding"));
    }
    let mut decoder = Decoder::with_ip(
        snapshot.architecture.bitness(),
        &bytes[..bytes.len().min(16)],
        oep.value(),
        DecoderOptions::NONE,
    );
    if decoder.decode().is_invalid() {
        return Err(invalid("does not decode to an instruction"));
    }
    Ok(rva)
}

fn write_section_table(image: &mut [u8], headers: &PeHeaders, sections: &[OutputSection]) -> Result<()>
{
    let start = headers.section_table_offset;
    let end = start + sections.len() * SECTION_HEADER_SIZE;
    let limit = (headers.size_of_headers as usize).min(image.len());
    if end > limit {
        return Err(UnpackError::Reconstruction(format!(
            "{} section headers do not fit in 0x{:x} header bytes",
            sections.len(),
            headers.size_of_headers
        )));
    }

    let old_end = (start + headers.sections.len() * SECTION_HEADER_SIZE).min(limit);
    image[start..old_end.max(start)].fill(0);
    for (index, section) in sections.iter().enumerate() {
        let offset = start + index * SECTION_HEADER_SIZE;
        image[offset..offset + SECTION_HEADER_SIZE].copy_from_slice(&section.header());
    }
    pe::put_u16(
        image,
        headers.nt_offset + pe::NUMBER_OF_SECTIONS_OFFSET,
        sections.len() as u16,
    );
    Ok(())
}

fn set_directory(image: &mut [u8], headers: &PeHeaders, index: usize, (rva, size): (u32, u32))
{
    if index >= headers.directories.len() {
        return;
    }
    let offset = headers.directory_offset(index);
    pe::put_u32(image, offset, rva);
    pe::put_u32(image, offset + 4, size);
}
