//! Section layout of the reconstructed image.
//!
//! The protector rewrites the section table to suit its loader, so the output
//! table is derived from what was actually mapped: consecutive pages with the
//! same protection class become one section.

use crate::pe::{
    self, SectionInfo, IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
    IMAGE_SCN_MEM_WRITE, SECTION_HEADER_SIZE,
};
use crate::snapshot::PageInfo;
use crate::types::PAGE_SIZE;

/// Protection class used for coalescing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageClass
{
    /// Read-only (also unreadable pages, which are emitted as zeros).
    Data,
    /// Read-write.
    Writable,
    /// Read-execute.
    Code,
    /// Read-write-execute.
    WritableCode,
}

impl PageClass
{
    /// Class of a captured page.
    #[must_use]
    pub fn of(page: Option<&PageInfo>) -> Self
    {
        match page {
            Some(info) if info.readable => match (info.protection.write, info.protection.execute) {
                (false, false) => Self::Data,
                (true, false) => Self::Writable,
                (false, true) => Self::Code,
                (true, true) => Self::WritableCode,
            },
            _ => Self::Data,
        }
    }

    /// `IMAGE_SCN_*` characteristics.
    #[must_use]
    pub fn characteristics(self) -> u32
    {
        match self {
            Self::Data => IMAGE_SCN_MEM_READ | IMAGE_SCN_CNT_INITIALIZED_DATA,
            Self::Writable => IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE | IMAGE_SCN_CNT_INITIALIZED_DATA,
            Self::Code => IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE,
            Self::WritableCode => IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE,
        }
    }
}

/// One section of the output image (raw offset equals RVA)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSection
{
    /// Name, at most eight bytes.
    pub name: String,
    /// RVA and file offset.
    pub rva: u32,
    /// Virtual and raw size.
    pub size: u32,
    /// `IMAGE_SCN_*` flags.
    pub characteristics: u32,
    /// Some page changed after the module was mapped.
    pub dirty: bool,
}

impl OutputSection
{
    /// One past the last RVA.
    #[must_use]
    pub fn end(&self) -> u32
    {
        self.rva + self.size
    }

    /// Whether the section is executable.
    #[must_use]
    pub fn is_executable(&self) -> bool
    {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }

    /// Serialize as an `IMAGE_SECTION_HEADER`.
    #[must_use]
    pub fn header(&self) -> [u8; SECTION_HEADER_SIZE]
    {
        let mut header = [0u8; SECTION_HEADER_SIZE];
        let name = self.name.as_bytes();
        let len = name.len().min(8);
        header[..len].copy_from_slice(&name[..len]);
        pe::put_u32(&mut header, 8, self.size);
        pe::put_u32(&mut header, 12, self.rva);
        pe::put_u32(&mut header, 16, self.size);
        pe::put_u32(&mut header, 20, self.rva);
        pe::put_u32(&mut header, 36, self.characteristics);
        header
    }
}

/// Coalesce the image's pages into sections
///
/// `pages` has one entry per page of the image starting at RVA 0; pages below
/// `first_rva` (the headers) are skipped. Runs that start where an original
/// section starts keep its name; the others are named `.secN`.
#[must_use]
pub fn coalesce(pages: &[Option<PageInfo>], original: &[SectionInfo], first_rva: u32) -> Vec<OutputSection>
{
    let first_page = pe::align_up(u64::from(first_rva), PAGE_SIZE) / PAGE_SIZE;
    let mut sections: Vec<(PageClass, OutputSection)> = Vec::new();

    for (index, page) in pages.iter().enumerate().skip(first_page as usize) {
        let rva = (index as u64 * PAGE_SIZE) as u32;
        let class = PageClass::of(page.as_ref());
        let dirty = page.is_some_and(|info| info.dirty);
        let boundary = original.iter().any(|section| section.rva == rva);

        if let Some((last_class, last)) = sections.last_mut() {
            if *last_class == class && last.end() == rva && !boundary {
                last.size += PAGE_SIZE as u32;
                last.dirty |= dirty;
                continue;
            }
        }
        let name = original
            .iter()
            .find(|section| section.rva == rva)
            .map(|section| section.name.trim_end_matches('\0').to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!(".sec{}", sections.len()));
        sections.push((
            class,
            OutputSection {
                name,
                rva,
                size: PAGE_SIZE as u32,
                characteristics: class.characteristics(),
                dirty,
            },
        ));
    }
    sections.into_iter().map(|(_, section)| section).collect()
}
