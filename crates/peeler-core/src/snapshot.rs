//! # Memory Snapshot
//!
//! Immutable copy of the target's address space taken at the confirmed OEP.
//!
//! The snapshot holds every page of the protected module, the private
//! allocations where the protector keeps its import wrappers, the TEB/PEB,
//! the register state and the export tables of every other loaded module.
//! Once it is captured the live process is no longer needed: import
//! resolution and image reconstruction run purely against this value.

use fxhash::FxHashMap;
use tracing::{debug, warn};

use crate::controller::{LiveMemory, MemoryView, ProcessController};
use crate::error::{Result, UnpackError};
use crate::pe::{self, ExportEntry};
use crate::types::{Address, Architecture, MemoryRegion, ModuleInfo, Protection, RegionKind, Registers, ThreadId, PAGE_SIZE};

/// Upper bound on private memory copied into a snapshot.
const PRIVATE_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;

/// Page digests of a module as first mapped, used to flag modified pages
#[derive(Debug, Clone, Default)]
pub struct PageBaseline
{
    digests: FxHashMap<u64, u64>,
}

impl PageBaseline
{
    /// Hash every readable page of `module`.
    #[must_use]
    pub fn record(view: &dyn MemoryView, module: &ModuleInfo) -> Self
    {
        let mut digests = FxHashMap::default();
        let mut page = module.base;
        while page < module.base + module.size {
            if let Some(bytes) = view.read_bytes(page, PAGE_SIZE as usize) {
                digests.insert(page.value(), fxhash::hash64(&bytes));
            }
            page = page + PAGE_SIZE;
        }
        debug!("Recorded {} baseline pages for {}", digests.len(), module.name);
        Self { digests }
    }

    /// Whether `bytes` (the current content of `page`) differ from the baseline
    ///
    /// Pages that were not readable at baseline time count as modified.
    #[must_use]
    pub fn is_dirty(&self, page: Address, bytes: &[u8]) -> bool
    {
        self.digests
            .get(&page.value())
            .map_or(true, |&digest| digest != fxhash::hash64(bytes))
    }

    /// Number of recorded pages.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.digests.len()
    }

    /// Check whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.digests.is_empty()
    }
}

/// Per-page metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo
{
    /// Protection at capture time.
    pub protection: Protection,
    /// The page could be read; unreadable pages are zero-filled.
    pub readable: bool,
    /// The content differs from the baseline (or had none).
    pub dirty: bool,
}

/// One captured region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRegion
{
    /// First address.
    pub base: Address,
    /// Allocation type.
    pub kind: RegionKind,
    /// Metadata for each page.
    pub pages: Vec<PageInfo>,
    /// Copied bytes (`pages.len() * PAGE_SIZE`).
    pub data: Vec<u8>,
}

impl SnapshotRegion
{
    /// Build a region from raw bytes with uniform page metadata.
    #[must_use]
    pub fn uniform(base: Address, kind: RegionKind, protection: Protection, data: Vec<u8>) -> Self
    {
        let page_count = (data.len() as u64).div_ceil(PAGE_SIZE) as usize;
        Self {
            base,
            kind,
            pages: vec![
                PageInfo {
                    protection,
                    readable: true,
                    dirty: true,
                };
                page_count
            ],
            data,
        }
    }

    /// One past the last address.
    #[must_use]
    pub fn end(&self) -> Address
    {
        self.base + self.data.len() as u64
    }

    /// Check whether `address` lies in the region.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address < self.end()
    }

    /// Metadata of the page holding `address`.
    #[must_use]
    pub fn page(&self, address: Address) -> Option<&PageInfo>
    {
        if !self.contains(address) {
            return None;
        }
        self.pages.get(((address - self.base) / PAGE_SIZE) as usize)
    }
}

/// Exports of one loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleExports
{
    /// The module.
    pub module: ModuleInfo,
    /// Its exported functions.
    pub exports: Vec<ExportEntry>,
}

/// Immutable memory image of the target at the OEP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot
{
    /// Bitness of the target.
    pub architecture: Architecture,
    /// The protected module.
    pub target: ModuleInfo,
    /// Captured regions sorted by base.
    pub regions: Vec<SnapshotRegion>,
    /// Register state at capture.
    pub registers: Registers,
    /// Thread the registers belong to.
    pub thread: ThreadId,
    /// TEB of that thread.
    pub teb: Address,
    /// PEB.
    pub peb: Address,
    /// Export tables of the other loaded modules, in load order.
    pub modules: Vec<ModuleExports>,
}

impl MemorySnapshot
{
    /// Copy the relevant parts of a stopped process
    ///
    /// ## Errors
    ///
    /// [`UnpackError::InvalidArgument`] when the controller has no session or
    /// the target module is not mapped; platform errors from region queries.
    pub fn capture<C: ProcessController + ?Sized>(
        controller: &C,
        baseline: &PageBaseline,
        registers: Registers,
        thread: ThreadId,
    ) -> Result<Self>
    {
        let session = controller
            .session()
            .ok_or_else(|| UnpackError::InvalidArgument("no active debug session".to_string()))?;
        let target = session
            .target
            .clone()
            .ok_or_else(|| UnpackError::InvalidArgument("target module is not mapped".to_string()))?;

        let mut layout = controller.memory_regions()?;
        layout.sort_by_key(|region| region.base);

        let mut regions = Vec::new();
        let mut private_budget = PRIVATE_MEMORY_LIMIT;
        for region in &layout {
            let in_target = target.contains(region.base) || region.allocation_base == target.base;
            let wanted = in_target || (region.kind == RegionKind::Private && wanted_private(region, session.teb));
            if !wanted {
                continue;
            }
            if !in_target {
                if region.size > private_budget {
                    warn!("Skipping private region at {} ({} bytes): snapshot limit reached", region.base, region.size);
                    continue;
                }
                private_budget -= region.size;
            }
            let kind = if in_target { RegionKind::Image } else { region.kind };
            regions.push(copy_region(controller, region, kind, in_target.then_some(baseline)));
        }

        let view = LiveMemory(controller);
        let modules = session
            .modules
            .iter()
            .filter(|module| module.base != target.base)
            .map(|module| {
                let exports = pe::read_exports(&view, module.base).unwrap_or_else(|e| {
                    warn!("Could not read exports of {}: {e}", module.name);
                    Vec::new()
                });
                ModuleExports {
                    module: module.clone(),
                    exports,
                }
            })
            .collect::<Vec<_>>();

        let snapshot = Self {
            architecture: session.architecture,
            target,
            regions,
            registers,
            thread,
            teb: session.teb,
            peb: session.peb,
            modules,
        };
        debug!(
            "Captured {} regions ({} bytes), {} modules",
            snapshot.regions.len(),
            snapshot.regions.iter().map(|r| r.data.len()).sum::<usize>(),
            snapshot.modules.len()
        );
        Ok(snapshot)
    }

    /// Region containing `address`.
    #[must_use]
    pub fn region_containing(&self, address: Address) -> Option<&SnapshotRegion>
    {
        let index = self.regions.partition_point(|region| region.base <= address);
        let region = self.regions.get(index.checked_sub(1)?)?;
        region.contains(address).then_some(region)
    }

    /// Metadata of the page holding `address`.
    #[must_use]
    pub fn page(&self, address: Address) -> Option<&PageInfo>
    {
        self.region_containing(address)?.page(address)
    }

    /// Borrow `len` bytes that lie inside a single region.
    #[must_use]
    pub fn read_slice(&self, address: Address, len: usize) -> Option<&[u8]>
    {
        let region = self.region_containing(address)?;
        let start = (address - region.base) as usize;
        region.data.get(start..start.checked_add(len)?)
    }

    /// Borrow the bytes from `address` to the end of its region.
    #[must_use]
    pub fn read_tail(&self, address: Address) -> Option<&[u8]>
    {
        let region = self.region_containing(address)?;
        region.data.get((address - region.base) as usize..)
    }

    /// Whether `address` is on a readable page with execute permission.
    #[must_use]
    pub fn is_executable(&self, address: Address) -> bool
    {
        self.page(address)
            .is_some_and(|page| page.readable && page.protection.execute)
    }

    /// Whether `address` is inside the protected module.
    #[must_use]
    pub fn in_target(&self, address: Address) -> bool
    {
        self.target.contains(address)
    }

    /// The protected module laid out as mapped, unreadable pages as zeros.
    #[must_use]
    pub fn image_bytes(&self) -> Vec<u8>
    {
        let mut image = vec![0u8; self.target.size as usize];
        for region in self.regions.iter().filter(|r| r.kind == RegionKind::Image) {
            let Some(offset) = region.base.value().checked_sub(self.target.base.value()) else {
                continue;
            };
            let offset = offset as usize;
            if offset >= image.len() {
                continue;
            }
            let len = region.data.len().min(image.len() - offset);
            image[offset..offset + len].copy_from_slice(&region.data[..len]);
        }
        image
    }

    /// Page metadata for the protected module, one entry per page.
    #[must_use]
    pub fn image_pages(&self) -> Vec<Option<PageInfo>>
    {
        let count = self.target.size.div_ceil(PAGE_SIZE) as usize;
        (0..count)
            .map(|index| self.page(self.target.base + index as u64 * PAGE_SIZE).copied())
            .collect()
    }

    /// Private executable regions (where import wrappers usually live).
    pub fn private_code(&self) -> impl Iterator<Item = &SnapshotRegion>
    {
        self.regions
            .iter()
            .filter(|region| region.kind == RegionKind::Private && region.pages.iter().any(|p| p.protection.execute))
    }
}

impl MemoryView for MemorySnapshot
{
    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>>
    {
        if let Some(slice) = self.read_slice(address, len) {
            return Some(slice.to_vec());
        }
        // Spans adjacent regions.
        let mut out = Vec::with_capacity(len);
        let mut cursor = address;
        while out.len() < len {
            let tail = self.read_tail(cursor)?;
            let take = tail.len().min(len - out.len());
            out.extend_from_slice(&tail[..take]);
            cursor = cursor + take as u64;
        }
        Some(out)
    }
}

fn wanted_private(region: &MemoryRegion, teb: Address) -> bool
{
    region.protection.read || region.protection.execute || region.contains(teb)
}

fn copy_region<C: ProcessController + ?Sized>(
    controller: &C,
    region: &MemoryRegion,
    kind: RegionKind,
    baseline: Option<&PageBaseline>,
) -> SnapshotRegion
{
    let page_count = region.size.div_ceil(PAGE_SIZE) as usize;
    let mut data = vec![0u8; page_count * PAGE_SIZE as usize];
    let mut readable = vec![true; page_count];

    match controller.read_memory(region.base, data.len()) {
        Ok(bytes) => data[..bytes.len()].copy_from_slice(&bytes),
        Err(_) => {
            // Fall back to page granularity and zero-fill what cannot be read.
            for (index, flag) in readable.iter_mut().enumerate() {
                let page = region.base + index as u64 * PAGE_SIZE;
                let offset = index * PAGE_SIZE as usize;
                match controller.read_memory(page, PAGE_SIZE as usize) {
                    Ok(bytes) => data[offset..offset + bytes.len()].copy_from_slice(&bytes),
                    Err(_) => *flag = false,
                }
            }
        }
    }

    let pages = readable
        .iter()
        .enumerate()
        .map(|(index, &page_readable)| {
            let page = region.base + index as u64 * PAGE_SIZE;
            let bytes = &data[index * PAGE_SIZE as usize..(index + 1) * PAGE_SIZE as usize];
            PageInfo {
                protection: region.protection,
                readable: page_readable,
                dirty: baseline.map_or(true, |baseline| baseline.is_dirty(page, bytes)),
            }
        })
        .collect();

    SnapshotRegion {
        base: region.base,
        kind,
        pages,
        data,
    }
}
