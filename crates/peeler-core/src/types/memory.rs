//! Memory region and page protection types.

use std::fmt;

use super::Address;

/// Size of a page on every supported target.
pub const PAGE_SIZE: u64 = 0x1000;

/// Page protection, reduced to the three access bits plus the guard flag
///
/// Conversions to and from the Win32 `PAGE_*` constants live here so that
/// the rest of the engine never deals with the raw encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection
{
    /// Page can be read.
    pub read: bool,
    /// Page can be written.
    pub write: bool,
    /// Page can be executed.
    pub execute: bool,
    /// One-shot guard page.
    pub guard: bool,
}

impl Protection
{
    /// No access at all.
    pub const NONE: Self = Self::new(false, false, false);
    /// Read-only.
    pub const READ: Self = Self::new(true, false, false);
    /// Read-write.
    pub const READ_WRITE: Self = Self::new(true, true, false);
    /// Read-execute.
    pub const READ_EXECUTE: Self = Self::new(true, false, true);
    /// Read-write-execute.
    pub const ALL: Self = Self::new(true, true, true);

    /// Build a protection from its access bits (never a guard page).
    #[must_use]
    pub const fn new(read: bool, write: bool, execute: bool) -> Self
    {
        Self {
            read,
            write,
            execute,
            guard: false,
        }
    }

    /// Same access, with the guard flag set.
    #[must_use]
    pub const fn with_guard(mut self) -> Self
    {
        self.guard = true;
        self
    }

    /// Same access, execute bit cleared.
    #[must_use]
    pub const fn without_execute(mut self) -> Self
    {
        self.execute = false;
        self
    }

    /// Same access bits, guard flag cleared.
    #[must_use]
    pub const fn access(mut self) -> Self
    {
        self.guard = false;
        self
    }

    /// Decode a Win32 `PAGE_*` value.
    #[must_use]
    pub fn from_win32(value: u32) -> Self
    {
        let base = match value & 0xff {
            0x02 => Self::READ,
            0x04 | 0x08 => Self::READ_WRITE,
            0x10 => Self::new(false, false, true),
            0x20 => Self::READ_EXECUTE,
            0x40 | 0x80 => Self::ALL,
            _ => Self::NONE,
        };
        Self {
            guard: value & 0x100 != 0,
            ..base
        }
    }

    /// Encode as a Win32 `PAGE_*` value.
    #[must_use]
    pub fn to_win32(self) -> u32
    {
        let base = match (self.read || self.write, self.write, self.execute) {
            (_, true, true) => 0x40,
            (_, true, false) => 0x04,
            (true, false, true) => 0x20,
            (false, false, true) => 0x10,
            (true, false, false) => 0x02,
            (false, false, false) => 0x01,
        };
        if self.guard {
            base | 0x100
        } else {
            base
        }
    }
}

impl fmt::Display for Protection
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.guard { 'g' } else { '-' },
        )
    }
}

/// How a region was allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind
{
    /// Part of a mapped image (EXE/DLL).
    Image,
    /// Mapped file or section view.
    Mapped,
    /// Private allocation (heap, stack, `VirtualAlloc`).
    Private,
}

/// A committed range of pages with uniform protection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// First address of the region (page aligned).
    pub base: Address,
    /// Size in bytes (page multiple).
    pub size: u64,
    /// Current protection.
    pub protection: Protection,
    /// Allocation type.
    pub kind: RegionKind,
    /// Base of the enclosing allocation (module base for image regions).
    pub allocation_base: Address,
}

impl MemoryRegion
{
    /// One past the last address.
    #[must_use]
    pub fn end(&self) -> Address
    {
        self.base + self.size
    }

    /// Check whether `address` lies in this region.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address < self.end()
    }
}
