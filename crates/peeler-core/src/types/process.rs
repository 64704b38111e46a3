//! Process, thread and module identity types.

use std::fmt;
use std::path::PathBuf;

use super::Address;

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use peeler_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(u32::from(pid), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier as reported by the OS debug events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId
{
    /// Raw numeric identifier.
    #[must_use]
    pub fn raw(self) -> u32
    {
        self.0
    }
}

impl From<u32> for ThreadId
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

/// Instruction set of the target process
///
/// The unpacker only deals with x86 code. A 32-bit target traced from a
/// 64-bit host runs under WOW64 and is still reported as [`Architecture::X86`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 32-bit x86
    X86,
    /// 64-bit x86-64
    X86_64,
}

impl Architecture
{
    /// Width of a pointer (and of an IAT slot) in bytes.
    #[must_use]
    pub const fn pointer_size(self) -> u64
    {
        match self {
            Self::X86 => 4,
            Self::X86_64 => 8,
        }
    }

    /// Bitness as understood by the `iced-x86` decoder.
    #[must_use]
    pub const fn bitness(self) -> u32
    {
        match self {
            Self::X86 => 32,
            Self::X86_64 => 64,
        }
    }

    /// Truncate a value to the architecture's pointer width.
    #[must_use]
    pub const fn mask(self, value: u64) -> u64
    {
        match self {
            Self::X86 => value & 0xffff_ffff,
            Self::X86_64 => value,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::X86 => write!(f, "x86"),
            Self::X86_64 => write!(f, "x86-64"),
        }
    }
}

/// A module (EXE or DLL) mapped into the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo
{
    /// Lower-cased file name, e.g. `kernel32.dll`.
    pub name: String,
    /// Load address.
    pub base: Address,
    /// `SizeOfImage` as mapped.
    pub size: u64,
    /// Full path when the OS reported one.
    pub path: Option<PathBuf>,
}

impl ModuleInfo
{
    /// Create a module record; the name is normalized to lower case.
    #[must_use]
    pub fn new(name: &str, base: Address, size: u64) -> Self
    {
        Self {
            name: name.to_ascii_lowercase(),
            base,
            size,
            path: None,
        }
    }

    /// Check whether `address` lies inside the mapped image.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address.value() < self.base.value().saturating_add(self.size)
    }
}
