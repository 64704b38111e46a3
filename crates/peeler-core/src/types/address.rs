//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed virtual address in the target process
///
/// Wraps a `u64` so that addresses are not mixed up with sizes, RVAs or
/// counts. 32-bit targets use the low half; the arithmetic is the same.
///
/// ## Example
///
/// ```rust
/// use peeler_core::types::Address;
///
/// let base = Address::new(0x40_0000);
/// let entry = base + 0x1234;
/// assert_eq!(entry.rva_from(base), Some(0x1234));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address
    pub const ZERO: Self = Address(0);

    /// Create a new address from a raw value (usable in const contexts).
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Relative virtual address of `self` inside an image mapped at `base`
    ///
    /// Returns `None` when the address lies below the base or the distance does
    /// not fit in a 32-bit RVA.
    #[must_use]
    pub fn rva_from(self, base: Address) -> Option<u32>
    {
        self.0.checked_sub(base.0).and_then(|delta| u32::try_from(delta).ok())
    }

    /// Round down to the containing page.
    #[must_use]
    pub const fn page_floor(self, page_size: u64) -> Self
    {
        Address(self.0 & !(page_size - 1))
    }

    /// Check whether this address is null.
    #[must_use]
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(addr: Address) -> Self
    {
        addr.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Self;

    fn add(self, offset: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(offset))
    }
}

impl Sub<u64> for Address
{
    type Output = Self;

    fn sub(self, offset: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(offset))
    }
}

impl Sub<Address> for Address
{
    type Output = u64;

    fn sub(self, other: Address) -> Self::Output
    {
        self.0.wrapping_sub(other.0)
    }
}
