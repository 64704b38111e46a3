//! Software breakpoint bookkeeping.
//!
//! Backends patch `int3` into the target and keep the displaced byte here so
//! that it can be restored for step-over, removal, and memory reads that must
//! not expose the patch. The store does not touch process memory itself.

use std::collections::HashMap;

use crate::types::Address;

/// The x86 `int3` opcode.
pub const INT3: u8 = 0xCC;

/// Unique identifier for a breakpoint managed by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u64);

impl BreakpointId
{
    /// Raw numeric representation (useful for logging).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

/// Lifecycle state of a software breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState
{
    /// `int3` is written to the target.
    Installed,
    /// Original byte is temporarily back in place (step-over in progress).
    Suspended,
}

/// One tracked breakpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointEntry
{
    /// Identifier.
    pub id: BreakpointId,
    /// Patched address.
    pub address: Address,
    /// Byte displaced by the `int3`.
    pub original: u8,
    /// Current state.
    pub state: BreakpointState,
    /// Number of times the breakpoint fired.
    pub hit_count: u64,
}

/// Address-keyed store of software breakpoints
#[derive(Debug, Default)]
pub struct BreakpointStore
{
    next_id: u64,
    by_address: HashMap<Address, BreakpointEntry>,
}

impl BreakpointStore
{
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    fn allocate_id(&mut self) -> BreakpointId
    {
        self.next_id = self.next_id.wrapping_add(1);
        BreakpointId(self.next_id)
    }

    /// Track a breakpoint at `address` whose displaced byte is `original`
    ///
    /// Returns `None` if a breakpoint is already tracked there; callers treat
    /// that as the idempotent no-op case and must not patch memory again.
    pub fn insert(&mut self, address: Address, original: u8) -> Option<BreakpointId>
    {
        if self.by_address.contains_key(&address) {
            return None;
        }
        let id = self.allocate_id();
        self.by_address.insert(
            address,
            BreakpointEntry {
                id,
                address,
                original,
                state: BreakpointState::Installed,
                hit_count: 0,
            },
        );
        Some(id)
    }

    /// Check whether a breakpoint is tracked at `address`.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.by_address.contains_key(&address)
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&BreakpointEntry>
    {
        self.by_address.get(&address)
    }

    /// Stop tracking `address`, returning the entry so the caller can restore memory.
    pub fn remove(&mut self, address: Address) -> Option<BreakpointEntry>
    {
        self.by_address.remove(&address)
    }

    /// Record a hit; returns the updated entry.
    pub fn record_hit(&mut self, address: Address) -> Option<&BreakpointEntry>
    {
        let entry = self.by_address.get_mut(&address)?;
        entry.hit_count = entry.hit_count.saturating_add(1);
        Some(entry)
    }

    /// Replace the saved byte after the target's code was rewritten under the breakpoint.
    pub fn set_original(&mut self, address: Address, original: u8)
    {
        if let Some(entry) = self.by_address.get_mut(&address) {
            entry.original = original;
        }
    }

    /// Mark a breakpoint as installed or suspended.
    pub fn set_state(&mut self, address: Address, state: BreakpointState)
    {
        if let Some(entry) = self.by_address.get_mut(&address) {
            entry.state = state;
        }
    }

    /// Replace patched bytes in `buffer` (read from `start`) with the originals
    ///
    /// Used so that memory reads observe the target's own code rather than
    /// the debugger's `int3` patches.
    pub fn mask(&self, start: Address, buffer: &mut [u8])
    {
        let end = start + buffer.len() as u64;
        for entry in self.by_address.values() {
            if entry.state == BreakpointState::Installed && entry.address >= start && entry.address < end {
                buffer[(entry.address - start) as usize] = entry.original;
            }
        }
    }

    /// Remove every entry, returning them sorted by address.
    pub fn drain(&mut self) -> Vec<BreakpointEntry>
    {
        let mut entries: Vec<_> = self.by_address.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.address);
        entries
    }

    /// Number of tracked breakpoints.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.by_address.len()
    }

    /// Check whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_insert_is_idempotent()
    {
        let mut store = BreakpointStore::new();
        let address = Address::new(0x401000);
        assert!(store.insert(address, 0x55).is_some());
        assert!(store.insert(address, INT3).is_none());
        assert_eq!(store.get(address).map(|e| e.original), Some(0x55));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mask_restores_original_bytes()
    {
        let mut store = BreakpointStore::new();
        store.insert(Address::new(0x1002), 0x8B);
        store.insert(Address::new(0x2000), 0x90);
        let mut buffer = [0x55, 0x89, INT3, 0xEC];
        store.mask(Address::new(0x1000), &mut buffer);
        assert_eq!(buffer, [0x55, 0x89, 0x8B, 0xEC]);
    }

    #[test]
    fn test_suspended_entries_are_not_masked()
    {
        let mut store = BreakpointStore::new();
        let address = Address::new(0x1000);
        store.insert(address, 0x8B);
        store.set_state(address, BreakpointState::Suspended);
        let mut buffer = [0x8B];
        store.mask(address, &mut buffer);
        assert_eq!(buffer, [0x8B]);
    }

    #[test]
    fn test_record_hit_and_drain()
    {
        let mut store = BreakpointStore::new();
        store.insert(Address::new(0x20), 1);
        store.insert(Address::new(0x10), 2);
        assert_eq!(store.record_hit(Address::new(0x20)).map(|e| e.hit_count), Some(1));
        assert!(store.record_hit(Address::new(0x30)).is_none());
        let drained = store.drain();
        assert_eq!(drained[0].address, Address::new(0x10));
        assert!(store.is_empty());
    }
}
