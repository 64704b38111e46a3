//! Copy-on-write memory for a stub session.

use fxhash::FxHashMap;

use crate::snapshot::MemorySnapshot;
use crate::types::{Address, PAGE_SIZE};

/// Pages written during emulation, layered over read-only snapshot memory
///
/// Reads prefer the overlay, then fall back to the snapshot. Writes copy the
/// snapshot page into the overlay first. Nothing ever reaches the snapshot.
#[derive(Debug, Clone)]
pub struct Overlay<'a>
{
    base: &'a MemorySnapshot,
    pages: FxHashMap<u64, Box<[u8]>>,
}

impl<'a> Overlay<'a>
{
    pub fn new(base: &'a MemorySnapshot) -> Self
    {
        Self {
            base,
            pages: FxHashMap::default(),
        }
    }

    /// Map zeroed pages covering `[address, address + len)`.
    pub fn map_zeroed(&mut self, address: Address, len: u64)
    {
        let mut page = address.page_floor(PAGE_SIZE).value();
        while page < address.value() + len {
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page += PAGE_SIZE;
        }
    }

    fn read_byte(&self, address: u64) -> Option<u8>
    {
        let page = address & !(PAGE_SIZE - 1);
        let offset = (address - page) as usize;
        if let Some(bytes) = self.pages.get(&page) {
            return Some(bytes[offset]);
        }
        let info = self.base.page(Address::new(address))?;
        if !info.readable {
            return None;
        }
        self.base.read_slice(Address::new(address), 1).map(|b| b[0])
    }

    /// Fill `buf` from `address`, `None` if any byte is unmapped.
    pub fn read(&self, address: Address, buf: &mut [u8]) -> Option<()>
    {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_byte(address.value().wrapping_add(i as u64))?;
        }
        Some(())
    }

    /// Read a little-endian integer of `size` bytes, `None` past 8 bytes.
    pub fn read_int(&self, address: Address, size: usize) -> Option<u64>
    {
        let mut buf = [0u8; 8];
        self.read(address, buf.get_mut(..size)?)?;
        Some(u64::from_le_bytes(buf))
    }

    /// Up to `max` bytes starting at `address`, stopping at the first unmapped byte.
    pub fn fetch(&self, address: Address, max: usize) -> Vec<u8>
    {
        (0..max as u64)
            .map_while(|i| self.read_byte(address.value().wrapping_add(i)))
            .collect()
    }

    /// Write `data`, `None` when a destination page is mapped nowhere.
    pub fn write(&mut self, address: Address, data: &[u8]) -> Option<()>
    {
        for (i, &byte) in data.iter().enumerate() {
            let target = address.value().wrapping_add(i as u64);
            let page = target & !(PAGE_SIZE - 1);
            if !self.pages.contains_key(&page) {
                let copy = self.base.read_slice(Address::new(page), PAGE_SIZE as usize)?.to_vec();
                self.pages.insert(page, copy.into_boxed_slice());
            }
            let bytes = self.pages.get_mut(&page)?;
            bytes[(target - page) as usize] = byte;
        }
        Some(())
    }

    /// Write the low `size` bytes of `value`, `None` past 8 bytes.
    pub fn write_int(&mut self, address: Address, value: u64, size: usize) -> Option<()>
    {
        self.write(address, value.to_le_bytes().get(..size)?)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::snapshot::SnapshotRegion;
    use crate::types::{Architecture, ModuleInfo, Protection, RegionKind, Registers, ThreadId};

    fn snapshot() -> MemorySnapshot
    {
        MemorySnapshot {
            architecture: Architecture::X86,
            target: ModuleInfo::new("target.exe", Address::new(0x40_0000), 0x2000),
            regions: vec![SnapshotRegion::uniform(
                Address::new(0x40_1000),
                RegionKind::Image,
                Protection::READ_EXECUTE,
                (0..=255).collect(),
            )],
            registers: Registers::default(),
            thread: ThreadId(1),
            teb: Address::ZERO,
            peb: Address::ZERO,
            modules: Vec::new(),
        }
    }

    #[test]
    fn test_writes_stay_in_overlay()
    {
        let snapshot = snapshot();
        let mut overlay = Overlay::new(&snapshot);
        overlay.write_int(Address::new(0x40_1000), 0xdead_beef, 4).unwrap();

        assert_eq!(overlay.read_int(Address::new(0x40_1000), 4), Some(0xdead_beef));
        assert_eq!(overlay.read_int(Address::new(0x40_1004), 2), Some(0x0504));
        assert_eq!(snapshot.read_slice(Address::new(0x40_1000), 1), Some(&[0u8][..]));
    }

    #[test]
    fn test_wide_operands_are_refused()
    {
        let snapshot = snapshot();
        let mut overlay = Overlay::new(&snapshot);

        assert_eq!(overlay.read_int(Address::new(0x40_1000), 16), None);
        assert_eq!(overlay.write_int(Address::new(0x40_1000), 1, 16), None);
        assert_eq!(overlay.read_int(Address::new(0x40_1000), 8), Some(0x0706_0504_0302_0100));
    }
}
