//! Individual OEP heuristics.
//!
//! Each function looks at one observation (registers plus a read-only view of
//! memory) and returns a verdict or a derived address. None of them keeps
//! state; the detector owns sequencing.

use tracing::{debug, warn};

use crate::controller::MemoryView;
use crate::pe::PeHeaders;
use crate::profile::ProtectorProfile;
use crate::types::{Address, Architecture, Registers};

/// How many stack slots the call-site walk inspects.
const STACK_WALK_SLOTS: u64 = 512;

/// Outcome of a filtering heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict
{
    /// The observation supports the candidate.
    Match,
    /// The observation contradicts the candidate.
    Reject,
    /// Not enough information.
    Abstain,
}

/// Address ranges of the mapped target, split by owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout
{
    /// Module base.
    pub base: Address,
    /// `SizeOfImage`.
    pub size: u64,
    /// Protector entry point (the header entry at load time).
    pub entry: Address,
    /// First byte after the headers.
    pub headers_end: Address,
    /// Ranges of protector-owned sections.
    pub protector: Vec<(Address, Address)>,
    /// Ranges of the remaining sections, in table order.
    pub original: Vec<(Address, Address)>,
}

impl ImageLayout
{
    /// Read the headers of the module at `base` and classify its sections.
    #[must_use]
    pub fn read(view: &dyn MemoryView, base: Address, profile: &ProtectorProfile) -> Option<Self>
    {
        let header = view.read_bytes(base, 0x1000)?;
        let headers = match PeHeaders::parse(&header) {
            Ok(headers) => headers,
            Err(e) => {
                warn!("Target header at {base} is unreadable: {e}");
                return None;
            }
        };
        let mut protector = Vec::new();
        let mut original = Vec::new();
        for section in &headers.sections {
            let span = u64::from(section.virtual_size.max(section.raw_size));
            if span == 0 {
                continue;
            }
            let range = (base + u64::from(section.rva), base + u64::from(section.rva) + span);
            if profile.is_protector_section(&section.name) {
                protector.push(range);
            } else {
                original.push(range);
            }
        }
        Some(Self {
            base,
            size: u64::from(headers.size_of_image),
            entry: base + u64::from(headers.entry_rva),
            headers_end: base + u64::from(headers.size_of_headers.max(1)),
            protector,
            original,
        })
    }

    /// Whether `address` lies in the mapped image.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address < self.base + self.size
    }

    /// Whether `address` is inside a protector section.
    #[must_use]
    pub fn is_protector(&self, address: Address) -> bool
    {
        self.protector.iter().any(|&(start, end)| address >= start && address < end)
    }

    /// Whether `address` is original code: inside the image, past the headers,
    /// and outside every protector section.
    #[must_use]
    pub fn is_original(&self, address: Address) -> bool
    {
        self.contains(address) && address >= self.headers_end && !self.is_protector(address)
    }

    /// Range covered by the execution trap: the first original section.
    #[must_use]
    pub fn trap_range(&self) -> Option<(Address, u64)>
    {
        self.original.first().map(|&(start, end)| (start, end - start))
    }

    /// RVA of `address`, if it is inside the image.
    #[must_use]
    pub fn rva(&self, address: Address) -> Option<u32>
    {
        if self.contains(address) {
            address.rva_from(self.base)
        } else {
            None
        }
    }
}

/// Compare a stack pointer with the one recorded at the protector entry.
#[must_use]
pub fn stack_delta(entry_sp: Option<Address>, sp: Address, tolerance: u64) -> Verdict
{
    let Some(entry_sp) = entry_sp else {
        return Verdict::Abstain;
    };
    if entry_sp.value().abs_diff(sp.value()) <= tolerance {
        Verdict::Match
    } else {
        Verdict::Reject
    }
}

/// Entry point derived from a call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSiteEntry
{
    /// Start of the compiler entry stub.
    pub entry: Address,
    /// Stack pointer the stub had on entry.
    pub sp: Address,
}

/// Derive the original entry point from the stack of a CRT startup API call
///
/// Walks up the stack looking for return addresses into original code whose
/// call site sits at a known offset inside a known entry stub. The outermost
/// such frame wins, since the entry stub is the bottom of the CRT call chain.
#[must_use]
pub fn return_outside_protector(
    view: &dyn MemoryView,
    layout: &ImageLayout,
    registers: &Registers,
    profile: &ProtectorProfile,
) -> Option<CallSiteEntry>
{
    let arch = profile.architecture;
    let ptr = arch.pointer_size();
    let sp = registers.sp();
    if profile.entry_prologues.is_empty() {
        return None;
    }

    let mut found = None;
    for index in 0..STACK_WALK_SLOTS {
        let slot = sp + index * ptr;
        let Some(value) = view.read_pointer(slot, arch) else {
            break;
        };
        let value = Address::new(value);
        if !layout.is_original(value) {
            continue;
        }
        for prologue in &profile.entry_prologues {
            let Some(entry) = value.checked_sub(5 + prologue.call_offset) else {
                continue;
            };
            if !layout.is_original(entry) {
                continue;
            }
            let Some(bytes) = view.read_bytes(entry, prologue.pattern.len()) else {
                continue;
            };
            if prologue.pattern.matches(&bytes) {
                debug!("Return address {value} at {slot} matches {} at {entry}", prologue.name);
                found = Some(CallSiteEntry {
                    entry,
                    sp: slot + ptr + prologue.stack_adjust,
                });
            }
        }
    }
    found
}

/// Find the assembly's native entry stub, `jmp [slot]` with `slot` holding `runtime_entry`.
#[must_use]
pub fn managed_entry_stub(view: &dyn MemoryView, layout: &ImageLayout, arch: Architecture, runtime_entry: Address) -> Option<Address>
{
    for &(start, end) in &layout.original {
        let Some(bytes) = view.read_bytes(start, (end - start) as usize) else {
            continue;
        };
        for offset in 0..bytes.len().saturating_sub(5) {
            if bytes[offset] != 0xFF || bytes[offset + 1] != 0x25 {
                continue;
            }
            let operand = u32::from_le_bytes([bytes[offset + 2], bytes[offset + 3], bytes[offset + 4], bytes[offset + 5]]);
            let stub = start + offset as u64;
            let slot = match arch {
                Architecture::X86 => Address::new(u64::from(operand)),
                Architecture::X86_64 => Address::new((stub.value() + 6).wrapping_add_signed(i64::from(operand as i32))),
            };
            if view.read_pointer(slot, arch) == Some(runtime_entry.value()) {
                return Some(stub);
            }
        }
    }
    None
}

/// Writes that hide the debugger from PEB-based checks
///
/// Clears `BeingDebugged`, the heap-checking bits of `NtGlobalFlag`, and
/// resets the process heap's `Flags`/`ForceFlags` to their non-debug values.
/// Fields that cannot be read are skipped.
#[must_use]
pub fn peb_patches(view: &dyn MemoryView, peb: Address, arch: Architecture) -> Vec<(Address, Vec<u8>)>
{
    const HEAP_DEBUG_FLAGS: u32 = 0x70;
    let (global_flag, process_heap, heap_flags, heap_force_flags) = match arch {
        Architecture::X86 => (0x68, 0x18, 0x40, 0x44),
        Architecture::X86_64 => (0xBC, 0x30, 0x70, 0x74),
    };

    let mut writes = vec![(peb + 2, vec![0u8])];
    if let Some(flags) = view.read_u32(peb + global_flag) {
        writes.push((peb + global_flag, (flags & !HEAP_DEBUG_FLAGS).to_le_bytes().to_vec()));
    }
    if let Some(heap) = view.read_pointer(peb + process_heap, arch).filter(|&heap| heap != 0) {
        let heap = Address::new(heap);
        writes.push((heap + heap_flags, 2u32.to_le_bytes().to_vec()));
        writes.push((heap + heap_force_flags, 0u32.to_le_bytes().to_vec()));
    }
    writes
}

#[cfg(test)]
mod tests
{
    use std::collections::BTreeMap;

    use super::*;
    use crate::pe::{BinaryFormat, TargetKind};
    use crate::profile::{table, ProtectorVersion};

    /// Sparse byte map for tests
    #[derive(Default)]
    struct Sparse(BTreeMap<u64, u8>);

    impl Sparse
    {
        fn put(&mut self, address: u64, bytes: &[u8])
        {
            for (i, b) in bytes.iter().enumerate() {
                self.0.insert(address + i as u64, *b);
            }
        }
    }

    impl MemoryView for Sparse
    {
        fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>>
        {
            (0..len as u64).map(|i| self.0.get(&(address.value() + i)).copied()).collect()
        }
    }

    fn layout() -> ImageLayout
    {
        ImageLayout {
            base: Address::new(0x40_0000),
            size: 0x10000,
            entry: Address::new(0x40_8000),
            headers_end: Address::new(0x40_1000),
            protector: vec![(Address::new(0x40_8000), Address::new(0x41_0000))],
            original: vec![
                (Address::new(0x40_1000), Address::new(0x40_4000)),
                (Address::new(0x40_4000), Address::new(0x40_8000)),
            ],
        }
    }

    fn x86_profile() -> ProtectorProfile
    {
        table::lookup(ProtectorVersion::V2, Architecture::X86, BinaryFormat::Native, TargetKind::Exe)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_layout_classification()
    {
        let layout = layout();
        assert!(layout.is_original(Address::new(0x40_1234)));
        assert!(!layout.is_original(Address::new(0x40_0100)));
        assert!(!layout.is_original(Address::new(0x40_8010)));
        assert!(!layout.is_original(Address::new(0x50_0000)));
        assert_eq!(layout.trap_range(), Some((Address::new(0x40_1000), 0x3000)));
        assert_eq!(layout.rva(Address::new(0x40_1234)), Some(0x1234));
    }

    #[test]
    fn test_stack_delta_tolerance()
    {
        let entry = Some(Address::new(0x19_ff80));
        assert_eq!(stack_delta(entry, Address::new(0x19_ff84), 0x10), Verdict::Match);
        assert_eq!(stack_delta(entry, Address::new(0x19_fe00), 0x10), Verdict::Reject);
        assert_eq!(stack_delta(None, Address::new(0x19_fe00), 0x10), Verdict::Abstain);
    }

    #[test]
    fn test_outermost_call_site_wins()
    {
        let mut memory = Sparse::default();
        // Entry stub at 0x401500: call ___security_init_cookie; jmp ___tmainCRTStartup
        memory.put(0x40_1500, &[0xE8, 0x10, 0x00, 0x00, 0x00, 0xE9, 0x20, 0x00, 0x00, 0x00]);
        // A decoy stub-shaped sequence deeper in the stack.
        memory.put(0x40_2000, &[0xE8, 0x00, 0x00, 0x00, 0x00, 0xE9, 0x00, 0x00, 0x00, 0x00]);
        let sp = 0x19_fe00u64;
        let slots: [u32; 4] = [0x7700_1234, 0x40_2005, 0x1111, 0x40_1505];
        for (i, value) in slots.iter().enumerate() {
            memory.put(sp + 4 * i as u64, &value.to_le_bytes());
        }
        let registers = Registers::at(Address::new(0x7600_0000), Address::new(sp));

        let hit = return_outside_protector(&memory, &layout(), &registers, &x86_profile()).unwrap();
        assert_eq!(hit.entry, Address::new(0x40_1500));
        assert_eq!(hit.sp, Address::new(sp + 12 + 4));
    }

    #[test]
    fn test_managed_stub_x86()
    {
        let mut memory = Sparse::default();
        let mut code = vec![0u8; 0x3000];
        code[0x200..0x206].copy_from_slice(&[0xFF, 0x25, 0x00, 0x20, 0x40, 0x00]);
        memory.put(0x40_1000, &code);
        memory.put(0x40_4000, &vec![0u8; 0x4000]);
        memory.put(0x40_2000, &0x7900_1000u32.to_le_bytes());

        let stub = managed_entry_stub(&memory, &layout(), Architecture::X86, Address::new(0x7900_1000));
        assert_eq!(stub, Some(Address::new(0x40_1200)));
        assert_eq!(managed_entry_stub(&memory, &layout(), Architecture::X86, Address::new(0x1234)), None);
    }

    #[test]
    fn test_peb_patches_clear_debug_state()
    {
        let mut memory = Sparse::default();
        let peb = 0x7ffd_e000u64;
        memory.put(peb + 0x68, &0x70u32.to_le_bytes());
        memory.put(peb + 0x18, &0x0050_0000u32.to_le_bytes());

        let writes = peb_patches(&memory, Address::new(peb), Architecture::X86);
        assert_eq!(writes[0], (Address::new(peb + 2), vec![0]));
        assert_eq!(writes[1], (Address::new(peb + 0x68), vec![0, 0, 0, 0]));
        assert_eq!(writes[2].0, Address::new(0x0050_0040));
        assert_eq!(writes[3], (Address::new(0x0050_0044), vec![0, 0, 0, 0]));
    }
}
