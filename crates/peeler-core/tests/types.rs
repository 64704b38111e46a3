//! Tests for platform-agnostic types

use peeler_core::types::{
    Address, Architecture, Gpr, MemoryRegion, ModuleInfo, ProcessId, Protection, RegionKind, Registers, PAGE_SIZE,
};

#[test]
fn test_process_id_round_trip()
{
    let pid = ProcessId::from(12345);
    assert_eq!(pid.0, 12345);
    let value: u32 = pid.into();
    assert_eq!(value, 12345);
    assert_eq!(pid.to_string(), "12345");
}

#[test]
fn test_address_arithmetic()
{
    let base = Address::new(0x40_0000);
    let entry = base + 0x1234;
    assert_eq!(entry - base, 0x1234);
    assert_eq!(entry.rva_from(base), Some(0x1234));
    assert_eq!(base.rva_from(entry), None);
    assert_eq!(entry.page_floor(PAGE_SIZE), Address::new(0x40_1000));
    assert_eq!(format!("{entry}"), "0x401234");
    assert!(Address::ZERO.is_null());
}

#[test]
fn test_rva_must_fit_in_32_bits()
{
    let base = Address::new(0x1_0000_0000);
    assert_eq!(Address::new(0x2_0000_0000).rva_from(base), None);
}

#[test]
fn test_registers_at()
{
    let regs = Registers::at(Address::new(0x40_1000), Address::new(0x19_ff80));
    assert_eq!(regs.pc, Address::new(0x40_1000));
    assert_eq!(regs.sp(), Address::new(0x19_ff80));
    assert_eq!(regs.get(Gpr::Rax), 0);
    assert_eq!(regs.flags, 0);
}

#[test]
fn test_protection_win32_round_trip()
{
    for protection in [
        Protection::READ,
        Protection::READ_WRITE,
        Protection::READ_EXECUTE,
        Protection::ALL,
        Protection::READ_EXECUTE.with_guard(),
    ] {
        assert_eq!(Protection::from_win32(protection.to_win32()), protection);
    }
    assert_eq!(Protection::from_win32(0x120), Protection::READ_EXECUTE.with_guard());
    assert_eq!(Protection::ALL.without_execute(), Protection::READ_WRITE);
    assert_eq!(Protection::READ.with_guard().to_string(), "r--g");
}

#[test]
fn test_memory_region_bounds()
{
    let region = MemoryRegion {
        base: Address::new(0x1000),
        size: 0x2000,
        protection: Protection::READ_WRITE,
        kind: RegionKind::Private,
        allocation_base: Address::new(0x1000),
    };
    assert_eq!(region.end(), Address::new(0x3000));
    assert!(region.contains(Address::new(0x2fff)));
    assert!(!region.contains(Address::new(0x3000)));
}

#[test]
fn test_module_names_are_lower_case()
{
    let module = ModuleInfo::new("KERNEL32.DLL", Address::new(0x7600_0000), 0x10_0000);
    assert_eq!(module.name, "kernel32.dll");
    assert!(module.contains(Address::new(0x760f_ffff)));
    assert!(!module.contains(Address::new(0x7610_0000)));
}

#[test]
fn test_architecture_widths()
{
    assert_eq!(Architecture::X86.pointer_size(), 4);
    assert_eq!(Architecture::X86_64.bitness(), 64);
    assert_eq!(Architecture::X86.mask(0x1_2345_6789), 0x2345_6789);
    assert_eq!(Architecture::X86_64.to_string(), "x86-64");
}
