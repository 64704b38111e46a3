//! Import resolution over a snapshot captured at the OEP

mod common;

use common::*;
use peeler_core::imports::{self, Confidence, ResolutionMethod};
use peeler_core::snapshot::MemorySnapshot;
use peeler_core::types::Address;

fn snapshot() -> MemorySnapshot
{
    run_to_oep(&mut Scenario::new().full_run()).snapshot
}

fn is_private(slot: u64) -> bool
{
    let table = iat_values();
    let offset = (slot - IAT) as usize;
    let value = u64::from(u32::from_le_bytes(table[offset..offset + 4].try_into().unwrap()));
    (PRIVATE..PRIVATE + 0x1000).contains(&value)
}

#[test]
fn test_every_referenced_slot_is_resolved()
{
    let snapshot = snapshot();
    let table = imports::resolve(&snapshot, &v2_profile());
    let expected = expected_imports();

    assert_eq!(table.len(), expected.len());
    assert_eq!(table.unresolved().count(), 0);
    for (slot, module, name) in expected {
        let entry = table.get(Address::new(slot)).unwrap();
        let symbol = entry.symbol.as_ref().unwrap();
        assert_eq!(symbol.module, module);
        assert_eq!(symbol.name.as_deref(), Some(name));
        assert_eq!(entry.target(), Some(Address::new(api(module, name))));
    }
    // The module separator is not an import.
    assert!(table.get(Address::new(IAT + 0x18)).is_none());
}

#[test]
fn test_cheapest_method_wins()
{
    let snapshot = snapshot();
    let table = imports::resolve(&snapshot, &v2_profile());

    for (slot, _, name) in expected_imports() {
        let entry = table.get(Address::new(slot)).unwrap();
        let method = if is_private(slot) { ResolutionMethod::Emulated } else { ResolutionMethod::Direct };
        assert_eq!(entry.method, method, "{name}");
        assert_eq!(entry.confidence, Confidence::High, "{name}");
    }

    // The `.themida` wrapper is a single push-ret and needs no emulation.
    let create_file = table.get(Address::new(IAT + 8)).unwrap();
    assert_eq!(create_file.original, Address::new(THEMIDA_STUB));
    assert_eq!(create_file.method, ResolutionMethod::Direct);
}

#[test]
fn test_signatures_cover_exhausted_emulation()
{
    let snapshot = snapshot();
    let mut profile = v2_profile();
    profile.max_emulated = 0;
    let table = imports::resolve(&snapshot, &profile);

    let close_handle = table.get(Address::new(IAT + 0x10)).unwrap();
    assert_eq!(close_handle.method, ResolutionMethod::Signature);
    assert_eq!(close_handle.confidence, Confidence::Medium);
    assert_eq!(close_handle.reason.as_deref(), Some("signature push-xor-ret"));
    assert_eq!(close_handle.symbol.as_ref().unwrap().name.as_deref(), Some("CloseHandle"));

    // Every candidate still has an entry; the rest carry a diagnostic.
    assert_eq!(table.len(), expected_imports().len());
    assert_eq!(table.unresolved().count(), 3);
    for entry in table.unresolved() {
        assert_eq!(entry.method, ResolutionMethod::Unresolved);
        assert_eq!(entry.confidence, Confidence::Low);
        assert!(entry.reason.as_deref().unwrap().contains("emulation cap reached"));
    }
}

#[test]
fn test_low_confidence_profile_caps_confidence()
{
    let snapshot = snapshot();
    let mut profile = v2_profile();
    profile.low_confidence = true;
    let table = imports::resolve(&snapshot, &profile);

    assert_eq!(table.unresolved().count(), 0);
    assert!(table.iter().all(|entry| entry.confidence == Confidence::Medium));
}

#[test]
fn test_resolution_is_repeatable()
{
    let snapshot = snapshot();
    let first = imports::resolve(&snapshot, &v2_profile());
    let second = imports::resolve(&snapshot, &v2_profile());
    assert_eq!(first, second);
    assert_eq!(first.symbols().len(), expected_imports().len());
    assert!(first.symbols().contains("user32.dll!ShowWindow"));
}
