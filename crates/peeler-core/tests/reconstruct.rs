//! Rebuilding a loadable image from the OEP snapshot

mod common;

use common::*;
use object::read::pe::PeFile32;
use object::{Object, ObjectSection};
use peeler_core::error::UnpackError;
use peeler_core::imports::{self, ImportTable};
use peeler_core::pe::{self, directory, PeHeaders};
use peeler_core::reconstruct::{self, ReconstructedImage};
use peeler_core::snapshot::MemorySnapshot;
use peeler_core::types::Address;

fn snapshot() -> MemorySnapshot
{
    run_to_oep(&mut Scenario::new().full_run()).snapshot
}

fn rebuild(snapshot: &MemorySnapshot) -> ReconstructedImage
{
    let table = imports::resolve(snapshot, &v2_profile());
    reconstruct::build(snapshot, Address::new(OEP), &table).unwrap()
}

#[test]
fn test_output_parses_with_rebuilt_imports()
{
    let image = rebuild(&snapshot());
    let file = PeFile32::parse(&*image.bytes).unwrap();

    let mut imported: Vec<(String, String)> = file
        .imports()
        .unwrap()
        .iter()
        .map(|import| {
            (
                String::from_utf8_lossy(import.library()).into_owned(),
                String::from_utf8_lossy(import.name()).into_owned(),
            )
        })
        .collect();
    imported.sort();
    let mut expected: Vec<(String, String)> = expected_imports()
        .into_iter()
        .map(|(_, module, name)| (module.to_string(), name.to_string()))
        .collect();
    expected.sort();
    assert_eq!(imported, expected);

    let section = file.section_by_name(".imports").unwrap();
    assert_eq!(section.address(), BASE + 0x5000);
    assert!(file.section_by_name(".text").is_some());
}

#[test]
fn test_header_points_at_oep()
{
    let image = rebuild(&snapshot());
    let headers = PeHeaders::parse(&image.bytes).unwrap();

    assert_eq!(image.entry_rva, OEP_RVA);
    assert_eq!(headers.entry_rva, OEP_RVA);
    assert_eq!(headers.image_base, BASE);
    assert_eq!(headers.size_of_image as usize, image.bytes.len());
    assert_eq!(headers.file_alignment, headers.section_alignment);
    assert_eq!(headers.sections.len(), image.sections.len());
    assert_eq!(headers.directories[directory::SECURITY], (0, 0));
    assert_eq!(headers.directories[directory::BOUND_IMPORT], (0, 0));
    assert_eq!(headers.directory(directory::SECURITY), None);

    let (import_rva, import_size) = headers.directory(directory::IMPORT).unwrap();
    assert_eq!(import_rva, 0x5000);
    // Two descriptors plus the terminator.
    assert_eq!(import_size, 3 * 20);
    assert_eq!(headers.directory(directory::IAT), Some((0x2000, 0x2c)));
}

#[test]
fn test_sections_follow_page_protections()
{
    let image = rebuild(&snapshot());
    let names: Vec<_> = image.sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, [".text", ".rdata", ".themida", ".imports"]);

    let text = &image.sections[0];
    assert_eq!((text.rva, text.size), (0x1000, 0x1000));
    assert!(text.is_executable());
    // Unpacked after the module was mapped.
    assert!(text.dirty);
    assert!(!image.sections[1].is_executable());
    assert_eq!(image.sections[2].size, 0x2000);

    // Raw offsets equal RVAs, so the code is where it ran.
    let code = oep_code();
    assert_eq!(&image.bytes[0x1000..0x1000 + code.len()], code.as_slice());
}

#[test]
fn test_slots_hold_lookup_entries()
{
    let image = rebuild(&snapshot());
    assert_eq!(image.imports.len(), 2);
    assert_eq!(image.imported_thunks(), 10);
    assert!(image.unrecoverable.is_empty());

    let kernel32 = &image.imports[0];
    assert_eq!(kernel32.name, "kernel32.dll");
    assert_eq!(kernel32.first_thunk, 0x2000);
    assert_eq!(kernel32.thunks.len(), 6);
    assert_eq!(image.imports[1].first_thunk, 0x201c);

    // The slot holds the RVA of its hint/name entry.
    let hint_name = pe::get_u32(&image.bytes, 0x2000).unwrap() as usize;
    let name = &image.bytes[hint_name + 2..hint_name + 2 + "GetModuleHandleA".len() + 1];
    assert_eq!(name, b"GetModuleHandleA\0");
}

#[test]
fn test_unresolved_slots_split_descriptors()
{
    let snapshot = snapshot();
    let mut profile = v2_profile();
    profile.max_emulated = 0;
    let table = imports::resolve(&snapshot, &profile);
    let image = reconstruct::build(&snapshot, Address::new(OEP), &table).unwrap();

    assert_eq!(image.unrecoverable.len(), 3);
    let read_file = &image.unrecoverable[0];
    assert_eq!(read_file.rva, 0x200c);
    assert_eq!(read_file.value, Address::new(PRIVATE));
    assert!(read_file.reason.contains("emulation cap reached"));
    // The slot keeps its OEP-time value.
    assert_eq!(pe::get_u32(&image.bytes, 0x200c), Some(PRIVATE as u32));

    let firsts: Vec<_> = image.imports.iter().map(|m| (m.name.as_str(), m.first_thunk)).collect();
    assert_eq!(
        firsts,
        [
            ("kernel32.dll", 0x2000),
            ("kernel32.dll", 0x2010),
            ("user32.dll", 0x201c),
            ("user32.dll", 0x2024),
        ]
    );
    assert_eq!(image.imported_thunks(), 7);

    // The same slots are listed at the end of the import section.
    let list = image.unresolved_rva.unwrap() as usize;
    assert_eq!(&image.bytes[list..list + 8], reconstruct::UNRESOLVED_TAG);
    assert_eq!(pe::get_u32(&image.bytes, list + 8), Some(3));
    assert_eq!(pe::get_u32(&image.bytes, list + 16), Some(0x200c));
    assert_eq!(pe::get_u32(&image.bytes, list + 24), Some(PRIVATE as u32));
}

#[test]
fn test_empty_import_table_leaves_directory_clear()
{
    let snapshot = snapshot();
    let image = reconstruct::build(&snapshot, Address::new(OEP), &ImportTable::empty()).unwrap();
    let headers = PeHeaders::parse(&image.bytes).unwrap();

    assert!(image.imports.is_empty());
    assert_eq!(headers.directories[directory::IMPORT], (0, 0));
    assert!(image.sections.iter().all(|s| s.name != ".imports"));
    assert_eq!(image.unresolved_rva, None);
}

#[test]
fn test_bogus_oep_is_rejected()
{
    let snapshot = snapshot();
    let table = ImportTable::empty();

    for oep in [BASE + 0x2010, BASE + 0x10, BASE + IMAGE_SIZE + 0x1000, 0x1000] {
        let result = reconstruct::build(&snapshot, Address::new(oep), &table);
        assert!(matches!(result, Err(UnpackError::Reconstruction(_))), "0x{oep:x}");
    }
}

#[test]
fn test_protector_code_is_not_an_oep()
{
    let snapshot = snapshot();
    let table = ImportTable::empty();

    for oep in [ENTRY, THEMIDA_STUB] {
        match reconstruct::build(&snapshot, Address::new(oep), &table) {
            Err(UnpackError::Reconstruction(message)) => assert!(message.contains(".themida"), "{message}"),
            other => panic!("0x{oep:x} accepted: {other:?}"),
        }
    }
}

#[test]
fn test_zero_padding_is_not_an_oep()
{
    let snapshot = snapshot();
    // Executable, decodes as `add [eax], al`, but nothing was ever written there.
    let padding = BASE + 0x1ff0;
    assert!(snapshot.is_executable(Address::new(padding)));

    match reconstruct::build(&snapshot, Address::new(padding), &ImportTable::empty()) {
        Err(UnpackError::Reconstruction(message)) => assert!(message.contains("padding"), "{message}"),
        other => panic!("padding accepted: {other:?}"),
    }
    // Code a few bytes into the function is still fine.
    assert!(reconstruct::build(&snapshot, Address::new(OEP + 3), &ImportTable::empty()).is_ok());
}
