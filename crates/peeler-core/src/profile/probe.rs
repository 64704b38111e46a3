//! Load-time signature probing.
//!
//! Looks only at the file: section names and the bytes at the protector's
//! entry point. Nothing here touches a live process.

use once_cell::sync::Lazy;
use tracing::debug;

use super::{BytePattern, ProtectorVersion};
use crate::pe::TargetFile;

/// Section present only in 3.x images.
const V3_MARKER_SECTION: &str = ".boot";

/// Sections present in every generation.
const PROTECTOR_MARKER_SECTIONS: &[&str] = &[".themida", ".winlice"];

/// Entry stubs of 2.x images: `mov eax, 0; pushad; or eax, eax; je`.
static V2_ENTRY_STUBS: Lazy<Vec<BytePattern>> = Lazy::new(|| {
    vec![
        BytePattern::parse("B8 00 00 00 00 60 0B C0 74"),
        BytePattern::parse("83 EC 50 60 68 ?? ?? ?? ?? E8"),
    ]
});

/// Guess the protector generation of `target`
///
/// Returns `None` when neither section names nor entry bytes are conclusive.
#[must_use]
pub fn detect(target: &TargetFile) -> Option<ProtectorVersion>
{
    let names = target.section_names();
    let has = |wanted: &str| names.iter().any(|name| name.eq_ignore_ascii_case(wanted));

    if has(V3_MARKER_SECTION) {
        debug!("Found {V3_MARKER_SECTION} section, assuming 3.x");
        return Some(ProtectorVersion::V3);
    }
    if V2_ENTRY_STUBS.iter().any(|stub| stub.matches(&target.entry_bytes)) {
        debug!("Entry bytes match a 2.x stub");
        return Some(ProtectorVersion::V2);
    }
    if PROTECTOR_MARKER_SECTIONS.iter().any(|marker| has(marker)) {
        debug!("Found protector section without a 3.x marker, assuming 2.x");
        return Some(ProtectorVersion::V2);
    }
    None
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::pe::{self, BinaryFormat, TargetKind, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ};
    use crate::profile::{select, ProfileRequest};
    use crate::types::Architecture;

    const NT: usize = 0x80;

    /// 32-bit image with one 0x1000 section per name, entry at the first one.
    fn image(names: &[&str], entry: &[u8]) -> Vec<u8>
    {
        let size = 0x1000 * (names.len() + 1);
        let mut data = vec![0u8; size];
        data[..2].copy_from_slice(b"MZ");
        pe::put_u32(&mut data, 0x3c, NT as u32);
        data[NT..NT + 4].copy_from_slice(b"PE\0\0");

        let file_header = NT + 4;
        pe::put_u16(&mut data, file_header, 0x14c);
        pe::put_u16(&mut data, file_header + 2, names.len() as u16);
        pe::put_u16(&mut data, file_header + 16, 0xe0);
        pe::put_u16(&mut data, file_header + 18, 0x0102);

        let optional = file_header + 20;
        pe::put_u16(&mut data, optional, 0x10b);
        pe::put_u32(&mut data, optional + 16, 0x1000);
        pe::put_u32(&mut data, optional + 28, 0x40_0000);
        pe::put_u32(&mut data, optional + 32, 0x1000);
        pe::put_u32(&mut data, optional + 36, 0x1000);
        pe::put_u32(&mut data, optional + 56, size as u32);
        pe::put_u32(&mut data, optional + 60, 0x1000);
        pe::put_u32(&mut data, optional + 92, 16);

        let table = optional + 0xe0;
        for (index, name) in names.iter().enumerate() {
            let header = table + index * pe::SECTION_HEADER_SIZE;
            let rva = 0x1000 * (index as u32 + 1);
            data[header..header + name.len()].copy_from_slice(name.as_bytes());
            pe::put_u32(&mut data, header + 8, 0x1000);
            pe::put_u32(&mut data, header + 12, rva);
            pe::put_u32(&mut data, header + 16, 0x1000);
            pe::put_u32(&mut data, header + 20, rva);
            pe::put_u32(&mut data, header + 36, IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ);
        }
        data[0x1000..0x1000 + entry.len()].copy_from_slice(entry);
        data
    }

    fn detect_in(names: &[&str], entry: &[u8]) -> Option<ProtectorVersion>
    {
        detect(&TargetFile::from_bytes(&image(names, entry)).unwrap())
    }

    const V2_STUB: &[u8] = &[0xB8, 0x00, 0x00, 0x00, 0x00, 0x60, 0x0B, 0xC0, 0x74, 0x02];
    const PLAIN_ENTRY: &[u8] = &[0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10];

    #[test]
    fn test_boot_section_means_v3()
    {
        assert_eq!(detect_in(&[".text", ".themida", ".boot"], PLAIN_ENTRY), Some(ProtectorVersion::V3));
        // The marker wins over a 2.x entry stub.
        assert_eq!(detect_in(&[".text", ".boot"], V2_STUB), Some(ProtectorVersion::V3));
    }

    #[test]
    fn test_entry_stub_means_v2()
    {
        assert_eq!(detect_in(&["", ".rsrc"], V2_STUB), Some(ProtectorVersion::V2));

        let mut sub_esp = vec![0x83, 0xEC, 0x50, 0x60, 0x68, 0x11, 0x22, 0x33, 0x44, 0xE8];
        sub_esp.extend_from_slice(&[0; 4]);
        assert_eq!(detect_in(&[".text"], &sub_esp), Some(ProtectorVersion::V2));
    }

    #[test]
    fn test_protector_section_alone_means_v2()
    {
        assert_eq!(detect_in(&[".text", ".themida"], PLAIN_ENTRY), Some(ProtectorVersion::V2));
        assert_eq!(detect_in(&[".text", ".WINLICE"], PLAIN_ENTRY), Some(ProtectorVersion::V2));
    }

    #[test]
    fn test_unmarked_image_selects_generic()
    {
        let target = TargetFile::from_bytes(&image(&[".text", ".rdata"], PLAIN_ENTRY)).unwrap();
        let probed = detect(&target);
        assert_eq!(probed, None);

        let profile = select(&ProfileRequest {
            declared: None,
            probed,
            architecture: target.headers.architecture,
            format: target.headers.format,
            kind: target.headers.kind,
        })
        .unwrap();
        assert_eq!(profile.version, ProtectorVersion::Generic);
        assert_eq!(profile.architecture, Architecture::X86);
        assert_eq!((profile.format, profile.kind), (BinaryFormat::Native, TargetKind::Exe));
        assert!(profile.low_confidence);
    }
}
