//! Static profile records.
//!
//! One record per supported combination of generation, bitness, format and
//! target kind. Managed libraries have no record.

use std::time::Duration;

use once_cell::sync::Lazy;
use smallvec::smallvec;

use super::{
    AntiDebugSite, ApiProbe, BytePattern, EntryPrologue, Heuristic, ProtectorProfile, ProtectorVersion,
    SignatureDecode, StubSignature, TrapKind,
};
use crate::pe::{BinaryFormat, TargetKind};
use crate::types::Architecture;

/// Section names the protector adds to the image.
pub const PROTECTOR_SECTIONS: &[&str] = &[".themida", ".winlice", ".boot", ".vlizer", ".taggant"];

/// APIs the MSVC runtime calls before `main`/`DllMain`.
const CRT_STARTUP_PROBES: &[ApiProbe] = &[
    ApiProbe {
        module: "kernelbase.dll",
        export: "GetSystemTimeAsFileTime",
    },
    ApiProbe {
        module: "kernel32.dll",
        export: "GetSystemTimeAsFileTime",
    },
    ApiProbe {
        module: "kernelbase.dll",
        export: "GetStartupInfoW",
    },
    ApiProbe {
        module: "kernelbase.dll",
        export: "GetCommandLineA",
    },
    ApiProbe {
        module: "kernelbase.dll",
        export: "GetCommandLineW",
    },
];

const MANAGED_ENTRY: &[ApiProbe] = &[ApiProbe {
    module: "mscoree.dll",
    export: "_CorExeMain",
}];

/// `xor eax, eax; ret`
const RETURN_FALSE: &[u8] = &[0x31, 0xC0, 0xC3];

/// `mov eax, [esp+8]; mov dword [eax], 0; mov eax, 1; ret 8`
const CHECK_REMOTE_X86: &[u8] = &[
    0x8B, 0x44, 0x24, 0x08, 0xC7, 0x00, 0x00, 0x00, 0x00, 0x00, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC2, 0x08, 0x00,
];

/// `mov dword [rdx], 0; mov eax, 1; ret`
const CHECK_REMOTE_X64: &[u8] = &[0xC7, 0x02, 0x00, 0x00, 0x00, 0x00, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];

const ANTI_DEBUG: &[AntiDebugSite] = &[
    AntiDebugSite {
        module: "kernelbase.dll",
        export: "IsDebuggerPresent",
        patch_x86: RETURN_FALSE,
        patch_x64: RETURN_FALSE,
    },
    AntiDebugSite {
        module: "kernel32.dll",
        export: "IsDebuggerPresent",
        patch_x86: RETURN_FALSE,
        patch_x64: RETURN_FALSE,
    },
    AntiDebugSite {
        module: "kernelbase.dll",
        export: "CheckRemoteDebuggerPresent",
        patch_x86: CHECK_REMOTE_X86,
        patch_x64: CHECK_REMOTE_X64,
    },
];

/// Per-generation tuning shared by every record of that generation
struct Tuning
{
    timeout: Duration,
    confirmation_steps: u32,
    stack_tolerance: u64,
    max_emulated: usize,
    stub_instruction_limit: usize,
}

const fn tuning(version: ProtectorVersion) -> Tuning
{
    match version {
        ProtectorVersion::V2 => Tuning {
            timeout: Duration::from_secs(10),
            confirmation_steps: 6,
            stack_tolerance: 0x10,
            max_emulated: 2048,
            stub_instruction_limit: 2_000,
        },
        ProtectorVersion::V3 => Tuning {
            timeout: Duration::from_secs(15),
            confirmation_steps: 6,
            stack_tolerance: 0x10,
            max_emulated: 4096,
            stub_instruction_limit: 20_000,
        },
        ProtectorVersion::Generic => Tuning {
            timeout: Duration::from_secs(20),
            confirmation_steps: 8,
            stack_tolerance: 0x40,
            max_emulated: 4096,
            stub_instruction_limit: 20_000,
        },
    }
}

fn entry_prologues(arch: Architecture, kind: TargetKind) -> Vec<EntryPrologue>
{
    match (arch, kind) {
        (Architecture::X86, TargetKind::Exe) => vec![EntryPrologue {
            name: "msvc mainCRTStartup",
            pattern: BytePattern::parse("E8 ?? ?? ?? ?? E9"),
            call_offset: 0,
            stack_adjust: 0,
        }],
        (Architecture::X86_64, TargetKind::Exe) => vec![EntryPrologue {
            name: "msvc mainCRTStartup",
            pattern: BytePattern::parse("48 83 EC 28 E8 ?? ?? ?? ?? 48 83 C4 28 E9"),
            call_offset: 4,
            stack_adjust: 0x28,
        }],
        (Architecture::X86, TargetKind::Dll) => vec![EntryPrologue {
            name: "msvc _DllMainCRTStartup",
            pattern: BytePattern::parse("8B FF 55 8B EC 83 7D 0C 01 75 05 E8"),
            call_offset: 11,
            stack_adjust: 4,
        }],
        (Architecture::X86_64, TargetKind::Dll) => vec![EntryPrologue {
            name: "msvc _DllMainCRTStartup",
            pattern: BytePattern::parse("48 89 5C 24 08 48 89 74 24 10 57 48 83 EC 20 49 8B F8 8B DA 48 8B F1 83 FA 01 75 05 E8"),
            call_offset: 28,
            stack_adjust: 0x28,
        }],
    }
}

fn stub_signatures(arch: Architecture) -> Vec<StubSignature>
{
    match arch {
        Architecture::X86 => vec![
            StubSignature {
                name: "push-xor-ret",
                pattern: BytePattern::parse("68 ?? ?? ?? ?? 81 34 24 ?? ?? ?? ?? C3"),
                decode: SignatureDecode::Xor { value: 1, key: 8 },
            },
            StubSignature {
                name: "push-add-ret",
                pattern: BytePattern::parse("68 ?? ?? ?? ?? 81 04 24 ?? ?? ?? ?? C3"),
                decode: SignatureDecode::Add { value: 1, addend: 8 },
            },
            StubSignature {
                name: "push-sub-ret",
                pattern: BytePattern::parse("68 ?? ?? ?? ?? 81 2C 24 ?? ?? ?? ?? C3"),
                decode: SignatureDecode::Sub {
                    value: 1,
                    subtrahend: 8,
                },
            },
            StubSignature {
                name: "mov-eax-jmp",
                pattern: BytePattern::parse("B8 ?? ?? ?? ?? FF E0"),
                decode: SignatureDecode::Absolute { offset: 1 },
            },
        ],
        Architecture::X86_64 => vec![
            StubSignature {
                name: "mov-rax-jmp",
                pattern: BytePattern::parse("48 B8 ?? ?? ?? ?? ?? ?? ?? ?? FF E0"),
                decode: SignatureDecode::Absolute { offset: 2 },
            },
            StubSignature {
                name: "mov-rax-push-ret",
                pattern: BytePattern::parse("48 B8 ?? ?? ?? ?? ?? ?? ?? ?? 50 C3"),
                decode: SignatureDecode::Absolute { offset: 2 },
            },
        ],
    }
}

fn record(version: ProtectorVersion, architecture: Architecture, format: BinaryFormat, kind: TargetKind) -> ProtectorProfile
{
    let tuning = tuning(version);
    let managed = format == BinaryFormat::DotNet;
    ProtectorProfile {
        version,
        architecture,
        format,
        kind,
        heuristics: if managed {
            smallvec![Heuristic::ManagedEntry]
        } else {
            smallvec![
                Heuristic::SectionTransition,
                Heuristic::ReturnOutsideProtector,
                Heuristic::StackDelta
            ]
        },
        trap: match (managed, architecture) {
            (true, _) => TrapKind::None,
            (false, Architecture::X86) => TrapKind::GuardPage,
            (false, Architecture::X86_64) => TrapKind::NoExecute,
        },
        protector_sections: PROTECTOR_SECTIONS.to_vec(),
        api_probes: if managed { Vec::new() } else { CRT_STARTUP_PROBES.to_vec() },
        managed_entry: if managed { MANAGED_ENTRY.to_vec() } else { Vec::new() },
        entry_prologues: entry_prologues(architecture, kind),
        stub_signatures: stub_signatures(architecture),
        anti_debug: ANTI_DEBUG.to_vec(),
        timeout: tuning.timeout,
        confirmation_steps: if managed { 0 } else { tuning.confirmation_steps },
        stack_tolerance: tuning.stack_tolerance,
        max_emulated: tuning.max_emulated,
        stub_instruction_limit: tuning.stub_instruction_limit,
        low_confidence: version == ProtectorVersion::Generic,
    }
}

static PROFILES: Lazy<Vec<ProtectorProfile>> = Lazy::new(|| {
    let mut profiles = Vec::new();
    for version in [ProtectorVersion::V2, ProtectorVersion::V3, ProtectorVersion::Generic] {
        for architecture in [Architecture::X86, Architecture::X86_64] {
            profiles.push(record(version, architecture, BinaryFormat::Native, TargetKind::Exe));
            profiles.push(record(version, architecture, BinaryFormat::Native, TargetKind::Dll));
            profiles.push(record(version, architecture, BinaryFormat::DotNet, TargetKind::Exe));
        }
    }
    profiles
});

/// Find the record for a combination.
#[must_use]
pub fn lookup(
    version: ProtectorVersion,
    architecture: Architecture,
    format: BinaryFormat,
    kind: TargetKind,
) -> Option<&'static ProtectorProfile>
{
    PROFILES.iter().find(|profile| {
        profile.version == version && profile.architecture == architecture && profile.format == format && profile.kind == kind
    })
}

/// Every record, for diagnostics.
#[must_use]
pub fn all() -> &'static [ProtectorProfile]
{
    &PROFILES
}
