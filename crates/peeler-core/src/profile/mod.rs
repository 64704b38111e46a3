//! # Protector Profiles
//!
//! A [`ProtectorProfile`] is the immutable bundle of protector-specific
//! knowledge for one combination of protector generation, bitness, binary
//! format and target kind. Every component downstream of the selector reads
//! its parameters from the profile instead of branching on the version.
//!
//! Profiles are plain data. The records live in [`table`]; [`probe`] guesses
//! the generation from load-time signatures; [`select`] ties the two together.

pub mod probe;
pub mod table;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{info, warn};

use crate::error::{Result, UnpackError};
use crate::pe::{BinaryFormat, TargetKind};
use crate::types::Architecture;

/// Protector generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectorVersion
{
    /// 2.x series
    V2,
    /// 3.x series
    V3,
    /// Unknown generation; conservative parameters
    Generic,
}

impl FromStr for ProtectorVersion
{
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "2" | "2.x" | "v2" => Ok(Self::V2),
            "3" | "3.x" | "v3" => Ok(Self::V3),
            "generic" | "auto" => Ok(Self::Generic),
            _ => Err(format!("Unknown protector version: {s}. Use '2', '3' or 'generic'")),
        }
    }
}

impl fmt::Display for ProtectorVersion
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::V2 => write!(f, "2.x"),
            Self::V3 => write!(f, "3.x"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// One OEP detection heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heuristic
{
    /// A CRT startup API was called from original code; derive the entry from the call stack.
    ReturnOutsideProtector,
    /// The stack pointer matches the one recorded at the protector entry.
    StackDelta,
    /// Execution reached the original code section (execution trap fired).
    SectionTransition,
    /// The managed runtime entry export was reached.
    ManagedEntry,
}

/// How first execution of original code is made observable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapKind
{
    /// Remove the execute bit; the first instruction fetch faults.
    NoExecute,
    /// One-shot guard pages; any access faults and must be re-armed.
    GuardPage,
    /// No trap (managed targets).
    None,
}

/// Byte pattern with `??` wildcards
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BytePattern(Vec<Option<u8>>);

impl BytePattern
{
    /// Parse a space-separated hex pattern; `??` (or anything that is not hex)
    /// matches any byte.
    #[must_use]
    pub fn parse(text: &str) -> Self
    {
        Self(text.split_whitespace().map(|token| u8::from_str_radix(token, 16).ok()).collect())
    }

    /// Pattern length in bytes.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.0.len()
    }

    /// Check whether the pattern is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.0.is_empty()
    }

    /// Check whether `bytes` starts with the pattern.
    #[must_use]
    pub fn matches(&self, bytes: &[u8]) -> bool
    {
        bytes.len() >= self.0.len()
            && self
                .0
                .iter()
                .zip(bytes)
                .all(|(expected, actual)| expected.map_or(true, |b| b == *actual))
    }

    /// First offset in `haystack` where the pattern matches.
    #[must_use]
    pub fn find(&self, haystack: &[u8]) -> Option<usize>
    {
        if self.0.is_empty() || haystack.len() < self.0.len() {
            return None;
        }
        (0..=haystack.len() - self.0.len()).find(|&offset| self.matches(&haystack[offset..]))
    }
}

/// A breakpoint on an exported function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiProbe
{
    /// Module file name (lower case).
    pub module: &'static str,
    /// Export name.
    pub export: &'static str,
}

/// Compiler-generated entry stub shape used to derive an entry point from a call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPrologue
{
    /// Name, for logs.
    pub name: &'static str,
    /// Bytes of the stub starting at its first instruction.
    pub pattern: BytePattern,
    /// Offset of the `call` whose return address is seen on the stack.
    pub call_offset: u64,
    /// Bytes the stub pushes or reserves before that call.
    pub stack_adjust: u64,
}

/// How a signature match yields the import target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureDecode
{
    /// Immediate at `offset` is the target.
    Absolute
    {
        /// Offset of the immediate.
        offset: usize,
    },
    /// `value ^ key`
    Xor
    {
        /// Offset of the encrypted value.
        value: usize,
        /// Offset of the key.
        key: usize,
    },
    /// `value + addend`
    Add
    {
        /// Offset of the value.
        value: usize,
        /// Offset of the addend.
        addend: usize,
    },
    /// `value - subtrahend`
    Sub
    {
        /// Offset of the value.
        value: usize,
        /// Offset of the subtrahend.
        subtrahend: usize,
    },
}

/// Known import-wrapper stub shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSignature
{
    /// Name, for logs and diagnostics.
    pub name: &'static str,
    /// Pattern anchored at the stub start.
    pub pattern: BytePattern,
    /// How to compute the target from the matched bytes.
    pub decode: SignatureDecode,
}

/// An API patched to hide the debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AntiDebugSite
{
    /// Module file name (lower case).
    pub module: &'static str,
    /// Export to patch.
    pub export: &'static str,
    /// Replacement code for 32-bit targets.
    pub patch_x86: &'static [u8],
    /// Replacement code for 64-bit targets.
    pub patch_x64: &'static [u8],
}

impl AntiDebugSite
{
    /// Replacement code for the given architecture.
    #[must_use]
    pub fn patch(&self, arch: Architecture) -> &'static [u8]
    {
        match arch {
            Architecture::X86 => self.patch_x86,
            Architecture::X86_64 => self.patch_x64,
        }
    }
}

/// Immutable protector-specific parameters for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectorProfile
{
    /// Protector generation.
    pub version: ProtectorVersion,
    /// Bitness this profile applies to.
    pub architecture: Architecture,
    /// Native or .NET.
    pub format: BinaryFormat,
    /// EXE or DLL.
    pub kind: TargetKind,
    /// OEP heuristic chain, evaluated in order.
    pub heuristics: SmallVec<[Heuristic; 4]>,
    /// Execution trap strategy.
    pub trap: TrapKind,
    /// Section names owned by the protector.
    pub protector_sections: Vec<&'static str>,
    /// CRT startup APIs used as OEP probes.
    pub api_probes: Vec<ApiProbe>,
    /// Managed runtime entry exports.
    pub managed_entry: Vec<ApiProbe>,
    /// Entry stub shapes for call-site derivation.
    pub entry_prologues: Vec<EntryPrologue>,
    /// Import-wrapper signatures.
    pub stub_signatures: Vec<StubSignature>,
    /// APIs patched before tracing.
    pub anti_debug: Vec<AntiDebugSite>,
    /// Wall-clock budget for reaching the OEP.
    pub timeout: Duration,
    /// Single steps a candidate must survive without re-entering protector code.
    pub confirmation_steps: u32,
    /// Allowed distance between the entry and candidate stack pointers.
    pub stack_tolerance: u64,
    /// Upper bound on emulated stubs per run.
    pub max_emulated: usize,
    /// Upper bound on instructions per emulated stub.
    pub stub_instruction_limit: usize,
    /// The generation was not identified; results carry a caveat.
    pub low_confidence: bool,
}

impl ProtectorProfile
{
    /// Whether `name` is a protector-owned section.
    #[must_use]
    pub fn is_protector_section(&self, name: &str) -> bool
    {
        let name = name.trim_end_matches('\0');
        self.protector_sections.iter().any(|known| known.eq_ignore_ascii_case(name))
    }

    /// Whether a heuristic is part of the chain.
    #[must_use]
    pub fn uses(&self, heuristic: Heuristic) -> bool
    {
        self.heuristics.contains(&heuristic)
    }
}

/// Inputs to [`select`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileRequest
{
    /// Version forced by the caller.
    pub declared: Option<ProtectorVersion>,
    /// Version guessed from load-time signatures.
    pub probed: Option<ProtectorVersion>,
    /// Target bitness.
    pub architecture: Architecture,
    /// Target format.
    pub format: BinaryFormat,
    /// Target kind.
    pub kind: TargetKind,
}

/// Whether `name` is a section some protector generation adds to the image
#[must_use]
pub fn is_known_protector_section(name: &str) -> bool
{
    let name = name.trim_end_matches('\0');
    table::PROTECTOR_SECTIONS.iter().any(|known| known.eq_ignore_ascii_case(name))
}

/// Pick the profile for a target
///
/// A declared version is used as is. Otherwise the probed version is used,
/// and when probing found nothing the generic profile is returned with
/// `low_confidence` set. The returned profile always has the requested
/// bitness, format and kind.
///
/// ## Errors
///
/// [`UnpackError::UnsupportedProfile`] when the table has no record for the
/// combination (.NET libraries, for every version).
pub fn select(request: &ProfileRequest) -> Result<ProtectorProfile>
{
    if request.format == BinaryFormat::DotNet && request.kind == TargetKind::Dll {
        return Err(UnsupportedProfile::DotNetLibrary.into());
    }

    let (version, guessed) = match (request.declared, request.probed) {
        (Some(version), _) => (version, false),
        (None, Some(version)) => (version, false),
        (None, None) => (ProtectorVersion::Generic, true),
    };

    let mut profile = table::lookup(version, request.architecture, request.format, request.kind)
        .cloned()
        .ok_or(UnsupportedProfile::Combination {
            version,
            architecture: request.architecture,
            format: request.format,
            kind: request.kind,
        })?;
    if guessed {
        warn!("Protector generation not recognized, using the generic profile");
        profile.low_confidence = true;
    }
    info!(
        "Selected {} profile ({}, {:?}, {:?})",
        profile.version, profile.architecture, profile.format, profile.kind
    );
    Ok(profile)
}

/// Why no profile could be selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnsupportedProfile
{
    DotNetLibrary,
    Combination
    {
        version: ProtectorVersion,
        architecture: Architecture,
        format: BinaryFormat,
        kind: TargetKind,
    },
}

impl From<UnsupportedProfile> for UnpackError
{
    fn from(reason: UnsupportedProfile) -> Self
    {
        let message = match reason {
            UnsupportedProfile::DotNetLibrary => ".NET assemblies without an entry point (DLL) are not supported".to_string(),
            UnsupportedProfile::Combination {
                version,
                architecture,
                format,
                kind,
            } => format!("no {version} profile for {architecture} {format:?} {kind:?}"),
        };
        UnpackError::UnsupportedProfile(message)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const ARCHES: [Architecture; 2] = [Architecture::X86, Architecture::X86_64];
    const FORMATS: [BinaryFormat; 2] = [BinaryFormat::Native, BinaryFormat::DotNet];
    const KINDS: [TargetKind; 2] = [TargetKind::Exe, TargetKind::Dll];
    const VERSIONS: [Option<ProtectorVersion>; 4] = [
        None,
        Some(ProtectorVersion::V2),
        Some(ProtectorVersion::V3),
        Some(ProtectorVersion::Generic),
    ];

    #[test]
    fn test_selection_is_total_and_faithful()
    {
        for architecture in ARCHES {
            for format in FORMATS {
                for kind in KINDS {
                    for declared in VERSIONS {
                        for probed in VERSIONS {
                            let request = ProfileRequest {
                                declared,
                                probed,
                                architecture,
                                format,
                                kind,
                            };
                            match select(&request) {
                                Ok(profile) => {
                                    assert_eq!(profile.architecture, architecture);
                                    assert_eq!(profile.format, format);
                                    assert_eq!(profile.kind, kind);
                                }
                                Err(UnpackError::UnsupportedProfile(_)) => {
                                    assert_eq!((format, kind), (BinaryFormat::DotNet, TargetKind::Dll));
                                }
                                Err(other) => panic!("unexpected error {other}"),
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_declared_version_wins()
    {
        let profile = select(&ProfileRequest {
            declared: Some(ProtectorVersion::V2),
            probed: Some(ProtectorVersion::V3),
            architecture: Architecture::X86,
            format: BinaryFormat::Native,
            kind: TargetKind::Exe,
        })
        .unwrap();
        assert_eq!(profile.version, ProtectorVersion::V2);
        assert!(!profile.low_confidence);
    }

    #[test]
    fn test_unknown_falls_back_to_generic()
    {
        let profile = select(&ProfileRequest {
            declared: None,
            probed: None,
            architecture: Architecture::X86_64,
            format: BinaryFormat::Native,
            kind: TargetKind::Exe,
        })
        .unwrap();
        assert_eq!(profile.version, ProtectorVersion::Generic);
        assert!(profile.low_confidence);
    }

    #[test]
    fn test_dotnet_dll_rejected_for_forced_version()
    {
        let result = select(&ProfileRequest {
            declared: Some(ProtectorVersion::V3),
            probed: None,
            architecture: Architecture::X86,
            format: BinaryFormat::DotNet,
            kind: TargetKind::Dll,
        });
        assert!(matches!(result, Err(UnpackError::UnsupportedProfile(_))));
    }

    #[test]
    fn test_byte_pattern_wildcards()
    {
        let pattern = BytePattern::parse("E8 ?? ?? ?? ?? E9");
        assert_eq!(pattern.len(), 6);
        assert!(pattern.matches(&[0xE8, 1, 2, 3, 4, 0xE9, 0xFF]));
        assert!(!pattern.matches(&[0xE8, 1, 2, 3, 4, 0xEB]));
        assert_eq!(pattern.find(&[0x90, 0x90, 0xE8, 0, 0, 0, 0, 0xE9]), Some(2));
    }

    #[test]
    fn test_version_from_str()
    {
        assert_eq!("3.x".parse::<ProtectorVersion>().unwrap(), ProtectorVersion::V3);
        assert_eq!("2".parse::<ProtectorVersion>().unwrap(), ProtectorVersion::V2);
        assert!("4".parse::<ProtectorVersion>().is_err());
    }
}
