//! Static stub analysis: direct transfers and known wrapper signatures.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use crate::controller::MemoryView;
use crate::exports::{ExportIndex, ResolvedSymbol};
use crate::profile::{SignatureDecode, StubSignature};
use crate::snapshot::MemorySnapshot;
use crate::types::{Address, Architecture};

/// Hops followed through intermediate jumps before giving up.
const MAX_HOPS: usize = 4;

const MAX_INSTRUCTION_LEN: usize = 15;

/// Target of the stub's first instruction when it is an unconditional
/// transfer: `jmp rel`, `jmp [m]` or `push imm; ret`.
#[must_use]
pub fn first_transfer(snapshot: &MemorySnapshot, stub: Address) -> Option<Address>
{
    let arch = snapshot.architecture;
    let bytes = snapshot.read_tail(stub)?;
    let mut decoder = Decoder::with_ip(
        arch.bitness(),
        &bytes[..bytes.len().min(2 * MAX_INSTRUCTION_LEN)],
        stub.value(),
        DecoderOptions::NONE,
    );
    let first = decoder.decode();
    match first.mnemonic() {
        Mnemonic::Jmp => match first.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(Address::new(first.near_branch_target()))
            }
            OpKind::Memory => {
                let slot = memory_operand(&first)?;
                snapshot.read_pointer(Address::new(slot), arch).map(Address::new)
            }
            _ => None,
        },
        Mnemonic::Push if matches!(first.code(), Code::Pushd_imm32 | Code::Pushq_imm32) => {
            let next = decoder.decode();
            (next.mnemonic() == Mnemonic::Ret && next.op_count() == 0)
                .then(|| Address::new(arch.mask(first.immediate(0))))
        }
        _ => None,
    }
}

fn memory_operand(instr: &Instruction) -> Option<u64>
{
    if instr.memory_index() != Register::None {
        return None;
    }
    if instr.is_ip_rel_memory_operand() {
        Some(instr.ip_rel_memory_address())
    } else if instr.memory_base() == Register::None {
        Some(instr.memory_displacement64())
    } else {
        None
    }
}

/// Resolve a slot value without executing anything
///
/// Either the value is an export itself or the stub's first instruction
/// transfers straight to one.
#[must_use]
pub fn resolve_direct(snapshot: &MemorySnapshot, exports: &ExportIndex, value: Address) -> Option<ResolvedSymbol>
{
    if let Some(symbol) = exports.get(value) {
        return Some(symbol.clone());
    }
    first_transfer(snapshot, value).and_then(|target| exports.get(target).cloned())
}

/// Compute the target encoded in a signature match.
#[must_use]
pub fn decode_signature(signature: &StubSignature, bytes: &[u8], arch: Architecture) -> Option<Address>
{
    let pointer = |offset: usize| -> Option<u64> {
        let raw = bytes.get(offset..offset + arch.pointer_size() as usize)?;
        let mut buf = [0u8; 8];
        buf[..raw.len()].copy_from_slice(raw);
        Some(u64::from_le_bytes(buf))
    };
    let target = match signature.decode {
        SignatureDecode::Absolute { offset } => pointer(offset)?,
        SignatureDecode::Xor { value, key } => pointer(value)? ^ pointer(key)?,
        SignatureDecode::Add { value, addend } => pointer(value)?.wrapping_add(pointer(addend)?),
        SignatureDecode::Sub { value, subtrahend } => pointer(value)?.wrapping_sub(pointer(subtrahend)?),
    };
    Some(Address::new(arch.mask(target)))
}

/// Resolve a slot value by matching the profile's wrapper signatures
///
/// Intermediate jumps (`jmp rel`, `jmp [m]`) and signature targets that are
/// not exports are followed for a few hops. Returns the symbol and the name of
/// the last signature that matched.
#[must_use]
pub fn resolve_signature(
    snapshot: &MemorySnapshot,
    exports: &ExportIndex,
    signatures: &[StubSignature],
    value: Address,
) -> Option<(ResolvedSymbol, &'static str)>
{
    let arch = snapshot.architecture;
    let mut current = value;
    let mut matched = None;
    for _ in 0..=MAX_HOPS {
        if let (Some(symbol), Some(name)) = (exports.get(current), matched) {
            return Some((symbol.clone(), name));
        }
        let bytes = snapshot.read_tail(current)?;
        let hit = signatures
            .iter()
            .find(|signature| signature.pattern.matches(bytes))
            .and_then(|signature| Some((decode_signature(signature, bytes, arch)?, signature.name)));
        current = match hit {
            Some((target, name)) => {
                matched = Some(name);
                target
            }
            None => first_transfer(snapshot, current)?,
        };
    }
    None
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::profile::BytePattern;

    #[test]
    fn test_decode_xor_signature()
    {
        let signature = StubSignature {
            name: "push-xor-ret",
            pattern: BytePattern::parse("68 ?? ?? ?? ?? 81 34 24 ?? ?? ?? ?? C3"),
            decode: SignatureDecode::Xor { value: 1, key: 8 },
        };
        let encoded: u32 = 0x7710_2030 ^ 0x5a5a_5a5a;
        let mut bytes = vec![0x68];
        bytes.extend_from_slice(&encoded.to_le_bytes());
        bytes.extend_from_slice(&[0x81, 0x34, 0x24]);
        bytes.extend_from_slice(&0x5a5a_5a5au32.to_le_bytes());
        bytes.push(0xC3);

        assert!(signature.pattern.matches(&bytes));
        assert_eq!(
            decode_signature(&signature, &bytes, Architecture::X86),
            Some(Address::new(0x7710_2030))
        );
    }

    #[test]
    fn test_decode_sub_wraps_to_pointer_width()
    {
        let signature = StubSignature {
            name: "push-sub-ret",
            pattern: BytePattern::parse("68 ?? ?? ?? ?? 81 2C 24 ?? ?? ?? ?? C3"),
            decode: SignatureDecode::Sub {
                value: 1,
                subtrahend: 8,
            },
        };
        let mut bytes = vec![0x68];
        bytes.extend_from_slice(&0x10u32.to_le_bytes());
        bytes.extend_from_slice(&[0x81, 0x2C, 0x24]);
        bytes.extend_from_slice(&0x20u32.to_le_bytes());
        bytes.push(0xC3);
        assert_eq!(
            decode_signature(&signature, &bytes, Architecture::X86),
            Some(Address::new(0xffff_fff0))
        );
    }
}
