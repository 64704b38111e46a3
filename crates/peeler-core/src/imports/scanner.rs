//! IAT reference scanning.
//!
//! Original code reaches imports through memory operands that name an IAT
//! slot: `call [slot]`, `jmp [slot]` and `mov reg, [slot]`. The operand is an
//! absolute displacement on x86 and RIP-relative on x64. The slots found that
//! way are then extended to the contiguous run of pointers around them, which
//! catches imports that are only referenced from code the scanner did not
//! decode.

use std::collections::{BTreeMap, BTreeSet};

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};
use tracing::debug;

use crate::controller::MemoryView;
use crate::exports::ExportIndex;
use crate::oep::ImageLayout;
use crate::snapshot::MemorySnapshot;
use crate::types::{Address, RegionKind, PAGE_SIZE};

/// How an instruction uses an IAT slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind
{
    /// `call [slot]`
    Call,
    /// `jmp [slot]`
    Jump,
    /// `mov reg, [slot]`
    Load,
}

/// One instruction that reads an IAT slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IatReference
{
    /// Address of the instruction.
    pub site: Address,
    /// Address of the following instruction (the return address for calls).
    pub next: Address,
    /// Slot read by the instruction.
    pub slot: Address,
    /// Instruction form.
    pub kind: ReferenceKind,
}

/// An IAT slot whose value must be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateThunk
{
    /// Address of the slot.
    pub slot: Address,
    /// Pointer stored in the slot.
    pub value: Address,
    /// Return address of the first `call [slot]`, when there is one.
    pub return_address: Option<Address>,
}

/// Decode the executable parts of the original image and collect slot references.
#[must_use]
pub fn find_references(snapshot: &MemorySnapshot, layout: &ImageLayout) -> Vec<IatReference>
{
    let image = snapshot.image_bytes();
    let bitness = snapshot.architecture.bitness();
    let pointer = snapshot.architecture.pointer_size() as usize;
    let mut references = Vec::new();

    for &(start, end) in &layout.original {
        if !code_range(snapshot, start, end) {
            continue;
        }
        let (Some(from), Some(to)) = (start.rva_from(layout.base), end.rva_from(layout.base)) else {
            continue;
        };
        let Some(bytes) = image.get(from as usize..(to as usize).min(image.len())) else {
            continue;
        };

        let mut decoder = Decoder::with_ip(bitness, bytes, start.value(), DecoderOptions::NONE);
        let mut instr = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            if instr.is_invalid() {
                continue;
            }
            if let Some(reference) = slot_reference(&instr, pointer) {
                if layout.contains(reference.slot) {
                    references.push(reference);
                }
            }
        }
    }
    debug!("Found {} IAT references", references.len());
    references
}

/// Whether the range holds code worth decoding: any executable page, or the
/// current instruction pointer.
fn code_range(snapshot: &MemorySnapshot, start: Address, end: Address) -> bool
{
    let pc = snapshot.registers.pc;
    if pc >= start && pc < end {
        return true;
    }
    let mut page = start;
    while page < end {
        if snapshot.is_executable(page) {
            return true;
        }
        page = page + PAGE_SIZE;
    }
    false
}

fn slot_reference(instr: &Instruction, pointer: usize) -> Option<IatReference>
{
    let kind = match (instr.flow_control(), instr.mnemonic()) {
        (FlowControl::IndirectCall, _) if instr.op0_kind() == OpKind::Memory => ReferenceKind::Call,
        (FlowControl::IndirectBranch, _) if instr.op0_kind() == OpKind::Memory => ReferenceKind::Jump,
        (FlowControl::Next, Mnemonic::Mov) if instr.op0_kind() == OpKind::Register && instr.op1_kind() == OpKind::Memory => {
            ReferenceKind::Load
        }
        _ => return None,
    };
    if instr.memory_size().size() != pointer || instr.memory_index() != Register::None {
        return None;
    }
    let slot = if instr.is_ip_rel_memory_operand() {
        instr.ip_rel_memory_address()
    } else if instr.memory_base() == Register::None {
        instr.memory_displacement64()
    } else {
        return None;
    };
    Some(IatReference {
        site: Address::new(instr.ip()),
        next: Address::new(instr.next_ip()),
        slot: Address::new(slot),
        kind,
    })
}

/// Whether a slot value looks like an import: an export, or code in a stub region.
#[must_use]
pub fn is_thunk_value(snapshot: &MemorySnapshot, layout: &ImageLayout, exports: &ExportIndex, value: Address) -> bool
{
    if value.is_null() {
        return false;
    }
    if exports.contains(value) || layout.is_protector(value) {
        return true;
    }
    snapshot
        .region_containing(value)
        .is_some_and(|region| region.kind == RegionKind::Private && snapshot.is_executable(value))
}

/// Turn references into candidate thunks, extending each referenced slot to
/// its contiguous run. Single null slots (module separators) are crossed.
#[must_use]
pub fn candidate_thunks(
    snapshot: &MemorySnapshot,
    layout: &ImageLayout,
    exports: &ExportIndex,
    references: &[IatReference],
) -> Vec<CandidateThunk>
{
    let arch = snapshot.architecture;
    let pointer = arch.pointer_size();
    let read = |slot: Address| snapshot.read_pointer(slot, arch).map(Address::new);
    let accept = |slot: Address| {
        layout.contains(slot) && read(slot).is_some_and(|value| is_thunk_value(snapshot, layout, exports, value))
    };

    let mut return_addresses = BTreeMap::new();
    for reference in references.iter().filter(|r| r.kind == ReferenceKind::Call) {
        return_addresses.entry(reference.slot.value()).or_insert(reference.next);
    }

    let mut slots = BTreeSet::new();
    for reference in references {
        if !accept(reference.slot) || !slots.insert(reference.slot.value()) {
            continue;
        }
        // Walk outwards in both directions.
        for step in [pointer.wrapping_neg(), pointer] {
            let mut slot = reference.slot + step;
            loop {
                if accept(slot) {
                    slots.insert(slot.value());
                } else if read(slot) != Some(Address::ZERO) || !accept(slot + step) {
                    break;
                }
                slot = slot + step;
            }
        }
    }

    slots
        .into_iter()
        .filter_map(|slot| {
            let slot = Address::new(slot);
            Some(CandidateThunk {
                slot,
                value: read(slot)?,
                return_address: return_addresses.get(&slot.value()).copied(),
            })
        })
        .collect()
}
