//! # Stub Emulator
//!
//! Runs one import-wrapper stub over snapshot memory until it reaches an
//! exported function.
//!
//! The CPU model is deliberately small:
//! - Only general-purpose registers and the arithmetic flags are modeled.
//! - Memory is the snapshot plus a copy-on-write overlay; nothing is ever
//!   written back. A fake stack and, when the snapshot lacks one, a fake TEB
//!   are mapped in otherwise unused address space.
//! - FS (32-bit) or GS (64-bit) resolves to the TEB; the other segments are flat.
//! - Execution is linear: conditional branches are evaluated against the
//!   flags instead of forking.
//! - Anything outside the supported subset ends the session with
//!   [`StubFailure::Unsupported`].
//!
//! A session stops successfully when the instruction pointer lands on an
//! export while the value on top of the stack is the return address it planted
//! (the wrapper tail-jumped into the API). No-return APIs are accepted
//! wherever they are reached, and decoy calls the protector inserts to break
//! naive emulators (`Sleep`) are simulated and skipped.

mod memory;

use iced_x86::{ConditionCode, Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};
use thiserror::Error;
use tracing::debug;

pub use memory::Overlay;

use crate::exports::{ExportIndex, ResolvedSymbol};
use crate::snapshot::MemorySnapshot;
use crate::types::{Address, Architecture, Gpr, PAGE_SIZE};

/// Return address planted on the fake stack.
pub const MAGIC_RETURN: u64 = 0xdead_beef;

/// APIs that never return; reaching one ends the session wherever it happens.
const NO_RETURN_APIS: &[&str] = &["ExitProcess", "FatalExit", "ExitThread"];

/// Decoy APIs: `(name, result, argument count)`.
const DECOY_APIS: &[(&str, u64, u64)] = &[("Sleep", 0, 1)];

const MAX_INSTRUCTION_LEN: usize = 15;

const CF: u64 = 1 << 0;
const PF: u64 = 1 << 2;
const ZF: u64 = 1 << 6;
const SF: u64 = 1 << 7;
const DF: u64 = 1 << 10;
const OF: u64 = 1 << 11;

/// Fixed addresses of the emulator's private mappings
struct Layout
{
    stack: u64,
    teb: u64,
    peb: u64,
}

const fn layout(arch: Architecture) -> Layout
{
    match arch {
        Architecture::X86 => Layout {
            stack: 0xff00_0000,
            teb: 0xff10_0000,
            peb: 0xff20_0000,
        },
        Architecture::X86_64 => Layout {
            stack: 0xff00_0000_0000_0000,
            teb: 0xff10_0000_0000_0000,
            peb: 0xff20_0000_0000_0000,
        },
    }
}

/// How a successful session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubExit
{
    /// Reached an export with the planted return address on the stack.
    Returned,
    /// Reached a no-return API.
    NoReturn,
}

/// Result of a successful session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubOutcome
{
    /// The export the stub forwards to.
    pub symbol: ResolvedSymbol,
    /// How the session ended.
    pub exit: StubExit,
    /// Instructions executed.
    pub instructions: usize,
    /// Decoy calls skipped on the way.
    pub decoys: u32,
}

/// Why a session gave up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StubFailure
{
    /// The per-stub instruction cap was reached.
    #[error("instruction limit of {0} reached")]
    InstructionLimit(usize),

    /// Memory outside the snapshot was touched.
    #[error("unmapped memory at 0x{0:x}")]
    Unmapped(u64),

    /// Bytes at the instruction pointer do not decode.
    #[error("invalid instruction at 0x{0:x}")]
    InvalidInstruction(u64),

    /// The instruction or operand is outside the modeled subset.
    #[error("unsupported {what} at 0x{address:x}")]
    Unsupported
    {
        /// Mnemonic or register name.
        what: String,
        /// Instruction address.
        address: u64,
    },

    /// An export was called with a return address inside the stub.
    #[error("stub calls {0} and expects it to return")]
    ForeignCall(String),

    /// The stub returned to the caller without reaching an export.
    #[error("stub returned without reaching an export")]
    ReturnedEarly,
}

type Step<T> = std::result::Result<T, StubFailure>;

/// Scoped emulator for one stub
///
/// Owns its registers and overlay; the snapshot is only borrowed, so any
/// number of sessions can run over the same snapshot.
pub struct StubSession<'a>
{
    exports: &'a ExportIndex,
    architecture: Architecture,
    memory: Overlay<'a>,
    gpr: [u64; 16],
    flags: u64,
    pc: u64,
    segment_base: u64,
    return_address: u64,
    limit: usize,
    decoys: u32,
}

impl<'a> StubSession<'a>
{
    /// Prepare a session with a fresh stack holding [`MAGIC_RETURN`].
    #[must_use]
    pub fn new(snapshot: &'a MemorySnapshot, exports: &'a ExportIndex, limit: usize) -> Self
    {
        let architecture = snapshot.architecture;
        let layout = layout(architecture);
        let ptr = architecture.pointer_size();
        let mut memory = Overlay::new(snapshot);

        memory.map_zeroed(Address::new(layout.stack), 3 * PAGE_SIZE);
        let sp = layout.stack + 2 * PAGE_SIZE;

        let segment_base = if !snapshot.teb.is_null() && snapshot.page(snapshot.teb).is_some() {
            snapshot.teb.value()
        } else {
            let peb = if snapshot.peb.is_null() { layout.peb } else { snapshot.peb.value() };
            let (self_offset, peb_offset) = match architecture {
                Architecture::X86 => (0x18, 0x30),
                Architecture::X86_64 => (0x30, 0x60),
            };
            memory.map_zeroed(Address::new(layout.teb), PAGE_SIZE);
            memory.map_zeroed(Address::new(layout.peb), PAGE_SIZE);
            let _ = memory.write_int(Address::new(layout.teb + self_offset), layout.teb, ptr as usize);
            let _ = memory.write_int(Address::new(layout.teb + peb_offset), peb, ptr as usize);
            layout.teb
        };

        let mut gpr = [0u64; 16];
        gpr[Gpr::Rsp as usize] = sp;
        gpr[Gpr::Rbp as usize] = sp;
        let mut session = Self {
            exports,
            architecture,
            memory,
            gpr,
            flags: 0x202,
            pc: 0,
            segment_base,
            return_address: MAGIC_RETURN,
            limit,
            decoys: 0,
        };
        let _ = session.store(sp, MAGIC_RETURN, ptr as usize);
        session
    }

    /// Plant `address` as the return address instead of [`MAGIC_RETURN`]
    ///
    /// Used when the call site of the thunk is known, so wrappers that adjust
    /// their own return address are still recognized.
    #[must_use]
    pub fn with_return_address(mut self, address: Address) -> Self
    {
        let sp = self.gpr[Gpr::Rsp as usize];
        let _ = self.store(sp, address.value(), self.ptr());
        self.return_address = address.value();
        self
    }

    /// Execute from `entry` until an export is reached
    ///
    /// ## Errors
    ///
    /// A [`StubFailure`] describing why the stub could not be followed.
    pub fn run(mut self, entry: Address) -> Step<StubOutcome>
    {
        self.pc = entry.value();
        let bitness = self.architecture.bitness();
        for executed in 0..self.limit {
            if let Some(exit) = self.check_arrival()? {
                return Ok(StubOutcome {
                    instructions: executed,
                    decoys: self.decoys,
                    ..exit
                });
            }
            let bytes = self.memory.fetch(Address::new(self.pc), MAX_INSTRUCTION_LEN);
            if bytes.is_empty() {
                return Err(StubFailure::Unmapped(self.pc));
            }
            let mut decoder = Decoder::with_ip(bitness, &bytes, self.pc, DecoderOptions::NONE);
            let instr = decoder.decode();
            if instr.is_invalid() {
                return Err(StubFailure::InvalidInstruction(self.pc));
            }
            self.execute(&instr)?;
        }
        Err(StubFailure::InstructionLimit(self.limit))
    }

    fn check_arrival(&mut self) -> Step<Option<StubOutcome>>
    {
        if self.pc == MAGIC_RETURN || self.pc == self.return_address {
            return Err(StubFailure::ReturnedEarly);
        }
        let exports = self.exports;
        let Some(symbol) = exports.get(Address::new(self.pc)) else {
            return Ok(None);
        };
        let sp = self.gpr[Gpr::Rsp as usize];
        let ret = self.load(sp, self.ptr()).unwrap_or_default();
        let name = symbol.name.as_deref().unwrap_or_default();

        if ret == self.return_address || ret == self.return_address + 1 || ret == MAGIC_RETURN {
            return Ok(Some(self.outcome(symbol, StubExit::Returned)));
        }
        if NO_RETURN_APIS.contains(&name) {
            debug!("Stub reached no-return API {symbol}");
            return Ok(Some(self.outcome(symbol, StubExit::NoReturn)));
        }
        if let Some(&(_, result, args)) = DECOY_APIS.iter().find(|(decoy, _, _)| *decoy == name) {
            debug!("Skipping decoy call to {symbol}");
            let ptr = self.architecture.pointer_size();
            let stack_args = match self.architecture {
                Architecture::X86 => args,
                Architecture::X86_64 => args.saturating_sub(4),
            };
            self.gpr[Gpr::Rax as usize] = result;
            self.gpr[Gpr::Rsp as usize] = self.mask(sp + ptr * (1 + stack_args));
            self.pc = ret;
            self.decoys += 1;
            return Ok(None);
        }
        Err(StubFailure::ForeignCall(symbol.to_string()))
    }

    fn outcome(&self, symbol: &ResolvedSymbol, exit: StubExit) -> StubOutcome
    {
        StubOutcome {
            symbol: symbol.clone(),
            exit,
            instructions: 0,
            decoys: self.decoys,
        }
    }

    fn execute(&mut self, instr: &Instruction) -> Step<()>
    {
        let mut next = Some(instr.next_ip());
        let mnemonic = instr.mnemonic();

        match mnemonic {
            Mnemonic::Nop | Mnemonic::Pause | Mnemonic::Fnop | Mnemonic::Lfence | Mnemonic::Mfence => {}
            Mnemonic::Mov | Mnemonic::Movzx => {
                let value = self.read_operand(instr, 1)?;
                self.write_operand(instr, 0, value)?;
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let value = sign_extend(self.read_operand(instr, 1)?, op_size(instr, 1));
                self.write_operand(instr, 0, value)?;
            }
            Mnemonic::Lea => {
                let address = self.effective_address(instr, 1)?;
                self.write_operand(instr, 0, address)?;
            }
            Mnemonic::Xchg => {
                let first = self.read_operand(instr, 0)?;
                let second = self.read_operand(instr, 1)?;
                self.write_operand(instr, 0, second)?;
                self.write_operand(instr, 1, first)?;
            }
            Mnemonic::Add
            | Mnemonic::Adc
            | Mnemonic::Sub
            | Mnemonic::Sbb
            | Mnemonic::Xor
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Cmp
            | Mnemonic::Test => {
                let size = op_size(instr, 0);
                let lhs = self.read_operand(instr, 0)?;
                let rhs = self.read_operand(instr, 1)?;
                let result = self.alu(mnemonic, lhs, rhs, size);
                if !matches!(mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
                    self.write_operand(instr, 0, result)?;
                }
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let size = op_size(instr, 0);
                let value = self.read_operand(instr, 0)?;
                let carry = self.flags & CF;
                let op = if mnemonic == Mnemonic::Inc { Mnemonic::Add } else { Mnemonic::Sub };
                let result = self.alu(op, value, 1, size);
                self.flags = (self.flags & !CF) | carry;
                self.write_operand(instr, 0, result)?;
            }
            Mnemonic::Neg => {
                let size = op_size(instr, 0);
                let value = self.read_operand(instr, 0)?;
                let result = self.alu(Mnemonic::Sub, 0, value, size);
                self.write_operand(instr, 0, result)?;
            }
            Mnemonic::Not => {
                let value = self.read_operand(instr, 0)?;
                self.write_operand(instr, 0, !value & size_mask(op_size(instr, 0)))?;
            }
            Mnemonic::Shl | Mnemonic::Sal | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol | Mnemonic::Ror => {
                let size = op_size(instr, 0);
                let value = self.read_operand(instr, 0)?;
                let count = self.read_operand(instr, 1)? & if size == 8 { 0x3f } else { 0x1f };
                let result = self.shift(mnemonic, value, count, size);
                self.write_operand(instr, 0, result)?;
            }
            Mnemonic::Bswap => {
                let value = self.read_operand(instr, 0)?;
                let swapped = match op_size(instr, 0) {
                    8 => value.swap_bytes(),
                    _ => u64::from((value as u32).swap_bytes()),
                };
                self.write_operand(instr, 0, swapped)?;
            }
            Mnemonic::Cdq => {
                let eax = sign_extend(self.gpr[Gpr::Rax as usize], 4);
                self.gpr[Gpr::Rdx as usize] = (eax >> 32) & 0xffff_ffff;
            }
            Mnemonic::Cqo => {
                self.gpr[Gpr::Rdx as usize] = if self.gpr[Gpr::Rax as usize] >> 63 == 1 { u64::MAX } else { 0 };
            }
            Mnemonic::Cwde => {
                self.gpr[Gpr::Rax as usize] = sign_extend(self.gpr[Gpr::Rax as usize], 2) & 0xffff_ffff;
            }
            Mnemonic::Cdqe => {
                let value = sign_extend(self.gpr[Gpr::Rax as usize], 4);
                self.gpr[Gpr::Rax as usize] = self.mask(value);
            }
            Mnemonic::Clc => self.flags &= !CF,
            Mnemonic::Stc => self.flags |= CF,
            Mnemonic::Cmc => self.flags ^= CF,
            Mnemonic::Cld => self.flags &= !DF,
            Mnemonic::Std => self.flags |= DF,
            Mnemonic::Push => {
                // Resolve the operand before moving the stack pointer (`push esp`).
                let value = self.read_operand(instr, 0)?;
                self.push(value, stack_width(instr))?;
            }
            Mnemonic::Pop => {
                let width = stack_width(instr);
                let sp = self.gpr[Gpr::Rsp as usize];
                let value = self.load(sp, width)?;
                self.gpr[Gpr::Rsp as usize] = self.mask(sp.wrapping_add(width as u64));
                self.write_operand(instr, 0, value)?;
            }
            Mnemonic::Pushf | Mnemonic::Pushfd | Mnemonic::Pushfq => self.push(self.flags, stack_width(instr))?,
            Mnemonic::Popf | Mnemonic::Popfd | Mnemonic::Popfq => {
                let width = stack_width(instr);
                let sp = self.gpr[Gpr::Rsp as usize];
                self.flags = self.load(sp, width)? | 0x2;
                self.gpr[Gpr::Rsp as usize] = self.mask(sp.wrapping_add(width as u64));
            }
            Mnemonic::Pushad => {
                let sp = self.gpr[Gpr::Rsp as usize];
                for slot in [Gpr::Rax, Gpr::Rcx, Gpr::Rdx, Gpr::Rbx] {
                    self.push(self.gpr[slot as usize], 4)?;
                }
                self.push(sp, 4)?;
                for slot in [Gpr::Rbp, Gpr::Rsi, Gpr::Rdi] {
                    self.push(self.gpr[slot as usize], 4)?;
                }
            }
            Mnemonic::Popad => {
                let sp = self.gpr[Gpr::Rsp as usize];
                for (index, slot) in [Gpr::Rdi, Gpr::Rsi, Gpr::Rbp, Gpr::Rsp, Gpr::Rbx, Gpr::Rdx, Gpr::Rcx, Gpr::Rax]
                    .into_iter()
                    .enumerate()
                {
                    let address = sp + 4 * index as u64;
                    let value = self.load(address, 4)?;
                    if slot != Gpr::Rsp {
                        self.gpr[slot as usize] = value;
                    }
                }
                self.gpr[Gpr::Rsp as usize] = self.mask(sp + 32);
            }
            Mnemonic::Call => {
                let target = self.read_operand(instr, 0)?;
                self.push(instr.next_ip(), self.ptr())?;
                next = Some(target);
            }
            Mnemonic::Ret => {
                let sp = self.gpr[Gpr::Rsp as usize];
                let target = self.load(sp, self.ptr())?;
                self.gpr[Gpr::Rsp as usize] = self.mask(sp.wrapping_add_signed(i64::from(instr.stack_pointer_increment())));
                next = Some(target);
            }
            Mnemonic::Jmp => next = Some(self.read_operand(instr, 0)?),
            Mnemonic::Jecxz | Mnemonic::Jrcxz | Mnemonic::Jcxz => {
                let size = if mnemonic == Mnemonic::Jrcxz { 8 } else if mnemonic == Mnemonic::Jecxz { 4 } else { 2 };
                if self.gpr[Gpr::Rcx as usize] & size_mask(size) == 0 {
                    next = Some(instr.near_branch_target());
                }
            }
            Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => {
                let rcx = self.mask(self.gpr[Gpr::Rcx as usize].wrapping_sub(1));
                self.gpr[Gpr::Rcx as usize] = rcx;
                let zf = self.flags & ZF != 0;
                let taken = rcx != 0
                    && match mnemonic {
                        Mnemonic::Loope => zf,
                        Mnemonic::Loopne => !zf,
                        _ => true,
                    };
                if taken {
                    next = Some(instr.near_branch_target());
                }
            }
            _ if instr.flow_control() == FlowControl::ConditionalBranch => {
                if self.condition_holds(instr.condition_code()) {
                    next = Some(instr.near_branch_target());
                }
            }
            m if is_cmov(m) => {
                let value = self.read_operand(instr, 1)?;
                if self.condition_holds(instr.condition_code()) {
                    self.write_operand(instr, 0, value)?;
                }
            }
            m if is_setcc(m) && instr.condition_code() != ConditionCode::None => {
                let value = u64::from(self.condition_holds(instr.condition_code()));
                self.write_operand(instr, 0, value)?;
            }
            other => {
                return Err(StubFailure::Unsupported {
                    what: format!("{other:?}"),
                    address: self.pc,
                })
            }
        }

        self.pc = self.mask(next.unwrap_or_else(|| instr.next_ip()));
        Ok(())
    }

    fn ptr(&self) -> usize
    {
        self.architecture.pointer_size() as usize
    }

    fn mask(&self, value: u64) -> u64
    {
        self.architecture.mask(value)
    }

    fn unsupported(&self, what: impl std::fmt::Debug) -> StubFailure
    {
        StubFailure::Unsupported {
            what: format!("{what:?}"),
            address: self.pc,
        }
    }

    fn load(&self, address: u64, size: usize) -> Step<u64>
    {
        if size > 8 {
            return Err(StubFailure::Unsupported {
                what: format!("{size}-byte operand"),
                address: self.pc,
            });
        }
        self.memory
            .read_int(Address::new(address), size)
            .ok_or(StubFailure::Unmapped(address))
    }

    fn store(&mut self, address: u64, value: u64, size: usize) -> Step<()>
    {
        if size > 8 {
            return Err(StubFailure::Unsupported {
                what: format!("{size}-byte operand"),
                address: self.pc,
            });
        }
        self.memory
            .write_int(Address::new(address), value, size)
            .ok_or(StubFailure::Unmapped(address))
    }

    fn push(&mut self, value: u64, width: usize) -> Step<()>
    {
        let sp = self.mask(self.gpr[Gpr::Rsp as usize].wrapping_sub(width as u64));
        self.store(sp, value, width)?;
        self.gpr[Gpr::Rsp as usize] = sp;
        Ok(())
    }

    fn read_register(&self, reg: Register) -> Step<u64>
    {
        if !reg.is_gpr() {
            return Err(self.unsupported(reg));
        }
        let slot = self.gpr[reg.full_register() as usize - Register::RAX as usize];
        Ok(if is_high_byte(reg) { (slot >> 8) & 0xff } else { slot & size_mask(reg.size()) })
    }

    fn write_register(&mut self, reg: Register, value: u64) -> Step<()>
    {
        if !reg.is_gpr() {
            return Err(self.unsupported(reg));
        }
        let index = reg.full_register() as usize - Register::RAX as usize;
        let old = self.gpr[index];
        let new = if is_high_byte(reg) {
            (old & !0xff00) | ((value & 0xff) << 8)
        } else {
            match reg.size() {
                8 => value,
                4 => value & 0xffff_ffff,
                2 => (old & !0xffff) | (value & 0xffff),
                _ => (old & !0xff) | (value & 0xff),
            }
        };
        self.gpr[index] = self.mask(new);
        Ok(())
    }

    fn segment_register(&self, reg: Register) -> Option<u64>
    {
        match (reg, self.architecture) {
            (Register::FS, Architecture::X86) | (Register::GS, Architecture::X86_64) => Some(self.segment_base),
            (Register::FS | Register::GS, _) => None,
            _ if reg.is_segment_register() => Some(0),
            _ => self.read_register(reg).ok(),
        }
    }

    fn effective_address(&self, instr: &Instruction, op: u32) -> Step<u64>
    {
        instr
            .virtual_address(op, 0, |reg, _, _| self.segment_register(reg))
            .map(|address| self.mask(address))
            .ok_or_else(|| self.unsupported(instr.mnemonic()))
    }

    fn read_operand(&self, instr: &Instruction, op: u32) -> Step<u64>
    {
        match instr.op_kind(op) {
            OpKind::Register => self.read_register(instr.op_register(op)),
            OpKind::Memory => {
                let address = self.effective_address(instr, op)?;
                self.load(address, instr.memory_size().size())
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Ok(instr.near_branch_target()),
            _ => instr.try_immediate(op).map_err(|_| self.unsupported(instr.mnemonic())),
        }
    }

    fn write_operand(&mut self, instr: &Instruction, op: u32, value: u64) -> Step<()>
    {
        match instr.op_kind(op) {
            OpKind::Register => self.write_register(instr.op_register(op), value),
            OpKind::Memory => {
                let address = self.effective_address(instr, op)?;
                self.store(address, value, instr.memory_size().size())
            }
            _ => Err(self.unsupported(instr.mnemonic())),
        }
    }

    fn set_result_flags(&mut self, result: u64, size: usize)
    {
        self.flags &= !(ZF | SF | PF);
        if result == 0 {
            self.flags |= ZF;
        }
        if result & sign_bit(size) != 0 {
            self.flags |= SF;
        }
        if (result as u8).count_ones() % 2 == 0 {
            self.flags |= PF;
        }
    }

    fn alu(&mut self, op: Mnemonic, lhs: u64, rhs: u64, size: usize) -> u64
    {
        let mask = size_mask(size);
        let sign = sign_bit(size);
        let (lhs, rhs) = (lhs & mask, rhs & mask);
        let carry_in = u64::from(self.flags & CF != 0 && matches!(op, Mnemonic::Adc | Mnemonic::Sbb));
        let (result, carry, overflow) = match op {
            Mnemonic::Add | Mnemonic::Adc => {
                let wide = u128::from(lhs) + u128::from(rhs) + u128::from(carry_in);
                let result = (wide as u64) & mask;
                (result, wide > u128::from(mask), (lhs ^ result) & (rhs ^ result) & sign != 0)
            }
            Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
                let result = lhs.wrapping_sub(rhs).wrapping_sub(carry_in) & mask;
                let borrow = u128::from(lhs) < u128::from(rhs) + u128::from(carry_in);
                (result, borrow, (lhs ^ rhs) & (lhs ^ result) & sign != 0)
            }
            Mnemonic::Xor => (lhs ^ rhs, false, false),
            Mnemonic::Or => (lhs | rhs, false, false),
            _ => (lhs & rhs, false, false),
        };
        self.flags &= !(CF | OF);
        if carry {
            self.flags |= CF;
        }
        if overflow {
            self.flags |= OF;
        }
        self.set_result_flags(result, size);
        result
    }

    fn shift(&mut self, op: Mnemonic, value: u64, count: u64, size: usize) -> u64
    {
        if count == 0 {
            return value;
        }
        let bits = 8 * size as u64;
        let mask = size_mask(size);
        let value = value & mask;
        let (result, carry) = match op {
            Mnemonic::Shl | Mnemonic::Sal => {
                let carry = count <= bits && (value >> (bits - count)) & 1 == 1;
                (value.checked_shl(count as u32).unwrap_or(0) & mask, carry)
            }
            Mnemonic::Shr => ((value >> count.min(63)) & mask, (value >> (count - 1).min(63)) & 1 == 1),
            Mnemonic::Sar => {
                let signed = sign_extend(value, size) as i64;
                ((signed >> count.min(63)) as u64 & mask, (signed >> (count - 1).min(63)) & 1 == 1)
            }
            Mnemonic::Rol => {
                let c = count % bits;
                let result = if c == 0 { value } else { ((value << c) | (value >> (bits - c))) & mask };
                (result, result & 1 == 1)
            }
            _ => {
                let c = count % bits;
                let result = if c == 0 { value } else { ((value >> c) | (value << (bits - c))) & mask };
                (result, (result >> (bits - 1)) & 1 == 1)
            }
        };
        self.flags &= !CF;
        if carry {
            self.flags |= CF;
        }
        if !matches!(op, Mnemonic::Rol | Mnemonic::Ror) {
            self.set_result_flags(result, size);
        }
        result
    }

    fn condition_holds(&self, code: ConditionCode) -> bool
    {
        let set = |bit: u64| self.flags & bit != 0;
        let less = set(SF) != set(OF);
        match code {
            ConditionCode::o => set(OF),
            ConditionCode::no => !set(OF),
            ConditionCode::b => set(CF),
            ConditionCode::ae => !set(CF),
            ConditionCode::e => set(ZF),
            ConditionCode::ne => !set(ZF),
            ConditionCode::be => set(CF) || set(ZF),
            ConditionCode::a => !set(CF) && !set(ZF),
            ConditionCode::s => set(SF),
            ConditionCode::ns => !set(SF),
            ConditionCode::p => set(PF),
            ConditionCode::np => !set(PF),
            ConditionCode::l => less,
            ConditionCode::ge => !less,
            ConditionCode::le => set(ZF) || less,
            ConditionCode::g => !set(ZF) && !less,
            ConditionCode::None => true,
        }
    }
}

fn is_high_byte(reg: Register) -> bool
{
    matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH)
}

fn is_cmov(mnemonic: Mnemonic) -> bool
{
    mnemonic >= Mnemonic::Cmova && mnemonic <= Mnemonic::Cmovs
}

fn is_setcc(mnemonic: Mnemonic) -> bool
{
    mnemonic >= Mnemonic::Seta && mnemonic <= Mnemonic::Sets
}

fn stack_width(instr: &Instruction) -> usize
{
    instr.stack_pointer_increment().unsigned_abs() as usize
}

fn op_size(instr: &Instruction, op: u32) -> usize
{
    match instr.op_kind(op) {
        OpKind::Register => instr.op_register(op).size(),
        OpKind::Memory => instr.memory_size().size(),
        OpKind::Immediate8 => 1,
        OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
        OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
        _ => 8,
    }
}

const fn size_mask(size: usize) -> u64
{
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size)) - 1
    }
}

const fn sign_bit(size: usize) -> u64
{
    let size = if size == 0 || size > 8 { 8 } else { size };
    1u64 << (8 * size - 1)
}

const fn sign_extend(value: u64, size: usize) -> u64
{
    let value = value & size_mask(size);
    if value & sign_bit(size) != 0 {
        value | !size_mask(size)
    } else {
        value
    }
}

#[cfg(test)]
mod tests
{
    use iced_x86::code_asm::*;

    use super::*;
    use crate::pe::ExportEntry;
    use crate::snapshot::{ModuleExports, SnapshotRegion};
    use crate::types::{ModuleInfo, Protection, RegionKind, Registers, ThreadId};

    const CODE_BASE: u64 = 0x0040_1000;
    const KERNEL32: u64 = 0x7000_0000;
    const TARGET: u64 = KERNEL32 + 0x1000;
    const SLEEP: u64 = KERNEL32 + 0x2000;
    const EXIT_PROCESS: u64 = KERNEL32 + 0x3000;

    fn snapshot(arch: Architecture, code: Vec<u8>) -> MemorySnapshot
    {
        MemorySnapshot {
            architecture: arch,
            target: ModuleInfo::new("target.exe", Address::new(0x40_0000), 0x10000),
            regions: vec![SnapshotRegion::uniform(
                Address::new(CODE_BASE),
                RegionKind::Image,
                Protection::READ_EXECUTE,
                code,
            )],
            registers: Registers::default(),
            thread: ThreadId(1),
            teb: Address::ZERO,
            peb: Address::ZERO,
            modules: Vec::new(),
        }
    }

    fn exports() -> ExportIndex
    {
        let entry = |name: &str, ordinal, address| ExportEntry {
            name: Some(name.to_string()),
            ordinal,
            address: Address::new(address),
        };
        ExportIndex::build(&[ModuleExports {
            module: ModuleInfo::new("kernel32.dll", Address::new(KERNEL32), 0x10000),
            exports: vec![
                entry("GetTickCount", 1, TARGET),
                entry("Sleep", 2, SLEEP),
                entry("ExitProcess", 3, EXIT_PROCESS),
            ],
        }])
    }

    #[test]
    fn test_xor_encoded_push_ret()
    {
        let mut a = CodeAssembler::new(32).unwrap();
        a.push(ebx).unwrap();
        a.mov(ebx, (TARGET as u32) ^ 0x5a5a_1234).unwrap();
        a.xor(ebx, 0x5a5a_1234).unwrap();
        a.xchg(dword_ptr(esp), ebx).unwrap();
        a.ret().unwrap();
        let snap = snapshot(Architecture::X86, a.assemble(CODE_BASE).unwrap());
        let index = exports();

        let outcome = StubSession::new(&snap, &index, 100).run(Address::new(CODE_BASE)).unwrap();
        assert_eq!(outcome.symbol.name.as_deref(), Some("GetTickCount"));
        assert_eq!(outcome.exit, StubExit::Returned);
        assert_eq!(outcome.instructions, 5);
        assert_eq!(outcome.decoys, 0);
    }

    #[test]
    fn test_decoy_sleep_is_skipped()
    {
        let mut a = CodeAssembler::new(32).unwrap();
        a.push(1000).unwrap();
        a.call(SLEEP).unwrap();
        a.test(eax, eax).unwrap();
        let mut done = a.create_label();
        a.je(done).unwrap();
        a.int3().unwrap();
        a.set_label(&mut done).unwrap();
        a.jmp(TARGET).unwrap();
        let snap = snapshot(Architecture::X86, a.assemble(CODE_BASE).unwrap());
        let index = exports();

        let outcome = StubSession::new(&snap, &index, 100).run(Address::new(CODE_BASE)).unwrap();
        assert_eq!(outcome.symbol.address, Address::new(TARGET));
        assert_eq!(outcome.decoys, 1);
    }

    #[test]
    fn test_no_return_api_accepted()
    {
        let mut a = CodeAssembler::new(32).unwrap();
        a.push(0).unwrap();
        a.call(EXIT_PROCESS).unwrap();
        let snap = snapshot(Architecture::X86, a.assemble(CODE_BASE).unwrap());
        let index = exports();

        let outcome = StubSession::new(&snap, &index, 100).run(Address::new(CODE_BASE)).unwrap();
        assert_eq!(outcome.exit, StubExit::NoReturn);
        assert_eq!(outcome.symbol.name.as_deref(), Some("ExitProcess"));
    }

    #[test]
    fn test_counted_loop_then_indirect_jump()
    {
        let mut a = CodeAssembler::new(32).unwrap();
        a.mov(ecx, 5).unwrap();
        let mut top = a.create_label();
        a.set_label(&mut top).unwrap();
        a.add(eax, 0x10).unwrap();
        a.dec(ecx).unwrap();
        a.jne(top).unwrap();
        a.add(eax, (TARGET - 0x50) as u32).unwrap();
        a.jmp(eax).unwrap();
        let snap = snapshot(Architecture::X86, a.assemble(CODE_BASE).unwrap());
        let index = exports();

        let outcome = StubSession::new(&snap, &index, 100).run(Address::new(CODE_BASE)).unwrap();
        assert_eq!(outcome.symbol.address, Address::new(TARGET));
    }

    #[test]
    fn test_instruction_limit()
    {
        let mut a = CodeAssembler::new(32).unwrap();
        let mut spin = a.create_label();
        a.set_label(&mut spin).unwrap();
        a.jmp(spin).unwrap();
        let snap = snapshot(Architecture::X86, a.assemble(CODE_BASE).unwrap());
        let index = exports();

        let failure = StubSession::new(&snap, &index, 50).run(Address::new(CODE_BASE)).unwrap_err();
        assert_eq!(failure, StubFailure::InstructionLimit(50));
    }

    #[test]
    fn test_plain_return_is_reported()
    {
        let mut a = CodeAssembler::new(32).unwrap();
        a.ret().unwrap();
        let snap = snapshot(Architecture::X86, a.assemble(CODE_BASE).unwrap());
        let index = exports();

        let failure = StubSession::new(&snap, &index, 10).run(Address::new(CODE_BASE)).unwrap_err();
        assert_eq!(failure, StubFailure::ReturnedEarly);
    }

    #[test]
    fn test_x64_stack_shuffle_through_teb()
    {
        let mut a = CodeAssembler::new(64).unwrap();
        a.mov(rax, qword_ptr(0x30).gs()).unwrap();
        a.mov(rcx, TARGET - 0x1234).unwrap();
        a.lea(rcx, qword_ptr(rcx + 0x1234)).unwrap();
        a.push(rcx).unwrap();
        a.ret().unwrap();
        let snap = snapshot(Architecture::X86_64, a.assemble(CODE_BASE).unwrap());
        let index = exports();

        let outcome = StubSession::new(&snap, &index, 100).run(Address::new(CODE_BASE)).unwrap();
        assert_eq!(outcome.symbol.address, Address::new(TARGET));
    }

    #[test]
    fn test_shift_and_rotate_flags()
    {
        let snap = snapshot(Architecture::X86, vec![0x90; 16]);
        let index = exports();
        let mut session = StubSession::new(&snap, &index, 1);
        assert_eq!(session.shift(Mnemonic::Shl, 0x8000_0001, 1, 4), 2);
        assert!(session.flags & CF != 0);
        assert_eq!(session.shift(Mnemonic::Ror, 1, 1, 4), 0x8000_0000);
        assert!(session.flags & CF != 0);
        assert_eq!(session.alu(Mnemonic::Sub, 1, 2, 4), 0xffff_ffff);
        assert!(session.condition_holds(ConditionCode::b));
        assert!(session.condition_holds(ConditionCode::l));
    }
}
