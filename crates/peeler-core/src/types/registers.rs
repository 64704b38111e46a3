//! CPU register snapshot.

use super::{Address, Architecture};

/// General-purpose register slots, in the x86 encoding order
///
/// The order matches `iced_x86::Register::RAX..=R15` so that emulator code can
/// index the array with `reg as usize - Register::RAX as usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Gpr
{
    /// RAX / EAX
    Rax = 0,
    /// RCX / ECX
    Rcx,
    /// RDX / EDX
    Rdx,
    /// RBX / EBX
    Rbx,
    /// RSP / ESP
    Rsp,
    /// RBP / EBP
    Rbp,
    /// RSI / ESI
    Rsi,
    /// RDI / EDI
    Rdi,
    /// R8 (x86-64 only)
    R8,
    /// R9
    R9,
    /// R10
    R10,
    /// R11
    R11,
    /// R12
    R12,
    /// R13
    R13,
    /// R14
    R14,
    /// R15
    R15,
}

/// Register state of one thread
///
/// For 32-bit targets only the first eight slots are meaningful and every
/// value is zero-extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers
{
    /// Instruction pointer
    pub pc: Address,
    /// General-purpose registers indexed by [`Gpr`]
    pub gpr: [u64; 16],
    /// EFLAGS / RFLAGS
    pub flags: u64,
}

impl Registers
{
    /// Trap flag in EFLAGS; set to request a single-step exception.
    pub const TRAP_FLAG: u64 = 0x100;

    /// Registers with the given pc and stack pointer, everything else zero.
    #[must_use]
    pub fn at(pc: Address, sp: Address) -> Self
    {
        let mut regs = Self {
            pc,
            ..Self::default()
        };
        regs.gpr[Gpr::Rsp as usize] = sp.value();
        regs
    }

    /// Read a general-purpose register.
    #[must_use]
    pub fn get(&self, reg: Gpr) -> u64
    {
        self.gpr[reg as usize]
    }

    /// Write a general-purpose register.
    pub fn set(&mut self, reg: Gpr, value: u64)
    {
        self.gpr[reg as usize] = value;
    }

    /// Stack pointer
    #[must_use]
    pub fn sp(&self) -> Address
    {
        Address::new(self.gpr[Gpr::Rsp as usize])
    }

    /// Frame pointer
    #[must_use]
    pub fn fp(&self) -> Address
    {
        Address::new(self.gpr[Gpr::Rbp as usize])
    }

    /// Truncate every value to the architecture's width.
    #[must_use]
    pub fn normalized(mut self, arch: Architecture) -> Self
    {
        self.pc = Address::new(arch.mask(self.pc.value()));
        for value in &mut self.gpr {
            *value = arch.mask(*value);
        }
        if arch == Architecture::X86 {
            self.gpr[Gpr::R8 as usize..].fill(0);
        }
        self
    }
}
