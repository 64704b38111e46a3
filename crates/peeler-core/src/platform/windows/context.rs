//! Thread context access for native and WOW64 threads.
//!
//! A 64-bit debugger sees two contexts for a 32-bit process: the 64-bit one of
//! the WOW64 layer and the 32-bit one of the traced code. Only the latter is
//! meaningful here, so 32-bit targets go through `Wow64GetThreadContext`.

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Diagnostics::Debug::{
    GetThreadContext, SetThreadContext, Wow64GetThreadContext, Wow64SetThreadContext, CONTEXT, CONTEXT_FULL_AMD64,
    WOW64_CONTEXT, WOW64_CONTEXT_FULL,
};

use crate::error::{Result, UnpackError};
use crate::types::{Address, Architecture, Gpr, Registers};

/// `CONTEXT` must be 16-byte aligned for `GetThreadContext`.
#[repr(C, align(16))]
struct AlignedContext(CONTEXT);

/// Read the registers of `thread`.
pub(super) fn read(thread: HANDLE, arch: Architecture) -> Result<Registers>
{
    match arch {
        Architecture::X86 => read_wow64(thread).map(|ctx| wow64_to_registers(&ctx)),
        Architecture::X86_64 => read_native(thread).map(|ctx| native_to_registers(&ctx.0)),
    }
}

/// Write `registers` to `thread`, preserving everything the type does not model.
pub(super) fn write(thread: HANDLE, arch: Architecture, registers: &Registers) -> Result<()>
{
    match arch {
        Architecture::X86 => {
            let mut ctx = read_wow64(thread)?;
            apply_wow64(&mut ctx, registers);
            if unsafe { Wow64SetThreadContext(thread, &ctx) } == 0 {
                return Err(UnpackError::last_os_error("Wow64SetThreadContext"));
            }
        }
        Architecture::X86_64 => {
            let mut ctx = read_native(thread)?;
            apply_native(&mut ctx.0, registers);
            if unsafe { SetThreadContext(thread, &ctx.0) } == 0 {
                return Err(UnpackError::last_os_error("SetThreadContext"));
            }
        }
    }
    Ok(())
}

/// Set or clear the trap flag.
pub(super) fn set_trap_flag(thread: HANDLE, arch: Architecture, enabled: bool) -> Result<()>
{
    let mut registers = read(thread, arch)?;
    if enabled {
        registers.flags |= Registers::TRAP_FLAG;
    } else {
        registers.flags &= !Registers::TRAP_FLAG;
    }
    write(thread, arch, &registers)
}

fn read_native(thread: HANDLE) -> Result<AlignedContext>
{
    let mut ctx: AlignedContext = unsafe { std::mem::zeroed() };
    ctx.0.ContextFlags = CONTEXT_FULL_AMD64;
    if unsafe { GetThreadContext(thread, &mut ctx.0) } == 0 {
        return Err(UnpackError::last_os_error("GetThreadContext"));
    }
    Ok(ctx)
}

fn read_wow64(thread: HANDLE) -> Result<WOW64_CONTEXT>
{
    let mut ctx: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
    ctx.ContextFlags = WOW64_CONTEXT_FULL;
    if unsafe { Wow64GetThreadContext(thread, &mut ctx) } == 0 {
        return Err(UnpackError::last_os_error("Wow64GetThreadContext"));
    }
    Ok(ctx)
}

fn native_to_registers(ctx: &CONTEXT) -> Registers
{
    let mut registers = Registers {
        pc: Address::new(ctx.Rip),
        flags: u64::from(ctx.EFlags),
        ..Registers::default()
    };
    let values = [
        ctx.Rax, ctx.Rcx, ctx.Rdx, ctx.Rbx, ctx.Rsp, ctx.Rbp, ctx.Rsi, ctx.Rdi, ctx.R8, ctx.R9, ctx.R10, ctx.R11,
        ctx.R12, ctx.R13, ctx.R14, ctx.R15,
    ];
    registers.gpr.copy_from_slice(&values);
    registers
}

fn apply_native(ctx: &mut CONTEXT, registers: &Registers)
{
    ctx.Rip = registers.pc.value();
    ctx.EFlags = registers.flags as u32;
    ctx.Rax = registers.get(Gpr::Rax);
    ctx.Rcx = registers.get(Gpr::Rcx);
    ctx.Rdx = registers.get(Gpr::Rdx);
    ctx.Rbx = registers.get(Gpr::Rbx);
    ctx.Rsp = registers.get(Gpr::Rsp);
    ctx.Rbp = registers.get(Gpr::Rbp);
    ctx.Rsi = registers.get(Gpr::Rsi);
    ctx.Rdi = registers.get(Gpr::Rdi);
    ctx.R8 = registers.get(Gpr::R8);
    ctx.R9 = registers.get(Gpr::R9);
    ctx.R10 = registers.get(Gpr::R10);
    ctx.R11 = registers.get(Gpr::R11);
    ctx.R12 = registers.get(Gpr::R12);
    ctx.R13 = registers.get(Gpr::R13);
    ctx.R14 = registers.get(Gpr::R14);
    ctx.R15 = registers.get(Gpr::R15);
}

fn wow64_to_registers(ctx: &WOW64_CONTEXT) -> Registers
{
    let mut registers = Registers {
        pc: Address::new(u64::from(ctx.Eip)),
        flags: u64::from(ctx.EFlags),
        ..Registers::default()
    };
    let values = [ctx.Eax, ctx.Ecx, ctx.Edx, ctx.Ebx, ctx.Esp, ctx.Ebp, ctx.Esi, ctx.Edi];
    for (slot, value) in registers.gpr.iter_mut().zip(values) {
        *slot = u64::from(value);
    }
    registers
}

fn apply_wow64(ctx: &mut WOW64_CONTEXT, registers: &Registers)
{
    let registers = registers.normalized(Architecture::X86);
    ctx.Eip = registers.pc.value() as u32;
    ctx.EFlags = registers.flags as u32;
    ctx.Eax = registers.get(Gpr::Rax) as u32;
    ctx.Ecx = registers.get(Gpr::Rcx) as u32;
    ctx.Edx = registers.get(Gpr::Rdx) as u32;
    ctx.Ebx = registers.get(Gpr::Rbx) as u32;
    ctx.Esp = registers.get(Gpr::Rsp) as u32;
    ctx.Ebp = registers.get(Gpr::Rbp) as u32;
    ctx.Esi = registers.get(Gpr::Rsi) as u32;
    ctx.Edi = registers.get(Gpr::Rdi) as u32;
}
