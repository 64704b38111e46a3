//! Debug event types and helpers.
//!
//! Backends translate OS debug events into [`DebugEvent`] values. The OEP
//! detector consumes nothing else, which is what makes a recorded event trace
//! replay to the same result.

use crate::types::{Address, ModuleInfo, ThreadId};

/// NTSTATUS for a software breakpoint (`int3`).
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
/// NTSTATUS for a trace-flag single step.
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
/// NTSTATUS for an access violation.
pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
/// NTSTATUS for a guard page hit.
pub const EXCEPTION_GUARD_PAGE: u32 = 0x8000_0001;
/// `int3` raised by the WOW64 layer for 32-bit code.
pub const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001F;
/// `single step` raised by the WOW64 layer for 32-bit code.
pub const STATUS_WX86_SINGLE_STEP: u32 = 0x4000_001E;

/// Kind of access that caused an access violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultAccess
{
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch (DEP / no-execute).
    Execute,
}

impl FaultAccess
{
    /// Decode `ExceptionInformation[0]` of an access violation record.
    #[must_use]
    pub fn from_raw(value: u64) -> Self
    {
        match value {
            1 => Self::Write,
            8 => Self::Execute,
            _ => Self::Read,
        }
    }
}

/// Event delivered by [`crate::controller::ProcessController::wait_for_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent
{
    /// The debuggee was created. Always the first event of a launch.
    ProcessCreated
    {
        /// Initial thread.
        main_thread: ThreadId,
        /// Load address of the process image.
        image_base: Address,
        /// Entry point taken from the process image header.
        entry: Address,
    },
    /// A new thread started.
    ThreadCreated
    {
        /// The new thread.
        thread: ThreadId,
    },
    /// A thread exited.
    ThreadExited
    {
        /// The thread that exited.
        thread: ThreadId,
        /// Its exit code.
        code: u32,
    },
    /// A module was mapped.
    ModuleLoaded
    {
        /// The mapped module.
        module: ModuleInfo,
    },
    /// A module was unmapped.
    ModuleUnloaded
    {
        /// Base of the unmapped module.
        base: Address,
    },
    /// One of the debugger's own software breakpoints was hit.
    ///
    /// The backend has already rewound the instruction pointer to `address`.
    Breakpoint
    {
        /// Thread that hit the breakpoint.
        thread: ThreadId,
        /// Breakpoint address.
        address: Address,
    },
    /// A requested single step completed.
    SingleStep
    {
        /// Stepping thread.
        thread: ThreadId,
        /// Address of the next instruction.
        address: Address,
    },
    /// Access violation.
    AccessViolation
    {
        /// Faulting thread.
        thread: ThreadId,
        /// Instruction address.
        address: Address,
        /// Data or instruction address that was accessed.
        fault_address: Address,
        /// Access kind.
        access: FaultAccess,
        /// `false` when the debuggee did not handle the first chance.
        first_chance: bool,
    },
    /// Guard page hit. The OS has already cleared the guard flag on that page.
    GuardPage
    {
        /// Faulting thread.
        thread: ThreadId,
        /// Instruction address.
        address: Address,
        /// Accessed address.
        fault_address: Address,
    },
    /// Any other exception, including foreign `int3`.
    Exception
    {
        /// Raising thread.
        thread: ThreadId,
        /// NTSTATUS code.
        code: u32,
        /// Instruction address.
        address: Address,
        /// `false` for a second-chance (unhandled) exception.
        first_chance: bool,
    },
    /// `OutputDebugString` from the debuggee.
    DebugString
    {
        /// Source thread.
        thread: ThreadId,
        /// Decoded message.
        message: String,
    },
    /// The process exited.
    ProcessExited
    {
        /// Exit code.
        code: u32,
    },
    /// No event arrived before the wait timeout.
    Timeout,
}

impl DebugEvent
{
    /// Thread associated with the event, if any.
    #[must_use]
    pub fn thread(&self) -> Option<ThreadId>
    {
        match self {
            Self::ProcessCreated { main_thread, .. } => Some(*main_thread),
            Self::ThreadCreated { thread }
            | Self::ThreadExited { thread, .. }
            | Self::Breakpoint { thread, .. }
            | Self::SingleStep { thread, .. }
            | Self::AccessViolation { thread, .. }
            | Self::GuardPage { thread, .. }
            | Self::Exception { thread, .. }
            | Self::DebugString { thread, .. } => Some(*thread),
            Self::ModuleLoaded { .. } | Self::ModuleUnloaded { .. } | Self::ProcessExited { .. } | Self::Timeout => None,
        }
    }

    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::ProcessCreated {
                main_thread,
                image_base,
                entry,
            } => format!(
                "Process created (thread {}, image {image_base}, entry {entry})",
                main_thread.raw()
            ),
            Self::ThreadCreated { thread } => format!("Thread {} created", thread.raw()),
            Self::ThreadExited { thread, code } => format!("Thread {} exited with code {code}", thread.raw()),
            Self::ModuleLoaded { module } => format!("Loaded {} at {}", module.name, module.base),
            Self::ModuleUnloaded { base } => format!("Unloaded module at {base}"),
            Self::Breakpoint { thread, address } => format!("Hit breakpoint at {address} (thread {})", thread.raw()),
            Self::SingleStep { thread, address } => format!("Stepped to {address} (thread {})", thread.raw()),
            Self::AccessViolation {
                address,
                fault_address,
                access,
                first_chance,
                ..
            } => format!(
                "{} access violation ({access:?} of {fault_address}) at {address}",
                chance(*first_chance)
            ),
            Self::GuardPage {
                address, fault_address, ..
            } => format!("Guard page hit ({fault_address}) at {address}"),
            Self::Exception {
                code,
                address,
                first_chance,
                ..
            } => format!("{} exception 0x{code:08x} at {address}", chance(*first_chance)),
            Self::DebugString { message, .. } => format!("Debug string: {}", message.trim_end()),
            Self::ProcessExited { code } => format!("Process exited with code: {code}"),
            Self::Timeout => "Timed out waiting for an event".to_string(),
        }
    }
}

fn chance(first_chance: bool) -> &'static str
{
    if first_chance {
        "First-chance"
    } else {
        "Second-chance"
    }
}
