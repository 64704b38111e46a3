//! # Process Controller
//!
//! The seam between the engine and the operating system's debugging
//! facilities.
//!
//! ## Lifecycle
//!
//! 1. `launch(target)` or `attach(pid)` creates the [`DebugSession`]
//! 2. `wait_for_event` / `resume` drive the debuggee one event at a time
//! 3. `read_memory`, `set_breakpoint`, `protect_memory`, `step_instruction`
//!    inspect and steer it while it is stopped
//! 4. `terminate` (or `detach`) ends the session
//!
//! ## Threading
//!
//! A controller is single-threaded: every call is made from the thread that
//! created the debuggee, which is what the Windows debug API requires anyway.
//! The event loop is serial and events are consumed in the order the OS
//! delivers them.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::events::DebugEvent;
use crate::pe::TargetKind;
use crate::types::{Address, Architecture, MemoryRegion, ModuleInfo, ProcessId, Protection, Registers, ThreadId};

/// How a stopped event is continued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContinueMode
{
    /// The debugger consumed the event (`DBG_CONTINUE`).
    Handled,
    /// Pass the exception to the debuggee's own handlers (`DBG_EXCEPTION_NOT_HANDLED`).
    NotHandled,
}

/// What to start under debugger control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget
{
    /// Path of the protected file.
    pub path: PathBuf,
    /// Extra command-line arguments.
    pub args: Vec<String>,
    /// EXE files run directly; DLL files are hosted.
    pub kind: TargetKind,
    /// Bitness of the target file.
    pub architecture: Architecture,
}

impl LaunchTarget
{
    /// Lower-cased file name of the target, used to recognize its module.
    #[must_use]
    pub fn module_name(&self) -> String
    {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Live state of a debugged process
///
/// Owned by the controller; created on launch or attach and discarded when
/// the process exits or is terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSession
{
    /// Process identifier.
    pub pid: ProcessId,
    /// First thread of the process.
    pub main_thread: ThreadId,
    /// Bitness of the traced code.
    pub architecture: Architecture,
    /// The protected module once it is mapped.
    pub target: Option<ModuleInfo>,
    /// Every mapped module, in load order (the process image first).
    pub modules: Vec<ModuleInfo>,
    /// TEB of the main thread, for the traced bitness.
    pub teb: Address,
    /// PEB for the traced bitness.
    pub peb: Address,
    /// Thread that reported the most recent event.
    pub last_thread: Option<ThreadId>,
}

impl DebugSession
{
    /// Create a session with no modules yet.
    #[must_use]
    pub fn new(pid: ProcessId, main_thread: ThreadId, architecture: Architecture) -> Self
    {
        Self {
            pid,
            main_thread,
            architecture,
            target: None,
            modules: Vec::new(),
            teb: Address::ZERO,
            peb: Address::ZERO,
            last_thread: None,
        }
    }

    /// Module containing `address`.
    #[must_use]
    pub fn module_at(&self, address: Address) -> Option<&ModuleInfo>
    {
        self.modules.iter().find(|module| module.contains(address))
    }

    /// Module by (case-insensitive) file name.
    #[must_use]
    pub fn module_named(&self, name: &str) -> Option<&ModuleInfo>
    {
        self.modules.iter().find(|module| module.name.eq_ignore_ascii_case(name))
    }

    /// Keep the module list in sync with a debug event.
    pub fn observe(&mut self, event: &DebugEvent)
    {
        if let Some(thread) = event.thread() {
            self.last_thread = Some(thread);
        }
        match event {
            DebugEvent::ModuleLoaded { module } => {
                self.modules.retain(|known| known.base != module.base);
                self.modules.push(module.clone());
            }
            DebugEvent::ModuleUnloaded { base } => self.modules.retain(|known| known.base != *base),
            _ => {}
        }
    }
}

/// Operations the engine needs from a debugger backend
///
/// Implemented by the Windows backend and by [`crate::replay::ReplayController`].
pub trait ProcessController
{
    /// Start `target` suspended under debugger control.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::Launch`] if the process cannot be created.
    fn launch(&mut self, target: &LaunchTarget) -> Result<DebugSession>;

    /// Attach to an existing process.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::Attach`] on failure.
    fn attach(&mut self, pid: ProcessId) -> Result<DebugSession>;

    /// Current session, if a process is being debugged.
    fn session(&self) -> Option<&DebugSession>;

    /// Mutable access to the current session.
    fn session_mut(&mut self) -> Option<&mut DebugSession>;

    /// Read `len` bytes at `address`. Debugger breakpoints are masked out.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::MemoryAccess`] when any byte is unreadable.
    fn read_memory(&self, address: Address, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `address`.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::MemoryAccess`] when the range is not writable.
    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>;

    /// Change page protection, returning the previous protection of the first page.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::MemoryAccess`] when the range is not committed.
    fn protect_memory(&mut self, address: Address, len: u64, protection: Protection) -> Result<Protection>;

    /// Enumerate committed regions of the address space.
    ///
    /// ## Errors
    ///
    /// Platform errors from the region query.
    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>;

    /// Install a software breakpoint. Installing twice is a no-op.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::MemoryAccess`] when the byte cannot be patched.
    fn set_breakpoint(&mut self, address: Address) -> Result<()>;

    /// Remove a software breakpoint. Removing an unknown address is a no-op.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::MemoryAccess`] when the byte cannot be restored.
    fn remove_breakpoint(&mut self, address: Address) -> Result<()>;

    /// Register state of a stopped thread.
    ///
    /// ## Errors
    ///
    /// Platform errors reading the thread context.
    fn registers(&self, thread: ThreadId) -> Result<Registers>;

    /// Overwrite the register state of a stopped thread.
    ///
    /// ## Errors
    ///
    /// Platform errors writing the thread context.
    fn set_registers(&mut self, thread: ThreadId, registers: &Registers) -> Result<()>;

    /// Execute exactly one instruction on `thread` and return the new registers
    ///
    /// Other threads stay suspended for the duration of the step.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::StepInterrupted`] when the instruction raised an
    /// exception instead; that exception is delivered by the next
    /// `wait_for_event`.
    fn step_instruction(&mut self, thread: ThreadId) -> Result<Registers>;

    /// Set the trap flag on `thread` so the next `resume` reports a
    /// [`DebugEvent::SingleStep`] through the regular event loop.
    ///
    /// ## Errors
    ///
    /// Platform errors reading or writing the thread context.
    fn arm_single_step(&mut self, thread: ThreadId) -> Result<()>;

    /// Continue the last reported event.
    ///
    /// ## Errors
    ///
    /// Platform errors from the continue call.
    fn resume(&mut self, mode: ContinueMode) -> Result<()>;

    /// Block until the next debug event or until `timeout` elapses
    /// ([`DebugEvent::Timeout`]).
    ///
    /// ## Errors
    ///
    /// Platform errors from the wait.
    fn wait_for_event(&mut self, timeout: Duration) -> Result<DebugEvent>;

    /// Kill the debuggee and end the session.
    ///
    /// ## Errors
    ///
    /// Platform errors from process termination.
    fn terminate(&mut self) -> Result<()>;

    /// Detach, leaving the debuggee running.
    ///
    /// ## Errors
    ///
    /// Platform errors from the detach call.
    fn detach(&mut self) -> Result<()>;
}

/// Read-only view of some address space
///
/// The OEP detector and the emulator only ever read memory through this
/// trait, so they work the same over a live process, a snapshot, or a test
/// fixture.
pub trait MemoryView
{
    /// Read `len` bytes, or `None` when any of them is unavailable.
    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>>;

    /// Read a little-endian `u32`.
    fn read_u32(&self, address: Address) -> Option<u32>
    {
        let bytes = self.read_bytes(address, 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Read a little-endian `u64`.
    fn read_u64(&self, address: Address) -> Option<u64>
    {
        let bytes = self.read_bytes(address, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Read a pointer of the given architecture's width.
    fn read_pointer(&self, address: Address, arch: Architecture) -> Option<u64>
    {
        match arch {
            Architecture::X86 => self.read_u32(address).map(u64::from),
            Architecture::X86_64 => self.read_u64(address),
        }
    }
}

/// [`MemoryView`] over a live controller
pub struct LiveMemory<'a, C: ProcessController + ?Sized>(pub &'a C);

impl<C: ProcessController + ?Sized> MemoryView for LiveMemory<'_, C>
{
    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>>
    {
        self.0.read_memory(address, len).ok()
    }
}

/// Create the controller for the current platform
///
/// ## Errors
///
/// [`crate::UnpackError::InvalidArgument`] on hosts without a debugging backend.
#[cfg(all(windows, target_arch = "x86_64"))]
pub fn create_controller() -> Result<Box<dyn ProcessController>>
{
    Ok(Box::new(crate::platform::windows::WindowsController::new()))
}

/// Create the controller for the current platform
///
/// ## Errors
///
/// [`crate::UnpackError::InvalidArgument`] on hosts without a debugging backend.
#[cfg(not(all(windows, target_arch = "x86_64")))]
pub fn create_controller() -> Result<Box<dyn ProcessController>>
{
    Err(crate::error::UnpackError::InvalidArgument(
        "live tracing requires a 64-bit Windows host".to_string(),
    ))
}
