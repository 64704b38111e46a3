//! # Windows Debugging Backend
//!
//! [`ProcessController`] on top of the Win32 debug API.
//!
//! ## Key APIs Used
//!
//! - `CreateProcessW(DEBUG_ONLY_THIS_PROCESS)` / `DebugActiveProcess`: start or attach
//! - `WaitForDebugEvent` / `ContinueDebugEvent`: the event loop
//! - `ReadProcessMemory` / `WriteProcessMemory`: memory and `int3` patches
//! - `VirtualQueryEx` / `VirtualProtectEx`: region layout and execution traps
//! - `GetThreadContext` / `Wow64GetThreadContext`: registers, trap flag
//!
//! ## Event Handling
//!
//! The debuggee stays frozen from the moment an event is returned until
//! [`ProcessController::resume`]. A few events never reach the caller: the
//! loader breakpoints (native and WOW64) and the single steps used to move
//! past one of our own breakpoints.
//!
//! `step_instruction` continues the current stop and waits for the step with
//! every other thread suspended. If the instruction raises an exception
//! instead, that exception becomes the current stop and is queued; the next
//! `wait_for_event` returns it, and `resume` does nothing while a queued event
//! is still undelivered. Events are therefore always seen in OS order.
//!
//! Only 64-bit hosts are supported; 32-bit targets run under WOW64.

pub mod context;
pub mod guards;
pub mod launch;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use tracing::{debug, trace, warn};
use windows_sys::Win32::Foundation::{
    GetLastError, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, ERROR_SEM_TIMEOUT, HANDLE, NTSTATUS,
};
use windows_sys::Win32::Storage::FileSystem::{GetFinalPathNameByHandleW, FILE_NAME_NORMALIZED};
use windows_sys::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, FlushInstructionCache, ReadProcessMemory,
    WaitForDebugEvent, WriteProcessMemory, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT,
    EXCEPTION_DEBUG_EVENT, EXCEPTION_DEBUG_INFO, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT,
    LOAD_DLL_DEBUG_EVENT, OUTPUT_DEBUG_STRING_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use windows_sys::Win32::System::Memory::{
    VirtualProtectEx, VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_IMAGE, MEM_MAPPED,
};
use windows_sys::Win32::System::Threading::{IsWow64Process, OpenProcess, TerminateProcess, PROCESS_ALL_ACCESS};

use self::guards::{OwnedHandle, ThreadSuspendGuard};
use crate::breakpoints::{BreakpointState, BreakpointStore, INT3};
use crate::controller::{ContinueMode, DebugSession, LaunchTarget, ProcessController};
use crate::error::{Result, UnpackError};
use crate::events::{
    DebugEvent, FaultAccess, EXCEPTION_ACCESS_VIOLATION, EXCEPTION_BREAKPOINT, EXCEPTION_GUARD_PAGE,
    EXCEPTION_SINGLE_STEP, STATUS_WX86_BREAKPOINT, STATUS_WX86_SINGLE_STEP,
};
use crate::pe::{PeHeaders, TargetKind};
use crate::types::{
    Address, Architecture, MemoryRegion, ModuleInfo, ProcessId, Protection, RegionKind, Registers, ThreadId, PAGE_SIZE,
};

/// Upper bound of user-mode addresses on x64.
const USER_SPACE_END: u64 = 0x7FFF_FFFF_0000;
/// Offset of the 32-bit TEB from the 64-bit one in a WOW64 thread.
const WOW64_TEB_OFFSET: u64 = 0x2000;
/// `TEB64.ProcessEnvironmentBlock`
const TEB64_PEB: u64 = 0x60;
/// `TEB32.ProcessEnvironmentBlock`
const TEB32_PEB: u64 = 0x30;
/// How long one single step may take before it is reported as lost.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// The OS event the debuggee is currently stopped in
#[derive(Debug, Clone, Copy)]
struct Stop
{
    tid: u32,
    /// Our breakpoint that caused the stop, if any.
    breakpoint: Option<Address>,
}

/// Win32 debug API controller
#[derive(Debug, Default)]
pub struct WindowsController
{
    process: Option<OwnedHandle>,
    pid: u32,
    session: Option<DebugSession>,
    /// Thread handles owned by the debug API (closed by the OS on exit events).
    threads: FxHashMap<ThreadId, HANDLE>,
    breakpoints: BreakpointStore,
    stop: Option<Stop>,
    pending: VecDeque<DebugEvent>,
    step_over: Option<(ThreadId, Address)>,
    armed: Vec<ThreadId>,
    loader_breaks: u8,
    hosted_module: Option<String>,
    exited: bool,
}

impl WindowsController
{
    /// A controller with no debuggee.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    fn process(&self) -> Result<HANDLE>
    {
        self.process
            .as_ref()
            .map(OwnedHandle::raw)
            .ok_or_else(|| UnpackError::InvalidArgument("no process is being debugged".to_string()))
    }

    fn architecture(&self) -> Architecture
    {
        self.session.as_ref().map_or(Architecture::X86_64, |session| session.architecture)
    }

    fn thread(&self, thread: ThreadId) -> Result<HANDLE>
    {
        self.threads
            .get(&thread)
            .copied()
            .ok_or_else(|| UnpackError::InvalidArgument(format!("unknown thread {}", thread.raw())))
    }

    fn reset(&mut self)
    {
        // Release the handle first so dropping the old state does not terminate again.
        self.process = None;
        *self = Self::default();
    }

    fn read_raw(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let process = self.process()?;
        let mut buffer = vec![0u8; len];
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                process,
                address.value() as usize as *const _,
                buffer.as_mut_ptr().cast(),
                len,
                &mut read,
            )
        };
        if ok == 0 || read != len {
            return Err(UnpackError::memory(address.value(), len));
        }
        Ok(buffer)
    }

    fn write_raw(&self, address: Address, data: &[u8]) -> Result<()>
    {
        let process = self.process()?;
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                process,
                address.value() as usize as *const _,
                data.as_ptr().cast(),
                data.len(),
                &mut written,
            )
        };
        if ok == 0 || written != data.len() {
            return Err(UnpackError::memory(address.value(), data.len()));
        }
        unsafe {
            FlushInstructionCache(process, address.value() as usize as *const _, data.len());
        }
        Ok(())
    }

    /// Put the original byte back under a breakpoint for a step.
    fn lift(&mut self, address: Address) -> Result<bool>
    {
        let Some(entry) = self.breakpoints.get(address) else {
            return Ok(false);
        };
        if entry.state != BreakpointState::Installed {
            return Ok(false);
        }
        self.write_raw(address, &[entry.original])?;
        self.breakpoints.set_state(address, BreakpointState::Suspended);
        Ok(true)
    }

    fn reinstall(&mut self, address: Address) -> Result<()>
    {
        if self.breakpoints.get(address).is_some_and(|entry| entry.state == BreakpointState::Suspended) {
            self.write_raw(address, &[INT3])?;
            self.breakpoints.set_state(address, BreakpointState::Installed);
        }
        Ok(())
    }

    fn continue_stop(&mut self, status: NTSTATUS) -> Result<()>
    {
        if let Some(stop) = self.stop.take() {
            if unsafe { ContinueDebugEvent(self.pid, stop.tid, status) } == 0 {
                return Err(UnpackError::last_os_error("ContinueDebugEvent"));
            }
        }
        Ok(())
    }

    /// Wait for the next raw event; `None` on timeout.
    fn next_raw(&mut self, timeout: Duration) -> Result<Option<DEBUG_EVENT>>
    {
        let millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
        let mut event: DEBUG_EVENT = unsafe { std::mem::zeroed() };
        if unsafe { WaitForDebugEvent(&mut event, millis) } == 0 {
            if unsafe { GetLastError() } == ERROR_SEM_TIMEOUT {
                return Ok(None);
            }
            return Err(UnpackError::last_os_error("WaitForDebugEvent"));
        }
        self.stop = Some(Stop {
            tid: event.dwThreadId,
            breakpoint: None,
        });
        Ok(Some(event))
    }

    /// Consume the creation event of a new debuggee and queue it.
    fn take_creation(&mut self) -> Result<()>
    {
        let deadline = Instant::now() + STEP_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(raw) = self.next_raw(remaining)? else {
                return Err(UnpackError::Launch("no process creation event arrived".to_string()));
            };
            let created = raw.dwDebugEventCode == CREATE_PROCESS_DEBUG_EVENT;
            if let Some(event) = self.translate(&raw)? {
                self.pending.push_back(event);
            }
            if created {
                return Ok(());
            }
        }
    }

    fn translate(&mut self, raw: &DEBUG_EVENT) -> Result<Option<DebugEvent>>
    {
        let thread = ThreadId(raw.dwThreadId);
        let event = match raw.dwDebugEventCode {
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = unsafe { raw.u.CreateProcessInfo };
                let file = OwnedHandle::new(info.hFile);
                self.threads.insert(thread, info.hThread);
                let image_base = Address::new(info.lpBaseOfImage as usize as u64);
                self.locate_environment(Address::new(info.lpThreadLocalBase as usize as u64));
                let headers = self.headers_at(image_base);
                let path = file.as_ref().and_then(final_path);
                let module = self.module_record(image_base, path, headers.as_ref());
                let entry = headers.map_or(Address::ZERO, |h| image_base + u64::from(h.entry_rva));
                if let Some(session) = self.session.as_mut() {
                    session.modules.push(module);
                }
                DebugEvent::ProcessCreated {
                    main_thread: thread,
                    image_base,
                    entry,
                }
            }
            CREATE_THREAD_DEBUG_EVENT => {
                let info = unsafe { raw.u.CreateThread };
                self.threads.insert(thread, info.hThread);
                DebugEvent::ThreadCreated { thread }
            }
            EXIT_THREAD_DEBUG_EVENT => {
                self.threads.remove(&thread);
                self.armed.retain(|armed| *armed != thread);
                DebugEvent::ThreadExited {
                    thread,
                    code: unsafe { raw.u.ExitThread.dwExitCode },
                }
            }
            EXIT_PROCESS_DEBUG_EVENT => {
                self.exited = true;
                DebugEvent::ProcessExited {
                    code: unsafe { raw.u.ExitProcess.dwExitCode },
                }
            }
            LOAD_DLL_DEBUG_EVENT => {
                let info = unsafe { raw.u.LoadDll };
                let file = OwnedHandle::new(info.hFile);
                let base = Address::new(info.lpBaseOfDll as usize as u64);
                let headers = self.headers_at(base);
                let module = self.module_record(base, file.as_ref().and_then(final_path), headers.as_ref());
                if self.hosted_module.as_deref() == Some(module.name.as_str()) {
                    debug!("Hosted target {} mapped at {base}", module.name);
                }
                DebugEvent::ModuleLoaded { module }
            }
            UNLOAD_DLL_DEBUG_EVENT => DebugEvent::ModuleUnloaded {
                base: Address::new(unsafe { raw.u.UnloadDll.lpBaseOfDll } as usize as u64),
            },
            OUTPUT_DEBUG_STRING_EVENT => {
                let info = unsafe { raw.u.DebugString };
                let address = Address::new(info.lpDebugStringData as usize as u64);
                let length = usize::from(info.nDebugStringLength);
                let message = if info.fUnicode != 0 {
                    self.read_raw(address, length * 2)
                        .map(|bytes| {
                            let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
                            String::from_utf16_lossy(&units)
                        })
                        .unwrap_or_default()
                } else {
                    self.read_raw(address, length)
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                        .unwrap_or_default()
                };
                DebugEvent::DebugString {
                    thread,
                    message: message.trim_end_matches(['\0', '\n', '\r']).to_string(),
                }
            }
            EXCEPTION_DEBUG_EVENT => {
                let info = unsafe { raw.u.Exception };
                return self.translate_exception(thread, &info);
            }
            other => {
                trace!("Ignoring debug event {other}");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    fn translate_exception(&mut self, thread: ThreadId, info: &EXCEPTION_DEBUG_INFO) -> Result<Option<DebugEvent>>
    {
        let record = &info.ExceptionRecord;
        let code = record.ExceptionCode as u32;
        let address = Address::new(record.ExceptionAddress as usize as u64);
        let first_chance = info.dwFirstChance != 0;
        let parameter = |index: usize| record.ExceptionInformation[index] as u64;

        let event = match code {
            EXCEPTION_BREAKPOINT | STATUS_WX86_BREAKPOINT => {
                if first_chance && self.breakpoints.contains(address) {
                    let handle = self.thread(thread)?;
                    let mut registers = context::read(handle, self.architecture())?;
                    registers.pc = address;
                    context::write(handle, self.architecture(), &registers)?;
                    self.breakpoints.record_hit(address);
                    if let Some(stop) = self.stop.as_mut() {
                        stop.breakpoint = Some(address);
                    }
                    DebugEvent::Breakpoint { thread, address }
                } else if self.loader_breaks > 0 {
                    self.loader_breaks -= 1;
                    debug!("Skipping loader breakpoint at {address}");
                    return Ok(None);
                } else {
                    DebugEvent::Exception {
                        thread,
                        code,
                        address,
                        first_chance,
                    }
                }
            }
            EXCEPTION_SINGLE_STEP | STATUS_WX86_SINGLE_STEP => {
                let mut internal = false;
                if let Some((stepping, breakpoint)) = self.step_over {
                    if stepping == thread {
                        self.step_over = None;
                        self.reinstall(breakpoint)?;
                        internal = true;
                    }
                }
                if let Some(index) = self.armed.iter().position(|armed| *armed == thread) {
                    self.armed.swap_remove(index);
                    DebugEvent::SingleStep { thread, address }
                } else if internal {
                    return Ok(None);
                } else {
                    DebugEvent::Exception {
                        thread,
                        code,
                        address,
                        first_chance,
                    }
                }
            }
            EXCEPTION_ACCESS_VIOLATION => DebugEvent::AccessViolation {
                thread,
                address,
                fault_address: Address::new(parameter(1)),
                access: FaultAccess::from_raw(parameter(0)),
                first_chance,
            },
            EXCEPTION_GUARD_PAGE => DebugEvent::GuardPage {
                thread,
                address,
                fault_address: Address::new(parameter(1)),
            },
            _ => DebugEvent::Exception {
                thread,
                code,
                address,
                first_chance,
            },
        };
        Ok(Some(event))
    }

    /// Fill in TEB/PEB for the traced bitness from the main thread's TEB64.
    fn locate_environment(&mut self, teb64: Address)
    {
        let arch = self.architecture();
        let (teb, peb) = match arch {
            Architecture::X86_64 => (teb64, self.read_pointer(teb64 + TEB64_PEB, arch)),
            Architecture::X86 => {
                let teb32 = teb64 + WOW64_TEB_OFFSET;
                (teb32, self.read_pointer(teb32 + TEB32_PEB, arch))
            }
        };
        if peb.is_null() {
            warn!("Could not read the PEB pointer from TEB {teb}");
        }
        if let Some(session) = self.session.as_mut() {
            session.teb = teb;
            session.peb = peb;
        }
    }

    fn read_pointer(&self, address: Address, arch: Architecture) -> Address
    {
        let Ok(bytes) = self.read_raw(address, arch.pointer_size() as usize) else {
            return Address::ZERO;
        };
        let value = match arch {
            Architecture::X86 => u64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Architecture::X86_64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_le_bytes(raw)
            }
        };
        Address::new(value)
    }

    fn headers_at(&self, base: Address) -> Option<PeHeaders>
    {
        let bytes = self.read_raw(base, PAGE_SIZE as usize).ok()?;
        PeHeaders::parse(&bytes).ok()
    }

    fn module_record(&self, base: Address, path: Option<PathBuf>, headers: Option<&PeHeaders>) -> ModuleInfo
    {
        let size = headers.map_or(PAGE_SIZE, |h| u64::from(h.size_of_image));
        let name = path.as_deref().map(launch::file_name).unwrap_or_else(|| format!("module_{:x}", base.value()));
        let mut module = ModuleInfo::new(&name, base, size);
        module.path = path;
        module
    }

    fn begin_session(&mut self, process: OwnedHandle, pid: u32, tid: u32, architecture: Architecture)
    {
        self.reset();
        self.process = Some(process);
        self.pid = pid;
        self.session = Some(DebugSession::new(ProcessId(pid), ThreadId(tid), architecture));
        // The native loader breaks once; WOW64 adds a second break for the 32-bit loader.
        self.loader_breaks = match architecture {
            Architecture::X86 => 2,
            Architecture::X86_64 => 1,
        };
    }

    fn session_snapshot(&self) -> Result<DebugSession>
    {
        self.session
            .clone()
            .ok_or_else(|| UnpackError::InvalidArgument("no active debug session".to_string()))
    }
}

impl ProcessController for WindowsController
{
    fn launch(&mut self, target: &LaunchTarget) -> Result<DebugSession>
    {
        if self.session.is_some() {
            return Err(UnpackError::Launch("a debug session is already active".to_string()));
        }
        let spawned = launch::spawn(target)?;
        self.begin_session(spawned.process, spawned.pid, spawned.tid, target.architecture);
        if target.kind == TargetKind::Dll {
            self.hosted_module = Some(target.module_name());
        }
        self.take_creation()?;
        debug!("Debugging pid {} ({})", spawned.pid, target.architecture);
        self.session_snapshot()
    }

    fn attach(&mut self, pid: ProcessId) -> Result<DebugSession>
    {
        let attach_error = |reason: String| UnpackError::Attach { pid: pid.0, reason };
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, 0, pid.0) };
        let process = OwnedHandle::new(handle).ok_or_else(|| attach_error(std::io::Error::last_os_error().to_string()))?;
        let mut wow64 = 0;
        if unsafe { IsWow64Process(process.raw(), &mut wow64) } == 0 {
            return Err(attach_error(std::io::Error::last_os_error().to_string()));
        }
        if unsafe { DebugActiveProcess(pid.0) } == 0 {
            return Err(attach_error(std::io::Error::last_os_error().to_string()));
        }
        let architecture = if wow64 != 0 { Architecture::X86 } else { Architecture::X86_64 };
        self.begin_session(process, pid.0, 0, architecture);
        // Attaching injects a single break-in thread regardless of bitness.
        self.loader_breaks = 1;
        self.take_creation().map_err(|e| attach_error(e.to_string()))?;
        if let Some(session) = self.session.as_mut() {
            session.main_thread = ThreadId(self.stop.map_or(0, |stop| stop.tid));
        }
        self.session_snapshot()
    }

    fn session(&self) -> Option<&DebugSession>
    {
        self.session.as_ref()
    }

    fn session_mut(&mut self) -> Option<&mut DebugSession>
    {
        self.session.as_mut()
    }

    fn read_memory(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let mut bytes = self.read_raw(address, len)?;
        self.breakpoints.mask(address, &mut bytes);
        Ok(bytes)
    }

    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        let end = address + data.len() as u64;
        let mut patched = data.to_vec();
        let covered: Vec<Address> = (0..data.len() as u64)
            .map(|offset| address + offset)
            .filter(|at| self.breakpoints.get(*at).is_some_and(|e| e.state == BreakpointState::Installed))
            .collect();
        for at in &covered {
            let offset = (*at - address) as usize;
            self.breakpoints.set_original(*at, data[offset]);
            patched[offset] = INT3;
        }
        trace!("Writing {} bytes at {address}..{end}", data.len());
        self.write_raw(address, &patched)
    }

    fn protect_memory(&mut self, address: Address, len: u64, protection: Protection) -> Result<Protection>
    {
        let process = self.process()?;
        let mut previous = 0u32;
        let ok = unsafe {
            VirtualProtectEx(
                process,
                address.value() as usize as *const _,
                len as usize,
                protection.to_win32(),
                &mut previous,
            )
        };
        if ok == 0 {
            return Err(UnpackError::last_os_error("VirtualProtectEx"));
        }
        Ok(Protection::from_win32(previous))
    }

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>
    {
        let process = self.process()?;
        let mut regions = Vec::new();
        let mut cursor = 0u64;
        while cursor < USER_SPACE_END {
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            let written = unsafe {
                VirtualQueryEx(
                    process,
                    cursor as usize as *const _,
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 || info.RegionSize == 0 {
                break;
            }
            let base = info.BaseAddress as usize as u64;
            let size = info.RegionSize as u64;
            if info.State == MEM_COMMIT {
                let kind = match info.Type {
                    MEM_IMAGE => RegionKind::Image,
                    MEM_MAPPED => RegionKind::Mapped,
                    _ => RegionKind::Private,
                };
                regions.push(MemoryRegion {
                    base: Address::new(base),
                    size,
                    protection: Protection::from_win32(info.Protect),
                    kind,
                    allocation_base: Address::new(info.AllocationBase as usize as u64),
                });
            }
            cursor = base.saturating_add(size);
        }
        Ok(regions)
    }

    fn set_breakpoint(&mut self, address: Address) -> Result<()>
    {
        if self.breakpoints.contains(address) {
            return Ok(());
        }
        let original = self.read_raw(address, 1)?[0];
        self.write_raw(address, &[INT3])?;
        self.breakpoints.insert(address, original);
        trace!("Breakpoint set at {address}");
        Ok(())
    }

    fn remove_breakpoint(&mut self, address: Address) -> Result<()>
    {
        let Some(entry) = self.breakpoints.remove(address) else {
            return Ok(());
        };
        if entry.state == BreakpointState::Installed {
            self.write_raw(address, &[entry.original])?;
        }
        if self.step_over.is_some_and(|(_, at)| at == address) {
            self.step_over = None;
        }
        Ok(())
    }

    fn registers(&self, thread: ThreadId) -> Result<Registers>
    {
        context::read(self.thread(thread)?, self.architecture())
    }

    fn set_registers(&mut self, thread: ThreadId, registers: &Registers) -> Result<()>
    {
        context::write(self.thread(thread)?, self.architecture(), registers)
    }

    fn step_instruction(&mut self, thread: ThreadId) -> Result<Registers>
    {
        let stop = self
            .stop
            .ok_or_else(|| UnpackError::InvalidArgument("the target is not stopped".to_string()))?;
        if !self.pending.is_empty() {
            return Err(UnpackError::InvalidArgument("an undelivered event is pending".to_string()));
        }
        let arch = self.architecture();
        let handle = self.thread(thread)?;
        let pc = context::read(handle, arch)?.pc;
        let lifted = self.lift(pc)?;
        context::set_trap_flag(handle, arch, true)?;

        let mut frozen = Vec::new();
        for (&other, &other_handle) in &self.threads {
            if other != thread {
                frozen.push(ThreadSuspendGuard::new(other_handle)?);
            }
        }
        trace!("Stepping thread {} at {pc} (stopped by {})", thread.raw(), stop.tid);
        self.continue_stop(DBG_CONTINUE)?;

        let outcome = loop {
            let Some(raw) = self.next_raw(STEP_TIMEOUT)? else {
                break Err(UnpackError::InvalidArgument(format!("single step at {pc} did not complete")));
            };
            if raw.dwDebugEventCode == EXCEPTION_DEBUG_EVENT {
                let record = unsafe { raw.u.Exception.ExceptionRecord };
                let code = record.ExceptionCode as u32;
                let stepped = raw.dwThreadId == thread.raw()
                    && matches!(code, EXCEPTION_SINGLE_STEP | STATUS_WX86_SINGLE_STEP);
                if stepped {
                    break Ok(());
                }
                if let Some(event) = self.translate(&raw)? {
                    self.pending.push_back(event);
                }
                context::set_trap_flag(handle, arch, false)?;
                break Err(UnpackError::StepInterrupted {
                    code,
                    address: record.ExceptionAddress as usize as u64,
                });
            }
            let exited = raw.dwDebugEventCode == EXIT_PROCESS_DEBUG_EVENT;
            if let Some(event) = self.translate(&raw)? {
                self.pending.push_back(event);
            }
            if exited {
                break Err(UnpackError::StepInterrupted {
                    code: 0,
                    address: pc.value(),
                });
            }
            self.continue_stop(DBG_CONTINUE)?;
        };
        drop(frozen);

        if lifted && !self.exited {
            self.reinstall(pc)?;
        }
        outcome?;
        context::read(handle, arch)
    }

    fn arm_single_step(&mut self, thread: ThreadId) -> Result<()>
    {
        context::set_trap_flag(self.thread(thread)?, self.architecture(), true)?;
        if !self.armed.contains(&thread) {
            self.armed.push(thread);
        }
        Ok(())
    }

    fn resume(&mut self, mode: ContinueMode) -> Result<()>
    {
        // A queued event is still waiting for the caller's decision.
        if !self.pending.is_empty() {
            return Ok(());
        }
        let Some(stop) = self.stop else {
            return Ok(());
        };
        let status = match mode {
            ContinueMode::Handled => DBG_CONTINUE,
            ContinueMode::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
        };
        if let (ContinueMode::Handled, Some(address)) = (mode, stop.breakpoint) {
            let thread = ThreadId(stop.tid);
            if self.lift(address)? {
                context::set_trap_flag(self.thread(thread)?, self.architecture(), true)?;
                self.step_over = Some((thread, address));
            }
        }
        self.continue_stop(status)
    }

    fn wait_for_event(&mut self, timeout: Duration) -> Result<DebugEvent>
    {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        if self.exited {
            return Ok(DebugEvent::Timeout);
        }
        self.continue_stop(DBG_CONTINUE)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(raw) = self.next_raw(remaining)? else {
                return Ok(DebugEvent::Timeout);
            };
            match self.translate(&raw)? {
                Some(event) => return Ok(event),
                None => self.continue_stop(DBG_CONTINUE)?,
            }
        }
    }

    fn terminate(&mut self) -> Result<()>
    {
        let Ok(process) = self.process() else {
            return Ok(());
        };
        if !self.exited && unsafe { TerminateProcess(process, 1) } == 0 {
            warn!("TerminateProcess failed: {}", std::io::Error::last_os_error());
        }
        // Drain until the exit event so the process object is released.
        self.pending.clear();
        let deadline = Instant::now() + STEP_TIMEOUT;
        while !self.exited {
            self.continue_stop(DBG_CONTINUE)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(raw) = self.next_raw(remaining)? else {
                break;
            };
            if raw.dwDebugEventCode == EXIT_PROCESS_DEBUG_EVENT {
                self.exited = true;
            }
            drop(loaded_file(&raw));
        }
        self.continue_stop(DBG_CONTINUE)?;
        debug!("Terminated pid {}", self.pid);
        self.reset();
        Ok(())
    }

    fn detach(&mut self) -> Result<()>
    {
        if self.process.is_none() {
            return Ok(());
        }
        for entry in self.breakpoints.drain() {
            if entry.state == BreakpointState::Installed {
                if let Err(e) = self.write_raw(entry.address, &[entry.original]) {
                    warn!("Could not restore byte at {}: {e}", entry.address);
                }
            }
        }
        for thread in std::mem::take(&mut self.armed) {
            if let Ok(handle) = self.thread(thread) {
                context::set_trap_flag(handle, self.architecture(), false)?;
            }
        }
        self.pending.clear();
        self.continue_stop(DBG_CONTINUE)?;
        if unsafe { DebugActiveProcessStop(self.pid) } == 0 {
            return Err(UnpackError::last_os_error("DebugActiveProcessStop"));
        }
        self.reset();
        Ok(())
    }
}

impl Drop for WindowsController
{
    fn drop(&mut self)
    {
        if self.process.is_some() {
            if let Err(e) = self.terminate() {
                warn!("Could not terminate debuggee on drop: {e}");
            }
        }
    }
}

/// File handle carried by a load event, which the debugger must close.
fn loaded_file(raw: &DEBUG_EVENT) -> Option<OwnedHandle>
{
    match raw.dwDebugEventCode {
        CREATE_PROCESS_DEBUG_EVENT => OwnedHandle::new(unsafe { raw.u.CreateProcessInfo.hFile }),
        LOAD_DLL_DEBUG_EVENT => OwnedHandle::new(unsafe { raw.u.LoadDll.hFile }),
        _ => None,
    }
}

/// Full path of an open file.
fn final_path(file: &OwnedHandle) -> Option<PathBuf>
{
    let mut buffer = vec![0u16; 1024];
    let len = unsafe { GetFinalPathNameByHandleW(file.raw(), buffer.as_mut_ptr(), buffer.len() as u32, FILE_NAME_NORMALIZED) }
        as usize;
    if len == 0 || len > buffer.len() {
        return None;
    }
    let path = String::from_utf16_lossy(&buffer[..len]);
    Some(PathBuf::from(path.strip_prefix(r"\\?\").unwrap_or(&path)))
}
