//! # Replay Controller
//!
//! A [`ProcessController`] that plays back a recorded event script against an
//! in-memory address space. The detector, tracer, resolver and reconstructor
//! only ever see [`DebugEvent`]s and memory, so a script reproduces a run
//! exactly, on any host.
//!
//! Time is simulated: every scripted event advances a shared [`ManualClock`],
//! and waiting on an exhausted script advances it by the full wait.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use peeler_core::clock::Clock;
//! use peeler_core::controller::{DebugSession, ProcessController};
//! use peeler_core::events::DebugEvent;
//! use peeler_core::replay::{ReplayController, ScriptedEvent};
//! use peeler_core::types::{Architecture, ProcessId, ThreadId};
//!
//! let session = DebugSession::new(ProcessId(4), ThreadId(8), Architecture::X86);
//! let mut replay = ReplayController::new(session)
//!     .with_event(ScriptedEvent::new(DebugEvent::ProcessExited { code: 0 }).after(Duration::from_secs(1)));
//! let clock = replay.clock();
//!
//! assert_eq!(replay.wait_for_event(Duration::from_secs(5))?, DebugEvent::ProcessExited { code: 0 });
//! assert_eq!(replay.wait_for_event(Duration::from_millis(250))?, DebugEvent::Timeout);
//! assert_eq!(clock.elapsed(), Duration::from_millis(1250));
//! # Ok::<(), peeler_core::UnpackError>(())
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use fxhash::FxHashMap;
use tracing::trace;

use crate::breakpoints::BreakpointStore;
use crate::clock::ManualClock;
use crate::controller::{ContinueMode, DebugSession, LaunchTarget, ProcessController};
use crate::error::{Result, UnpackError};
use crate::events::DebugEvent;
use crate::types::{Address, MemoryRegion, ProcessId, Protection, RegionKind, Registers, ThreadId, PAGE_SIZE};

/// An event in a replay script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedEvent
{
    /// The event to deliver.
    pub event: DebugEvent,
    /// Register state of the reporting thread, if the event carries one.
    pub registers: Option<Registers>,
    /// Memory the target wrote since the previous event.
    pub writes: Vec<(Address, Vec<u8>)>,
    /// Simulated time that passed before the event.
    pub elapsed: Duration,
}

impl ScriptedEvent
{
    /// An event with no side effects.
    #[must_use]
    pub fn new(event: DebugEvent) -> Self
    {
        Self {
            event,
            registers: None,
            writes: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Registers of the event thread.
    #[must_use]
    pub fn with_registers(mut self, registers: Registers) -> Self
    {
        self.registers = Some(registers);
        self
    }

    /// Memory written by the target before this event (for example an unpacked section).
    #[must_use]
    pub fn with_write(mut self, address: Address, bytes: impl Into<Vec<u8>>) -> Self
    {
        self.writes.push((address, bytes.into()));
        self
    }

    /// Time that passes before the event.
    #[must_use]
    pub fn after(mut self, elapsed: Duration) -> Self
    {
        self.elapsed = elapsed;
        self
    }
}

/// One entry of a replay script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStep
{
    /// Delivered by `wait_for_event`.
    Event(ScriptedEvent),
    /// Result of one `step_instruction`.
    Step(Registers),
    /// A `step_instruction` that raised an exception; the exception itself is
    /// the next scripted event.
    Interrupt
    {
        /// Exception code.
        code: u32,
        /// Faulting instruction.
        address: u64,
    },
}

#[derive(Debug, Clone)]
struct Page
{
    data: Vec<u8>,
    protection: Protection,
    kind: RegionKind,
    allocation_base: Address,
}

/// Scripted, in-memory debugger backend
#[derive(Debug)]
pub struct ReplayController
{
    script: VecDeque<ReplayStep>,
    pages: BTreeMap<u64, Page>,
    registers: FxHashMap<ThreadId, Registers>,
    breakpoints: BreakpointStore,
    clock: ManualClock,
    prepared: DebugSession,
    session: Option<DebugSession>,
    resumes: Vec<ContinueMode>,
    armed_steps: Vec<ThreadId>,
    terminated: bool,
}

impl ReplayController
{
    /// A controller whose `launch`/`attach` returns `session`.
    #[must_use]
    pub fn new(session: DebugSession) -> Self
    {
        Self {
            script: VecDeque::new(),
            pages: BTreeMap::new(),
            registers: FxHashMap::default(),
            breakpoints: BreakpointStore::new(),
            clock: ManualClock::new(),
            prepared: session,
            session: None,
            resumes: Vec::new(),
            armed_steps: Vec::new(),
            terminated: false,
        }
    }

    /// Map `data` at `base` (page aligned, zero padded to a page multiple).
    #[must_use]
    pub fn with_region(mut self, base: Address, data: &[u8], protection: Protection, kind: RegionKind) -> Self
    {
        self.map(base, data, protection, kind);
        self
    }

    /// Append an event to the script.
    #[must_use]
    pub fn with_event(mut self, event: ScriptedEvent) -> Self
    {
        self.script.push_back(ReplayStep::Event(event));
        self
    }

    /// Append any script entry.
    #[must_use]
    pub fn with_step(mut self, step: ReplayStep) -> Self
    {
        self.script.push_back(step);
        self
    }

    /// Map memory after construction.
    pub fn map(&mut self, base: Address, data: &[u8], protection: Protection, kind: RegionKind)
    {
        let base = base.page_floor(PAGE_SIZE);
        let page_count = (data.len() as u64).div_ceil(PAGE_SIZE).max(1);
        for index in 0..page_count {
            let start = (index * PAGE_SIZE) as usize;
            let mut bytes = vec![0u8; PAGE_SIZE as usize];
            if start < data.len() {
                let end = data.len().min(start + PAGE_SIZE as usize);
                bytes[..end - start].copy_from_slice(&data[start..end]);
            }
            self.pages.insert(
                base.value() + index * PAGE_SIZE,
                Page {
                    data: bytes,
                    protection,
                    kind,
                    allocation_base: base,
                },
            );
        }
    }

    /// The clock the script advances; pass it to the tracer.
    #[must_use]
    pub fn clock(&self) -> ManualClock
    {
        self.clock.clone()
    }

    /// Continue modes passed to `resume`, in order.
    #[must_use]
    pub fn resumes(&self) -> &[ContinueMode]
    {
        &self.resumes
    }

    /// Threads single steps were armed for.
    #[must_use]
    pub fn armed_steps(&self) -> &[ThreadId]
    {
        &self.armed_steps
    }

    /// Currently installed breakpoints.
    #[must_use]
    pub fn breakpoints(&self) -> &BreakpointStore
    {
        &self.breakpoints
    }

    /// Whether `terminate` was called.
    #[must_use]
    pub fn is_terminated(&self) -> bool
    {
        self.terminated
    }

    /// Script entries not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> usize
    {
        self.script.len()
    }

    /// Current protection of the page holding `address`.
    #[must_use]
    pub fn protection_at(&self, address: Address) -> Option<Protection>
    {
        self.pages.get(&address.page_floor(PAGE_SIZE).value()).map(|page| page.protection)
    }

    fn page_of(&self, address: Address) -> Option<&Page>
    {
        self.pages.get(&address.page_floor(PAGE_SIZE).value())
    }

    fn deliver(&mut self, scripted: ScriptedEvent) -> Result<DebugEvent>
    {
        self.clock.advance(scripted.elapsed);
        for (address, bytes) in &scripted.writes {
            self.write_memory(*address, bytes)?;
        }
        if let (Some(registers), Some(thread)) = (scripted.registers, scripted.event.thread()) {
            self.registers.insert(thread, registers);
        }
        if let DebugEvent::ProcessExited { .. } = scripted.event {
            self.session = None;
        }
        trace!("Replaying {}", scripted.event.describe());
        Ok(scripted.event)
    }
}

impl ProcessController for ReplayController
{
    fn launch(&mut self, target: &LaunchTarget) -> Result<DebugSession>
    {
        trace!("Replaying launch of {}", target.path.display());
        self.session = Some(self.prepared.clone());
        self.terminated = false;
        Ok(self.prepared.clone())
    }

    fn attach(&mut self, pid: ProcessId) -> Result<DebugSession>
    {
        if pid != self.prepared.pid {
            return Err(UnpackError::Attach {
                pid: pid.0,
                reason: "no such process in the replay".to_string(),
            });
        }
        self.session = Some(self.prepared.clone());
        Ok(self.prepared.clone())
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
        let mut out = Vec::with_capacity(len);
        let mut cursor = address;
        while out.len() < len {
            let page = self
                .page_of(cursor)
                .ok_or_else(|| UnpackError::memory(address.value(), len))?;
            let offset = (cursor - cursor.page_floor(PAGE_SIZE)) as usize;
            let take = (len - out.len()).min(PAGE_SIZE as usize - offset);
            out.extend_from_slice(&page.data[offset..offset + take]);
            cursor = cursor + take as u64;
        }
        Ok(out)
    }

    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        // Validate the whole range first so a failed write changes nothing.
        let mut cursor = address.page_floor(PAGE_SIZE);
        while cursor < address + data.len() as u64 {
            if self.page_of(cursor).is_none() {
                return Err(UnpackError::memory(address.value(), data.len()));
            }
            cursor = cursor + PAGE_SIZE;
        }
        for (index, byte) in data.iter().enumerate() {
            let at = address + index as u64;
            if let Some(page) = self.pages.get_mut(&at.page_floor(PAGE_SIZE).value()) {
                page.data[(at - at.page_floor(PAGE_SIZE)) as usize] = *byte;
            }
        }
        Ok(())
    }

    fn protect_memory(&mut self, address: Address, len: u64, protection: Protection) -> Result<Protection>
    {
        let first = address.page_floor(PAGE_SIZE);
        let previous = self
            .page_of(first)
            .map(|page| page.protection)
            .ok_or_else(|| UnpackError::memory(address.value(), len as usize))?;
        let mut cursor = first;
        while cursor < address + len.max(1) {
            if let Some(page) = self.pages.get_mut(&cursor.value()) {
                page.protection = protection;
            }
            cursor = cursor + PAGE_SIZE;
        }
        Ok(previous)
    }

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>
    {
        let mut regions: Vec<MemoryRegion> = Vec::new();
        for (&base, page) in &self.pages {
            if let Some(last) = regions.last_mut() {
                if last.end().value() == base
                    && last.protection == page.protection
                    && last.kind == page.kind
                    && last.allocation_base == page.allocation_base
                {
                    last.size += PAGE_SIZE;
                    continue;
                }
            }
            regions.push(MemoryRegion {
                base: Address::new(base),
                size: PAGE_SIZE,
                protection: page.protection,
                kind: page.kind,
                allocation_base: page.allocation_base,
            });
        }
        Ok(regions)
    }

    fn set_breakpoint(&mut self, address: Address) -> Result<()>
    {
        let original = self
            .page_of(address)
            .map(|page| page.data[(address - address.page_floor(PAGE_SIZE)) as usize])
            .ok_or_else(|| UnpackError::memory(address.value(), 1))?;
        self.breakpoints.insert(address, original);
        Ok(())
    }

    fn remove_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.remove(address);
        Ok(())
    }

    fn registers(&self, thread: ThreadId) -> Result<Registers>
    {
        self.registers
            .get(&thread)
            .copied()
            .ok_or_else(|| UnpackError::InvalidArgument(format!("no registers recorded for thread {}", thread.0)))
    }

    fn set_registers(&mut self, thread: ThreadId, registers: &Registers) -> Result<()>
    {
        self.registers.insert(thread, *registers);
        Ok(())
    }

    fn step_instruction(&mut self, thread: ThreadId) -> Result<Registers>
    {
        match self.script.pop_front() {
            Some(ReplayStep::Step(registers)) => {
                self.registers.insert(thread, registers);
                Ok(registers)
            }
            Some(ReplayStep::Interrupt { code, address }) => Err(UnpackError::StepInterrupted { code, address }),
            Some(other) => {
                self.script.push_front(other);
                Err(UnpackError::InvalidArgument("replay script expected a single step".to_string()))
            }
            None => Err(UnpackError::InvalidArgument("replay script exhausted".to_string())),
        }
    }

    fn arm_single_step(&mut self, thread: ThreadId) -> Result<()>
    {
        self.armed_steps.push(thread);
        Ok(())
    }

    fn resume(&mut self, mode: ContinueMode) -> Result<()>
    {
        self.resumes.push(mode);
        Ok(())
    }

    fn wait_for_event(&mut self, timeout: Duration) -> Result<DebugEvent>
    {
        match self.script.pop_front() {
            Some(ReplayStep::Event(scripted)) => self.deliver(scripted),
            Some(other) => {
                self.script.push_front(other);
                Err(UnpackError::InvalidArgument("replay script expected an event".to_string()))
            }
            None => {
                self.clock.advance(timeout);
                Ok(DebugEvent::Timeout)
            }
        }
    }

    fn terminate(&mut self) -> Result<()>
    {
        self.terminated = true;
        self.session = None;
        Ok(())
    }

    fn detach(&mut self) -> Result<()>
    {
        self.breakpoints.drain();
        self.session = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::clock::Clock;
    use crate::types::Architecture;

    fn controller() -> ReplayController
    {
        let session = DebugSession::new(ProcessId(100), ThreadId(1), Architecture::X86);
        ReplayController::new(session).with_region(
            Address::new(0x40_0000),
            &[0x55; 0x1800],
            Protection::READ_EXECUTE,
            RegionKind::Image,
        )
    }

    #[test]
    fn test_reads_span_pages()
    {
        let mut replay = controller();
        replay.write_memory(Address::new(0x40_0ffe), &[1, 2, 3, 4]).unwrap();
        let bytes = replay.read_memory(Address::new(0x40_0ffc), 8).unwrap();
        assert_eq!(bytes, [0x55, 0x55, 1, 2, 3, 4, 0x55, 0x55]);
        // The tail of a partially filled page reads as zero.
        let tail = replay.read_memory(Address::new(0x40_17fe), 4).unwrap();
        assert_eq!(tail, [0x55, 0x55, 0, 0]);
        assert!(replay.read_memory(Address::new(0x40_1ff0), 0x20).is_err());
    }

    #[test]
    fn test_regions_split_on_protection()
    {
        let mut replay = controller();
        let previous = replay
            .protect_memory(Address::new(0x40_1000), 1, Protection::READ_WRITE)
            .unwrap();
        assert_eq!(previous, Protection::READ_EXECUTE);
        let regions = replay.memory_regions().unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].size, PAGE_SIZE);
        assert_eq!(regions[1].protection, Protection::READ_WRITE);
    }

    #[test]
    fn test_events_apply_writes_and_time()
    {
        let thread = ThreadId(1);
        let registers = Registers::at(Address::new(0x40_0010), Address::new(0x12_ff00));
        let event = ScriptedEvent::new(DebugEvent::Breakpoint {
            thread,
            address: Address::new(0x40_0010),
        })
        .with_registers(registers)
        .with_write(Address::new(0x40_0020), [0xC3])
        .after(Duration::from_secs(2));
        let mut replay = controller().with_event(event);
        let clock = replay.clock();

        replay.wait_for_event(Duration::from_secs(1)).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
        assert_eq!(replay.registers(thread).unwrap().pc, Address::new(0x40_0010));
        assert_eq!(replay.read_memory(Address::new(0x40_0020), 1).unwrap(), [0xC3]);
    }

    #[test]
    fn test_step_out_of_order_is_reported()
    {
        let mut replay = controller().with_event(ScriptedEvent::new(DebugEvent::Timeout));
        assert!(matches!(
            replay.step_instruction(ThreadId(1)),
            Err(UnpackError::InvalidArgument(_))
        ));
        assert_eq!(replay.remaining(), 1);
    }
}
