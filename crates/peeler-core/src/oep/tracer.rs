//! Drive a [`ProcessController`] with an [`OepDetector`] until the OEP.
//!
//! The tracer owns every side effect of detection: it installs breakpoints,
//! writes anti-debug patches, flips page protections for the execution trap
//! (remembering what they were), runs confirmation windows and captures the
//! snapshot. It never terminates the process; the caller does that once it is
//! done with it.

use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{ConfirmationTrace, DetectorAction, Oep, OepDetector, TraceRequest};
use crate::clock::Clock;
use crate::controller::{LiveMemory, ProcessController};
use crate::error::{Result, UnpackError};
use crate::events::DebugEvent;
use crate::profile::TrapKind;
use crate::snapshot::{MemorySnapshot, PageBaseline};
use crate::types::{Address, Protection, ThreadId, PAGE_SIZE};

/// Longest single wait, so the deadline is checked regularly.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Result of a successful trace
#[derive(Debug, Clone)]
pub struct TraceOutcome
{
    /// The confirmed entry point.
    pub oep: Oep,
    /// Memory captured at the OEP.
    pub snapshot: MemorySnapshot,
}

/// A range whose protection was changed by the trap
#[derive(Debug, Clone, Copy)]
struct TrappedRange
{
    start: Address,
    len: u64,
    original: Protection,
}

impl TrappedRange
{
    fn contains(&self, address: Address) -> bool
    {
        address >= self.start && address < self.start + self.len
    }
}

enum Flow
{
    Continue,
    Done(Oep),
}

struct Tracer<'a>
{
    controller: &'a mut dyn ProcessController,
    detector: &'a mut OepDetector,
    trap: TrapKind,
    trapped: Vec<TrappedRange>,
    rearm: Option<(ThreadId, Address)>,
    baseline: PageBaseline,
}

/// Trace a freshly launched process until the detector confirms the OEP
///
/// The deadline is the profile's timeout, measured on `clock` from the call.
/// Time spent before it (file inspection, process start) does not count.
///
/// ## Errors
///
/// - [`UnpackError::OepNotFound`] when the deadline expires
/// - [`UnpackError::TargetCrashed`] on an unhandled exception
/// - [`UnpackError::Launch`] when the target exits first
/// - controller errors that prevent tracing from continuing
pub fn trace_to_oep(
    controller: &mut dyn ProcessController,
    detector: &mut OepDetector,
    clock: &dyn Clock,
) -> Result<TraceOutcome>
{
    let trap = detector.profile().trap;
    let timeout = detector.profile().timeout;
    let started = clock.elapsed();
    let mut tracer = Tracer {
        controller,
        detector,
        trap,
        trapped: Vec::new(),
        rearm: None,
        baseline: PageBaseline::default(),
    };

    loop {
        let elapsed = clock.elapsed().saturating_sub(started);
        if elapsed >= timeout {
            tracer.detector.on_timeout();
            tracer.disarm();
            return Err(UnpackError::OepNotFound {
                seconds: timeout.as_secs(),
            });
        }

        let event = tracer.controller.wait_for_event((timeout - elapsed).min(POLL_INTERVAL))?;
        trace!("{}", event.describe());
        if let Some(session) = tracer.controller.session_mut() {
            session.observe(&event);
        }
        if let Some((thread, page)) = tracer.rearm {
            if event.thread() == Some(thread) {
                tracer.rearm = None;
                tracer.retrap(page)?;
            }
        }

        let registers = match (&event, event.thread()) {
            (
                DebugEvent::Breakpoint { .. } | DebugEvent::AccessViolation { .. } | DebugEvent::GuardPage { .. },
                Some(thread),
            ) => tracer.controller.registers(thread).ok(),
            _ => None,
        };
        let action = {
            let view = LiveMemory(&*tracer.controller);
            tracer.detector.on_event(&event, registers.as_ref(), &view)
        };

        if let Flow::Done(oep) = tracer.perform(action)? {
            tracer.disarm();
            let snapshot = MemorySnapshot::capture(&*tracer.controller, &tracer.baseline, oep.registers, oep.thread)?;
            return Ok(TraceOutcome { oep, snapshot });
        }
    }
}

impl Tracer<'_>
{
    fn perform(&mut self, action: DetectorAction) -> Result<Flow>
    {
        match action {
            DetectorAction::Resume(mode) => self.controller.resume(mode)?,
            DetectorAction::Wait => {}
            DetectorAction::Prepare { requests, then } => {
                for request in requests {
                    self.apply(request)?;
                }
                self.controller.resume(then)?;
            }
            DetectorAction::Confirm { thread, steps } => {
                self.disarm();
                let window = self.confirmation_window(thread, steps)?;
                let next = self.detector.on_confirmation(&window);
                return self.perform(next);
            }
            DetectorAction::Finished(oep) => return Ok(Flow::Done(oep)),
            DetectorAction::Abort(reason) => {
                self.disarm();
                return Err(reason.into());
            }
        }
        Ok(Flow::Continue)
    }

    fn confirmation_window(&mut self, thread: ThreadId, steps: u32) -> Result<ConfirmationTrace>
    {
        let mut window = ConfirmationTrace::default();
        for _ in 0..steps {
            match self.controller.step_instruction(thread) {
                Ok(registers) => window.pcs.push(registers.pc),
                Err(UnpackError::StepInterrupted { code, address }) => {
                    window.interrupted = Some((code, Address::new(address)));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        debug!("Confirmation window: {} steps", window.pcs.len());
        Ok(window)
    }

    fn apply(&mut self, request: TraceRequest) -> Result<()>
    {
        match request {
            TraceRequest::SetBreakpoint(address) => {
                if let Err(e) = self.controller.set_breakpoint(address) {
                    warn!("Cannot set breakpoint at {address}: {e}");
                }
            }
            TraceRequest::RemoveBreakpoint(address) => {
                if let Err(e) = self.controller.remove_breakpoint(address) {
                    warn!("Cannot remove breakpoint at {address}: {e}");
                }
            }
            TraceRequest::Write { address, bytes } => self.patch(address, &bytes),
            TraceRequest::RecordBaseline(module) => {
                self.baseline = PageBaseline::record(&LiveMemory(&*self.controller), &module);
                if let Some(session) = self.controller.session_mut() {
                    session.target = Some(module);
                }
            }
            TraceRequest::ArmTrap { start, len } => self.arm(start, len)?,
            TraceRequest::DisarmTrap => self.disarm(),
            TraceRequest::StepAndRearm { thread, page } => self.step_and_rearm(thread, page)?,
        }
        Ok(())
    }

    fn patch(&mut self, address: Address, bytes: &[u8])
    {
        if self.controller.write_memory(address, bytes).is_ok() {
            return;
        }
        // Code pages are usually read-only; open them for the duration of the write.
        let len = bytes.len() as u64;
        let result = self
            .controller
            .protect_memory(address, len, Protection::ALL)
            .and_then(|previous| {
                let written = self.controller.write_memory(address, bytes);
                self.controller.protect_memory(address, len, previous)?;
                written
            });
        if let Err(e) = result {
            warn!("Cannot patch {} bytes at {address}: {e}", bytes.len());
        }
    }

    fn trapped_protection(&self, original: Protection) -> Protection
    {
        match self.trap {
            TrapKind::NoExecute => original.without_execute(),
            TrapKind::GuardPage => original.with_guard(),
            TrapKind::None => original,
        }
    }

    fn arm(&mut self, start: Address, len: u64) -> Result<()>
    {
        self.disarm();
        let end = start + len;
        for region in self.controller.memory_regions()? {
            if region.end() <= start || region.base >= end {
                continue;
            }
            let from = region.base.max(start);
            let range = TrappedRange {
                start: from,
                len: region.end().min(end) - from,
                original: region.protection,
            };
            let trapped = self.trapped_protection(range.original);
            match self.controller.protect_memory(range.start, range.len, trapped) {
                Ok(_) => self.trapped.push(range),
                Err(e) => warn!("Cannot trap {} (+0x{:x}): {e}", range.start, range.len),
            }
        }
        debug!("Trap armed on {} ranges", self.trapped.len());
        Ok(())
    }

    fn disarm(&mut self)
    {
        for range in self.trapped.drain(..) {
            if let Err(e) = self.controller.protect_memory(range.start, range.len, range.original) {
                warn!("Cannot restore protection of {}: {e}", range.start);
            }
        }
    }

    fn step_and_rearm(&mut self, thread: ThreadId, page: Address) -> Result<()>
    {
        let Some(range) = self.trapped.iter().find(|range| range.contains(page)).copied() else {
            return Ok(());
        };
        self.controller.protect_memory(page, PAGE_SIZE, range.original)?;
        self.controller.arm_single_step(thread)?;
        self.rearm = Some((thread, page));
        Ok(())
    }

    fn retrap(&mut self, page: Address) -> Result<()>
    {
        let Some(range) = self.trapped.iter().find(|range| range.contains(page)).copied() else {
            return Ok(());
        };
        self.controller
            .protect_memory(page, PAGE_SIZE, self.trapped_protection(range.original))?;
        Ok(())
    }
}
