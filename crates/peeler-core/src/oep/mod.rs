//! # OEP Detector
//!
//! Decides when the protected program has reached its original entry point.
//!
//! The detector is a pure state machine. It consumes [`DebugEvent`]s (plus the
//! registers of the reporting thread and a read-only memory view) and answers
//! each one with a [`DetectorAction`] that the [`tracer`] carries out against a
//! [`crate::controller::ProcessController`]. It never touches a process
//! itself, which is what makes a recorded event trace replay to the same
//! transitions and the same OEP.
//!
//! ## States
//!
//! ```text
//! Launched ──target mapped──▶ Tracing ──observation──▶ Candidate ──confirmed──▶ Confirmed
//!                               ▲  │                        │
//!                               │  └──timeout / crash──▶ TimedOut / Crashed
//!                               └────────rejected───────────┘
//! ```
//!
//! ## Observations
//!
//! - **Section transition**: the execution trap on the first original section
//!   fired with the instruction pointer in original code.
//! - **Return outside protector**: a CRT startup API probe was hit; the entry
//!   is derived from the call stack.
//! - **Managed entry**: the runtime's managed entry export was hit; the entry
//!   is the assembly's native jump stub.
//!
//! The stack-delta heuristic filters the first two. Every heuristic candidate
//! then goes through a confirmation window: the observing thread is stepped
//! and must stay out of the protector's sections. Managed records use an
//! empty window.

pub mod heuristics;
pub mod tracer;

use std::fmt;

use fxhash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info, warn};

pub use heuristics::{ImageLayout, Verdict};
pub use tracer::{trace_to_oep, TraceOutcome};

use crate::controller::{ContinueMode, MemoryView};
use crate::error::UnpackError;
use crate::events::{DebugEvent, FaultAccess};
use crate::pe::{self, TargetKind};
use crate::profile::{Heuristic, ProtectorProfile, TrapKind};
use crate::types::{Address, ModuleInfo, Registers, ThreadId, PAGE_SIZE};

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorState
{
    /// Process created, target not mapped yet.
    Launched,
    /// Target mapped; waiting for an observation.
    Tracing,
    /// A candidate is going through confirmation.
    Candidate,
    /// OEP confirmed (terminal).
    Confirmed,
    /// Deadline expired (terminal).
    TimedOut,
    /// The target crashed or exited (terminal).
    Crashed,
}

impl DetectorState
{
    /// Whether no further events are accepted.
    #[must_use]
    pub fn is_terminal(self) -> bool
    {
        matches!(self, Self::Confirmed | Self::TimedOut | Self::Crashed)
    }
}

impl fmt::Display for DetectorState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::Debug::fmt(self, f)
    }
}

/// What produced an OEP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OepSource
{
    /// A heuristic of the profile's chain.
    Heuristic(Heuristic),
    /// The caller supplied the OEP.
    Forced,
}

/// One state change, recorded for diagnostics and replay comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition
{
    /// Previous state.
    pub from: DetectorState,
    /// New state.
    pub to: DetectorState,
    /// 1-based index of the event that caused it (0 for timeouts).
    pub event: usize,
    /// Short cause.
    pub reason: &'static str,
}

/// OEP candidate under evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate
{
    /// Proposed entry point.
    pub address: Address,
    /// Thread that produced it.
    pub thread: ThreadId,
    /// Registers at observation time.
    pub registers: Registers,
    /// Source of the observation.
    pub source: OepSource,
}

/// A confirmed original entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Oep
{
    /// Absolute address in the traced process.
    pub address: Address,
    /// Relative to the target's base.
    pub rva: u32,
    /// Source of the confirmed observation.
    pub source: OepSource,
    /// Thread that reached it.
    pub thread: ThreadId,
    /// Registers captured with the candidate.
    pub registers: Registers,
}

/// Side effect the tracer must perform before continuing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRequest
{
    /// Install a software breakpoint.
    SetBreakpoint(Address),
    /// Remove a software breakpoint.
    RemoveBreakpoint(Address),
    /// Overwrite debuggee memory.
    Write
    {
        /// Destination.
        address: Address,
        /// New bytes.
        bytes: Vec<u8>,
    },
    /// Hash the pages of the freshly mapped target.
    RecordBaseline(ModuleInfo),
    /// Arm the profile's execution trap over a range.
    ArmTrap
    {
        /// First address.
        start: Address,
        /// Length in bytes.
        len: u64,
    },
    /// Restore the original protection of every trapped page.
    DisarmTrap,
    /// Let `thread` execute one instruction on an untrapped `page`, then trap the page again.
    StepAndRearm
    {
        /// Thread to step.
        thread: ThreadId,
        /// Page to re-arm.
        page: Address,
    },
}

/// Why tracing cannot continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason
{
    /// Unhandled (second-chance) exception.
    Crashed
    {
        /// NTSTATUS.
        code: u32,
        /// Faulting instruction.
        address: Address,
    },
    /// The process exited before the OEP.
    Exited
    {
        /// Exit code.
        code: u32,
    },
}

impl From<AbortReason> for UnpackError
{
    fn from(reason: AbortReason) -> Self
    {
        match reason {
            AbortReason::Crashed { code, address } => UnpackError::TargetCrashed {
                code,
                address: address.value(),
            },
            AbortReason::Exited { code } => UnpackError::Launch(format!(
                "target exited with code 0x{code:x} before reaching its entry point (missing license file?)"
            )),
        }
    }
}

/// The detector's answer to one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorAction
{
    /// Continue the event.
    Resume(ContinueMode),
    /// Apply the requests in order, then continue the event.
    Prepare
    {
        /// Side effects.
        requests: SmallVec<[TraceRequest; 4]>,
        /// How to continue afterwards.
        then: ContinueMode,
    },
    /// Disarm the trap and single-step `thread` `steps` times, then report
    /// through [`OepDetector::on_confirmation`].
    Confirm
    {
        /// Thread to step.
        thread: ThreadId,
        /// Window length.
        steps: u32,
    },
    /// The OEP is confirmed; stop without continuing the event.
    Finished(Oep),
    /// Tracing failed.
    Abort(AbortReason),
    /// Nothing to continue (no event was pending).
    Wait,
}

impl DetectorAction
{
    fn prepare(requests: SmallVec<[TraceRequest; 4]>) -> Self
    {
        if requests.is_empty() {
            Self::Resume(ContinueMode::Handled)
        } else {
            Self::Prepare {
                requests,
                then: ContinueMode::Handled,
            }
        }
    }
}

/// Instruction pointers visited during a confirmation window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationTrace
{
    /// Address after each completed step.
    pub pcs: Vec<Address>,
    /// Exception that cut the window short: `(code, address)`.
    pub interrupted: Option<(u32, Address)>,
}

/// OEP detection state machine
#[derive(Debug, Clone)]
pub struct OepDetector
{
    profile: ProtectorProfile,
    target_name: String,
    peb: Address,
    forced_oep: Option<u32>,
    state: DetectorState,
    transitions: Vec<Transition>,
    events: usize,
    layout: Option<ImageLayout>,
    entry_pending: bool,
    entry_sp: Option<Address>,
    candidate: Option<Candidate>,
    probes: FxHashMap<u64, Heuristic>,
    trap_armed: bool,
    rejected: u32,
}

impl OepDetector
{
    /// Create a detector for the module named `target_name`
    ///
    /// `peb` is used for the anti-debug patches applied at the protector entry.
    /// A `forced_oep` RVA bypasses the heuristics: the detector confirms at the
    /// first observation of original code running and reports that RVA.
    #[must_use]
    pub fn new(profile: ProtectorProfile, target_name: &str, peb: Address, forced_oep: Option<u32>) -> Self
    {
        Self {
            profile,
            target_name: target_name.to_ascii_lowercase(),
            peb,
            forced_oep,
            state: DetectorState::Launched,
            transitions: Vec::new(),
            events: 0,
            layout: None,
            entry_pending: false,
            entry_sp: None,
            candidate: None,
            probes: FxHashMap::default(),
            trap_armed: false,
            rejected: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DetectorState
    {
        self.state
    }

    /// Every state change so far.
    #[must_use]
    pub fn transitions(&self) -> &[Transition]
    {
        &self.transitions
    }

    /// Candidate under confirmation, if any.
    #[must_use]
    pub fn candidate(&self) -> Option<&Candidate>
    {
        self.candidate.as_ref()
    }

    /// Layout of the target once it is mapped.
    #[must_use]
    pub fn layout(&self) -> Option<&ImageLayout>
    {
        self.layout.as_ref()
    }

    /// Stack pointer recorded at the protector entry.
    #[must_use]
    pub fn entry_sp(&self) -> Option<Address>
    {
        self.entry_sp
    }

    /// Number of candidates dropped so far.
    #[must_use]
    pub fn rejected(&self) -> u32
    {
        self.rejected
    }

    /// The profile driving this detector.
    #[must_use]
    pub fn profile(&self) -> &ProtectorProfile
    {
        &self.profile
    }

    /// Feed one event
    ///
    /// `registers` are those of the reporting thread for exception-type
    /// events; they are required for breakpoints and traps to be evaluated.
    pub fn on_event(&mut self, event: &DebugEvent, registers: Option<&Registers>, view: &dyn MemoryView) -> DetectorAction
    {
        self.events += 1;
        if self.state.is_terminal() {
            return DetectorAction::Wait;
        }

        match event {
            DebugEvent::ProcessCreated { image_base, .. } => {
                if self.profile.kind == TargetKind::Exe {
                    return DetectorAction::prepare(self.target_mapped(view, *image_base));
                }
                DetectorAction::Resume(ContinueMode::Handled)
            }
            DebugEvent::ModuleLoaded { module } => {
                let mut requests = self.module_requests(module, view);
                if self.profile.kind == TargetKind::Dll && self.layout.is_none() && module.name == self.target_name {
                    requests.extend(self.target_mapped(view, module.base));
                }
                DetectorAction::prepare(requests)
            }
            DebugEvent::Breakpoint { thread, address } => self.on_breakpoint(*thread, *address, registers, view),
            DebugEvent::AccessViolation {
                thread,
                address,
                fault_address,
                access,
                first_chance,
            } => {
                if !first_chance {
                    return self.abort(AbortReason::Crashed {
                        code: crate::events::EXCEPTION_ACCESS_VIOLATION,
                        address: *address,
                    });
                }
                if self.trap_armed
                    && self.profile.trap == TrapKind::NoExecute
                    && *access == FaultAccess::Execute
                    && self.in_trap(*fault_address)
                {
                    return self.section_transition(*thread, *address, registers);
                }
                DetectorAction::Resume(ContinueMode::NotHandled)
            }
            DebugEvent::GuardPage {
                thread,
                address,
                fault_address,
            } => {
                if !(self.trap_armed && self.profile.trap == TrapKind::GuardPage && self.in_trap(*fault_address)) {
                    return DetectorAction::Resume(ContinueMode::NotHandled);
                }
                if self.layout.as_ref().is_some_and(|layout| layout.is_original(*address)) {
                    return self.section_transition(*thread, *address, registers);
                }
                // The protector touched a trapped page; let it through and guard the page again.
                DetectorAction::prepare(smallvec![TraceRequest::StepAndRearm {
                    thread: *thread,
                    page: fault_address.page_floor(PAGE_SIZE),
                }])
            }
            DebugEvent::Exception {
                code,
                address,
                first_chance,
                ..
            } => {
                if *first_chance {
                    DetectorAction::Resume(ContinueMode::NotHandled)
                } else {
                    self.abort(AbortReason::Crashed {
                        code: *code,
                        address: *address,
                    })
                }
            }
            DebugEvent::ProcessExited { code } => self.abort(AbortReason::Exited { code: *code }),
            DebugEvent::Timeout => DetectorAction::Wait,
            DebugEvent::ThreadCreated { .. }
            | DebugEvent::ThreadExited { .. }
            | DebugEvent::ModuleUnloaded { .. }
            | DebugEvent::SingleStep { .. }
            | DebugEvent::DebugString { .. } => DetectorAction::Resume(ContinueMode::Handled),
        }
    }

    /// Report the outcome of a confirmation window.
    pub fn on_confirmation(&mut self, trace: &ConfirmationTrace) -> DetectorAction
    {
        let Some(candidate) = self.candidate.clone() else {
            return DetectorAction::Wait;
        };
        if self.state != DetectorState::Candidate {
            return DetectorAction::Wait;
        }

        let reentered = trace
            .pcs
            .iter()
            .find(|pc| self.layout.as_ref().is_some_and(|layout| layout.is_protector(**pc)));
        let reason = match (trace.interrupted, reentered) {
            (Some((code, address)), _) => {
                debug!("Confirmation of {} interrupted by 0x{code:08x} at {address}", candidate.address);
                Some("confirmation interrupted")
            }
            (None, Some(pc)) => {
                debug!("Candidate {} re-entered protector code at {pc}", candidate.address);
                Some("re-entered protector")
            }
            (None, None) => None,
        };

        match reason {
            Some(reason) => {
                self.rejected += 1;
                self.candidate = None;
                self.transition(DetectorState::Tracing, reason);
                let mut requests = SmallVec::new();
                if let Some((start, len)) = self.trap_range() {
                    requests.push(TraceRequest::ArmTrap { start, len });
                    self.trap_armed = true;
                }
                DetectorAction::prepare(requests)
            }
            None => self.confirm(candidate),
        }
    }

    /// Record that the deadline expired.
    pub fn on_timeout(&mut self)
    {
        if !self.state.is_terminal() {
            warn!(
                "OEP not confirmed within {:?} ({} candidates rejected)",
                self.profile.timeout, self.rejected
            );
            self.transition_at(DetectorState::TimedOut, 0, "deadline expired");
        }
    }

    fn transition(&mut self, to: DetectorState, reason: &'static str)
    {
        self.transition_at(to, self.events, reason);
    }

    fn transition_at(&mut self, to: DetectorState, event: usize, reason: &'static str)
    {
        debug!("Detector {} -> {to} ({reason})", self.state);
        self.transitions.push(Transition {
            from: self.state,
            to,
            event,
            reason,
        });
        self.state = to;
    }

    fn abort(&mut self, reason: AbortReason) -> DetectorAction
    {
        let cause = match reason {
            AbortReason::Crashed { .. } => "unhandled exception",
            AbortReason::Exited { .. } => "process exited",
        };
        self.transition(DetectorState::Crashed, cause);
        DetectorAction::Abort(reason)
    }

    fn trap_range(&self) -> Option<(Address, u64)>
    {
        if self.profile.trap == TrapKind::None {
            return None;
        }
        if self.forced_oep.is_none() && !self.profile.uses(Heuristic::SectionTransition) {
            return None;
        }
        self.layout.as_ref()?.trap_range()
    }

    fn in_trap(&self, address: Address) -> bool
    {
        self.trap_range()
            .is_some_and(|(start, len)| address >= start && address < start + len)
    }

    fn target_mapped(&mut self, view: &dyn MemoryView, base: Address) -> SmallVec<[TraceRequest; 4]>
    {
        let mut requests = SmallVec::new();
        let Some(layout) = ImageLayout::read(view, base, &self.profile) else {
            warn!("Target mapped at {base} but its header could not be read");
            return requests;
        };
        info!(
            "Target {} mapped at {base}, protector entry {}",
            self.target_name, layout.entry
        );
        if layout.original.is_empty() {
            warn!("Every section of the target belongs to the protector");
        }
        requests.push(TraceRequest::RecordBaseline(ModuleInfo::new(&self.target_name, base, layout.size)));
        requests.push(TraceRequest::SetBreakpoint(layout.entry));
        self.entry_pending = true;
        self.layout = Some(layout);
        self.transition(DetectorState::Tracing, "target mapped");
        requests
    }

    fn module_requests(&mut self, module: &ModuleInfo, view: &dyn MemoryView) -> SmallVec<[TraceRequest; 4]>
    {
        let mut requests = SmallVec::new();
        let probes: Vec<_> = self
            .profile
            .api_probes
            .iter()
            .filter(|_| self.profile.uses(Heuristic::ReturnOutsideProtector) && self.forced_oep.is_none())
            .map(|probe| (probe, Heuristic::ReturnOutsideProtector))
            .chain(
                self.profile
                    .managed_entry
                    .iter()
                    .filter(|_| self.profile.uses(Heuristic::ManagedEntry))
                    .map(|probe| (probe, Heuristic::ManagedEntry)),
            )
            .filter(|(probe, _)| probe.module.eq_ignore_ascii_case(&module.name))
            .map(|(probe, heuristic)| (probe.export, heuristic))
            .collect();
        let patches: Vec<_> = self
            .profile
            .anti_debug
            .iter()
            .filter(|site| site.module.eq_ignore_ascii_case(&module.name))
            .copied()
            .collect();
        if probes.is_empty() && patches.is_empty() {
            return requests;
        }

        let exports = match pe::read_exports(view, module.base) {
            Ok(exports) => exports,
            Err(e) => {
                warn!("Cannot read exports of {}: {e}", module.name);
                return requests;
            }
        };
        let find = |name: &str| {
            exports
                .iter()
                .find(|export| export.name.as_deref() == Some(name))
                .map(|export| export.address)
        };

        for (export, heuristic) in probes {
            if let Some(address) = find(export) {
                debug!("Probe {}!{export} at {address}", module.name);
                self.probes.insert(address.value(), heuristic);
                requests.push(TraceRequest::SetBreakpoint(address));
            }
        }
        for site in patches {
            if let Some(address) = find(site.export) {
                debug!("Patching {}!{} at {address}", module.name, site.export);
                requests.push(TraceRequest::Write {
                    address,
                    bytes: site.patch(self.profile.architecture).to_vec(),
                });
            }
        }
        requests
    }

    fn on_breakpoint(
        &mut self,
        thread: ThreadId,
        address: Address,
        registers: Option<&Registers>,
        view: &dyn MemoryView,
    ) -> DetectorAction
    {
        let Some(layout) = self.layout.clone() else {
            return DetectorAction::Resume(ContinueMode::Handled);
        };

        if self.entry_pending && address == layout.entry {
            self.entry_pending = false;
            self.entry_sp = registers.map(Registers::sp);
            info!("Protector entry reached, stack at {:?}", self.entry_sp);
            let mut requests: SmallVec<[TraceRequest; 4]> = smallvec![TraceRequest::RemoveBreakpoint(address)];
            if !self.peb.is_null() {
                requests.extend(
                    heuristics::peb_patches(view, self.peb, self.profile.architecture)
                        .into_iter()
                        .map(|(address, bytes)| TraceRequest::Write { address, bytes }),
                );
            }
            if let Some((start, len)) = self.trap_range() {
                debug!("Arming {:?} trap on {start} (+0x{len:x})", self.profile.trap);
                requests.push(TraceRequest::ArmTrap { start, len });
                self.trap_armed = true;
            }
            return DetectorAction::prepare(requests);
        }

        let Some(&heuristic) = self.probes.get(&address.value()) else {
            return DetectorAction::Resume(ContinueMode::Handled);
        };
        if self.state != DetectorState::Tracing {
            return DetectorAction::Resume(ContinueMode::Handled);
        }
        let Some(registers) = registers else {
            return DetectorAction::Resume(ContinueMode::Handled);
        };

        match heuristic {
            Heuristic::ManagedEntry => {
                if let Some(rva) = self.forced_oep {
                    return self.propose(layout.base + u64::from(rva), thread, *registers, OepSource::Forced, false);
                }
                match heuristics::managed_entry_stub(view, &layout, self.profile.architecture, address) {
                    Some(stub) => {
                        let confirm = self.profile.confirmation_steps > 0;
                        self.propose(stub, thread, *registers, OepSource::Heuristic(heuristic), confirm)
                    }
                    None => {
                        warn!("Managed entry reached but no native entry stub references it");
                        self.rejected += 1;
                        DetectorAction::Resume(ContinueMode::Handled)
                    }
                }
            }
            _ => {
                let Some(hit) = heuristics::return_outside_protector(view, &layout, registers, &self.profile) else {
                    debug!("Probe at {address} hit without an entry stub on the stack");
                    return DetectorAction::Resume(ContinueMode::Handled);
                };
                if self.stack_verdict(hit.sp) == Verdict::Reject {
                    debug!("Call-site entry {} rejected by stack delta", hit.entry);
                    self.rejected += 1;
                    return DetectorAction::Resume(ContinueMode::Handled);
                }
                let confirm = self.profile.confirmation_steps > 0;
                self.propose(hit.entry, thread, *registers, OepSource::Heuristic(heuristic), confirm)
            }
        }
    }

    fn stack_verdict(&self, sp: Address) -> Verdict
    {
        if self.profile.uses(Heuristic::StackDelta) {
            heuristics::stack_delta(self.entry_sp, sp, self.profile.stack_tolerance)
        } else {
            Verdict::Abstain
        }
    }

    fn section_transition(&mut self, thread: ThreadId, pc: Address, registers: Option<&Registers>) -> DetectorAction
    {
        let registers = registers.copied().unwrap_or_else(|| Registers::at(pc, Address::ZERO));
        let Some(layout) = self.layout.clone() else {
            return DetectorAction::Resume(ContinueMode::NotHandled);
        };

        if let Some(rva) = self.forced_oep {
            return self.propose(layout.base + u64::from(rva), thread, registers, OepSource::Forced, false);
        }

        if self.state != DetectorState::Tracing || self.stack_verdict(registers.sp()) == Verdict::Reject {
            debug!("Trap at {pc} rejected (stack {})", registers.sp());
            self.rejected += 1;
            return DetectorAction::prepare(smallvec![TraceRequest::StepAndRearm {
                thread,
                page: pc.page_floor(PAGE_SIZE),
            }]);
        }

        let confirm = self.profile.confirmation_steps > 0;
        self.propose(pc, thread, registers, OepSource::Heuristic(Heuristic::SectionTransition), confirm)
    }

    fn propose(
        &mut self,
        address: Address,
        thread: ThreadId,
        registers: Registers,
        source: OepSource,
        confirm: bool,
    ) -> DetectorAction
    {
        info!("OEP candidate {address} from {source:?}");
        // The tracer lifts the trap for the window and for the snapshot.
        self.trap_armed = false;
        let candidate = Candidate {
            address,
            thread,
            registers,
            source,
        };
        self.candidate = Some(candidate.clone());
        self.transition(DetectorState::Candidate, "observation");
        if confirm {
            DetectorAction::Confirm {
                thread,
                steps: self.profile.confirmation_steps,
            }
        } else {
            self.confirm(candidate)
        }
    }

    fn confirm(&mut self, candidate: Candidate) -> DetectorAction
    {
        let rva = self
            .layout
            .as_ref()
            .and_then(|layout| layout.rva(candidate.address))
            .unwrap_or_default();
        self.transition(DetectorState::Confirmed, "confirmed");
        info!("OEP confirmed at {} (RVA 0x{rva:x})", candidate.address);
        DetectorAction::Finished(Oep {
            address: candidate.address,
            rva,
            source: candidate.source,
            thread: candidate.thread,
            registers: candidate.registers,
        })
    }
}
