//! Common module for library exports

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{UnpackConfig, UnpackConfigBuilder};
pub use crate::controller::{ContinueMode, DebugSession, LaunchTarget, MemoryView, ProcessController};
pub use crate::engine::{UnpackReport, Unpacker};
pub use crate::error::{Result, UnpackError};
pub use crate::events::DebugEvent;
pub use crate::imports::{Confidence, ImportTable, ResolutionMethod};
pub use crate::oep::{DetectorState, Oep, OepDetector};
pub use crate::profile::{ProtectorProfile, ProtectorVersion};
pub use crate::reconstruct::ReconstructedImage;
pub use crate::replay::{ReplayController, ReplayStep, ScriptedEvent};
pub use crate::snapshot::MemorySnapshot;
pub use crate::types::{Address, Architecture, MemoryRegion, ModuleInfo, ProcessId, Protection, Registers, ThreadId};
