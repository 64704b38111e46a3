//! # Types
//!
//! Platform-agnostic types used throughout the engine.
//!
//! These types keep the Win32 representation out of the detector, resolver
//! and reconstructor so that all three can be driven from recorded data.

pub mod address;
pub mod memory;
pub mod process;
pub mod registers;

// Re-export all public types
pub use address::Address;
pub use memory::{MemoryRegion, Protection, RegionKind, PAGE_SIZE};
pub use process::{Architecture, ModuleInfo, ProcessId, ThreadId};
pub use registers::{Gpr, Registers};
