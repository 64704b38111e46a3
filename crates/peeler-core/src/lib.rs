//! # peeler-core
//!
//! Debugger-driven unpacking engine for Themida/WinLicense protected PE files.
//!
//! The crate runs a protected executable under a debugger until the protector
//! hands control to the original program, then rebuilds a loadable image from
//! memory:
//! - [`controller`]: the process-control seam (Windows backend, replay backend)
//! - [`profile`]: per-generation/bitness/format detection parameters
//! - [`oep`]: original entry point detection as an explicit state machine
//! - [`imports`]: import thunk discovery and resolution (direct, emulated, signature)
//! - [`reconstruct`]: section table, import directory and header rewriting
//! - [`engine`]: the pipeline tying them together
//!
//! ## Platform Support
//!
//! - **Windows x64**: live tracing of 32-bit (WOW64) and 64-bit targets
//! - **Everything else**: profile selection, resolution and reconstruction
//!   work against recorded traces via [`replay`]
//!
//! ## Why unsafe code is needed
//!
//! The Windows backend calls the Win32 debug API (`WaitForDebugEvent`,
//! `ReadProcessMemory`, thread contexts). Those calls are wrapped in safe
//! abstractions in [`platform`]; nothing else in the crate is unsafe.

#![allow(unsafe_code)] // Required for the Win32 debug API

pub mod breakpoints;
pub mod clock;
pub mod config;
pub mod controller;
pub mod emulator;
pub mod engine;
pub mod error;
pub mod events;
pub mod exports;
pub mod imports;
pub mod oep;
pub mod pe;
pub mod platform;
pub mod prelude;
pub mod profile;
pub mod reconstruct;
pub mod replay;
pub mod snapshot;
pub mod types;

pub use config::{UnpackConfig, UnpackConfigBuilder};
pub use controller::ProcessController;
pub use engine::{UnpackReport, Unpacker};
// Re-export commonly used types
pub use error::{Result, UnpackError};
#[cfg(all(windows, target_arch = "x86_64"))]
pub use platform::windows::WindowsController;
pub use types::{Address, Architecture, ProcessId, Registers, ThreadId};
