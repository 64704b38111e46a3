//! # Platform-Specific Implementations
//!
//! Debugger backends implementing [`crate::controller::ProcessController`]
//! with the host's native debugging API.
//!
//! - **Windows (x64 hosts)**: Win32 debug API, WOW64 for 32-bit targets
//!   - See: [Debugging Functions](https://learn.microsoft.com/en-us/windows/win32/debug/debugging-functions)
//!
//! Other hosts have no live backend; recorded traces still run through
//! [`crate::replay::ReplayController`].

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;
