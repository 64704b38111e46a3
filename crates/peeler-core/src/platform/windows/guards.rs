//! # RAII Guards for Win32 Handles
//!
//! - **OwnedHandle**: closes a kernel handle on drop
//! - **ThreadSuspendGuard**: suspends a thread and resumes it on drop
//!
//! Single-stepping one thread uses a set of `ThreadSuspendGuard`s to freeze
//! every other thread, so the only event that can arrive is the step (or an
//! exception raised by the stepped instruction).

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Threading::{ResumeThread, SuspendThread};

use crate::error::{Result, UnpackError};

/// A kernel handle closed on drop
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle
{
    /// Take ownership of `handle`; `None` for null or `INVALID_HANDLE_VALUE`.
    #[must_use]
    pub fn new(handle: HANDLE) -> Option<Self>
    {
        (handle != 0 && handle != INVALID_HANDLE_VALUE).then_some(Self(handle))
    }

    /// The raw handle, still owned by this value.
    #[must_use]
    pub fn raw(&self) -> HANDLE
    {
        self.0
    }
}

impl Drop for OwnedHandle
{
    fn drop(&mut self)
    {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// Suspends a thread and resumes it when dropped
///
/// The thread handle is borrowed; the debug loop owns it.
#[derive(Debug)]
pub struct ThreadSuspendGuard
{
    thread: HANDLE,
    active: bool,
}

impl ThreadSuspendGuard
{
    /// Suspend `thread`.
    ///
    /// ## Errors
    ///
    /// [`UnpackError::Platform`] when `SuspendThread` fails.
    pub fn new(thread: HANDLE) -> Result<Self>
    {
        let previous = unsafe { SuspendThread(thread) };
        if previous == u32::MAX {
            return Err(UnpackError::last_os_error("SuspendThread"));
        }
        Ok(Self { thread, active: true })
    }

    /// Resume now instead of on drop.
    ///
    /// ## Errors
    ///
    /// [`UnpackError::Platform`] when `ResumeThread` fails.
    pub fn resume(mut self) -> Result<()>
    {
        self.active = false;
        if unsafe { ResumeThread(self.thread) } == u32::MAX {
            return Err(UnpackError::last_os_error("ResumeThread"));
        }
        Ok(())
    }
}

impl Drop for ThreadSuspendGuard
{
    fn drop(&mut self)
    {
        if self.active {
            unsafe {
                ResumeThread(self.thread);
            }
        }
    }
}
