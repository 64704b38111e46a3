//! # Error Types
//!
//! Run-level failures of the unpacking pipeline.
//!
//! We use `thiserror` to derive `Error` and the display messages. Failures that
//! only affect one thunk or one heuristic never surface here; they degrade the
//! affected result (unresolved import, rejected candidate) and the run goes on.

use thiserror::Error;

/// Main error type for unpacking operations
///
/// ## Error Categories
///
/// 1. **Process control**: Launch, Attach, MemoryAccess, StepInterrupted
/// 2. **Selection**: UnsupportedProfile, InvalidTarget
/// 3. **Tracing outcome**: OepNotFound, TargetCrashed
/// 4. **Output**: Reconstruction
/// 5. **Plumbing**: InvalidArgument, Platform, Io
#[derive(Error, Debug)]
pub enum UnpackError
{
    /// The target could not be started under debugger control, or it exited
    /// before its original entry point was reached
    ///
    /// An early exit is the usual symptom of a missing license artifact: the
    /// protector shows its nag screen and terminates.
    #[error("Failed to launch target: {0}")]
    Launch(String),

    /// Attaching to an existing process failed
    #[error("Failed to attach to process {pid}: {reason}")]
    Attach
    {
        /// Process identifier that was requested.
        pid: u32,
        /// Platform-specific explanation.
        reason: String,
    },

    /// A read or write touched an unmapped or protected range
    #[error("Memory access failed at 0x{address:016x} ({length} bytes)")]
    MemoryAccess
    {
        /// First address of the failed access.
        address: u64,
        /// Number of bytes requested.
        length: usize,
    },

    /// A single step was interrupted by an exception on the stepping thread
    ///
    /// The exception itself is queued and delivered by the next wait.
    #[error("Single step interrupted by exception 0x{code:08x} at 0x{address:016x}")]
    StepInterrupted
    {
        /// Exception code raised during the step.
        code: u32,
        /// Instruction address reported with the exception.
        address: u64,
    },

    /// No heuristic set exists for the requested combination
    ///
    /// Example: .NET assemblies that are libraries (no entry point).
    #[error("Unsupported protector profile: {0}")]
    UnsupportedProfile(String),

    /// The input file is not a loadable PE image
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The wall-clock timeout expired before the OEP was confirmed
    #[error("Original entry point not found within {seconds}s")]
    OepNotFound
    {
        /// Timeout that was in effect.
        seconds: u64,
    },

    /// The target raised an unhandled (second-chance) exception while tracing
    #[error("Target crashed with exception 0x{code:08x} at 0x{address:016x}")]
    TargetCrashed
    {
        /// Exception code (NTSTATUS).
        code: u32,
        /// Faulting instruction address.
        address: u64,
    },

    /// The output image could not be produced
    ///
    /// Raised when the in-memory header is unrecognizable, when the section
    /// table does not fit in the header area, or when the OEP does not point
    /// at executable code inside the image.
    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),

    /// Invalid argument passed to an engine function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An OS debugging primitive failed
    #[error("Platform error in {call}: {source}")]
    Platform
    {
        /// Name of the failing system call.
        call: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error (reading the target, writing the output)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UnpackError
{
    /// Convenience constructor for [`UnpackError::MemoryAccess`].
    #[must_use]
    pub fn memory(address: u64, length: usize) -> Self
    {
        Self::MemoryAccess { address, length }
    }

    /// Build a [`UnpackError::Platform`] from the calling thread's last OS error.
    #[must_use]
    pub fn last_os_error(call: &'static str) -> Self
    {
        Self::Platform {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Result type alias for unpacking operations
pub type Result<T> = std::result::Result<T, UnpackError>;
