//! # Peeler Utilities
//!
//! Shared utilities for the Peeler workspace, mainly the `tracing` setup used
//! by the command-line front end.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, init_with, LogFormat, LogLevel, LoggingConfig, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
