//! # Logging Utilities
//!
//! Logging setup for Peeler using `tracing`.
//!
//! - pretty output for interactive use, JSON for machine consumption
//! - console output on stderr so stdout stays free for the OEP prompt
//! - optional file output through `tracing-appender`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peeler_utils::init_logging;
//!
//! // Reads RUST_LOG, PEELER_LOG_FORMAT and PEELER_LOG_FILE
//! let _guard = init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Unpacker started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter (e.g. `RUST_LOG=debug`, `RUST_LOG=peeler_core::oep=trace`)
//! - `PEELER_LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `PEELER_LOG_FILE`: also log to this file; a directory gets a dated file name
//!
//! The returned [`WorkerGuard`] flushes the file writer when dropped, so keep
//! it alive for the whole run.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Local;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const FORMAT_VAR: &str = "PEELER_LOG_FORMAT";
/// Environment variable naming an additional log file.
pub const FILE_VAR: &str = "PEELER_LOG_FILE";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable output (default)
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level (`--verbose`)
    Debug,
    /// Trace level (every debug event)
    Trace,
}

impl LogLevel
{
    /// Level for the CLI's `--verbose` switch.
    #[must_use]
    pub fn from_verbose(verbose: bool) -> Self
    {
        if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoggingConfig
{
    /// Explicit level; overrides `RUST_LOG` when set.
    pub level: Option<LogLevel>,
    /// Output format.
    pub format: LogFormat,
    /// Extra file output.
    pub file: Option<PathBuf>,
}

impl LoggingConfig
{
    /// Read `PEELER_LOG_FORMAT` and `PEELER_LOG_FILE`
    ///
    /// ## Errors
    ///
    /// [`LoggingError::InvalidFormat`] for an unknown format name.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match env::var(FORMAT_VAR) {
            Ok(value) if !value.is_empty() => value.parse()?,
            _ => LogFormat::Pretty,
        };
        let file = env::var_os(FILE_VAR).filter(|value| !value.is_empty()).map(PathBuf::from);
        Ok(Self {
            level: None,
            format,
            file,
        })
    }

    /// Same settings with an explicit level.
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    fn filter(&self) -> EnvFilter
    {
        match self.level {
            Some(level) => EnvFilter::new(Level::from(level).to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
        }
    }
}

/// Initialize logging from the environment
///
/// ## Example
///
/// ```rust,no_run
/// use peeler_utils::init_logging;
///
/// let _guard = init_logging().expect("Failed to initialize logging");
/// tracing::info!("Application started");
/// ```
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - `PEELER_LOG_FORMAT` holds an unknown format
/// - The log file cannot be created
pub fn init_logging() -> Result<Option<WorkerGuard>, LoggingError>
{
    init_with(&LoggingConfig::from_env()?)
}

/// Initialize logging with an explicit level and format
///
/// `PEELER_LOG_FILE` is still honored.
///
/// ## Example
///
/// ```rust,no_run
/// use peeler_utils::{init_logging_with_level, LogFormat, LogLevel};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<Option<WorkerGuard>, LoggingError>
{
    let file = env::var_os(FILE_VAR).filter(|value| !value.is_empty()).map(PathBuf::from);
    init_with(&LoggingConfig {
        level: Some(level),
        format,
        file,
    })
}

/// Initialize logging from a resolved configuration
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_with(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError>
{
    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let path = log_file_path(path);
            let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(directory)?;
            let file_name = path.file_name().unwrap_or_default();
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer: BoxedLayer<_> = match config.format {
                LogFormat::Pretty => fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .boxed(),
                LogFormat::Json => fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_current_span(true)
                    .boxed(),
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(config.filter())
        .with(console_layer(config.format))
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    Ok(guard)
}

fn console_layer<S>(format: LogFormat) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_writer(io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .boxed(),
    }
}

/// A directory (existing, or spelled with a trailing separator) gets `YYYY-MM-DD-peeler.log`.
fn log_file_path(path: &Path) -> PathBuf
{
    let spelled_as_dir = path.as_os_str().to_string_lossy().ends_with(['/', '\\']);
    if path.is_dir() || spelled_as_dir {
        path.join(format!("{}-peeler.log", Local::now().format("%Y-%m-%d")))
    } else {
        path.to_path_buf()
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0} (use 'pretty' or 'json')")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0} (use 'error', 'warn', 'info', 'debug' or 'trace')")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
