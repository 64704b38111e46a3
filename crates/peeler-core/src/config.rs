//! # Run Configuration
//!
//! [`UnpackConfig`] holds everything one unpacking run needs to know. It is
//! built through [`UnpackConfigBuilder`], which validates the combination
//! before any process is started.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use peeler_core::config::UnpackConfigBuilder;
//!
//! let config = UnpackConfigBuilder::new("C:/samples/app.exe")
//!     .with_timeout(Duration::from_secs(30))
//!     .with_forced_oep(0x1234)
//!     .build()?;
//! assert_eq!(config.output.file_name().unwrap(), "unpacked_app.exe");
//! # Ok::<(), peeler_core::UnpackError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, UnpackError};
use crate::profile::ProtectorVersion;

/// Settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackConfig
{
    /// Protected file.
    pub target: PathBuf,
    /// Extra command-line arguments for the target.
    pub args: Vec<String>,
    /// Protector generation chosen by the user instead of probing.
    pub forced_version: Option<ProtectorVersion>,
    /// OEP RVA chosen by the user instead of the heuristics.
    pub forced_oep: Option<u32>,
    /// Skip import resolution; the image keeps its OEP-time IAT.
    pub skip_imports: bool,
    /// Overrides the profile's tracing timeout.
    pub timeout: Option<Duration>,
    /// Call the OEP hook before the process is terminated.
    pub pause_on_oep: bool,
    /// Output file.
    pub output: PathBuf,
}

impl UnpackConfig
{
    /// Default output path: `unpacked_<file name>` next to the target.
    #[must_use]
    pub fn default_output(target: &Path) -> PathBuf
    {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        target.with_file_name(format!("unpacked_{name}"))
    }
}

/// Fluent builder for [`UnpackConfig`]
#[derive(Debug, Clone, Default)]
pub struct UnpackConfigBuilder
{
    target: PathBuf,
    args: Vec<String>,
    forced_version: Option<ProtectorVersion>,
    forced_oep: Option<u32>,
    skip_imports: bool,
    timeout: Option<Duration>,
    pause_on_oep: bool,
    output: Option<PathBuf>,
}

impl UnpackConfigBuilder
{
    /// Start a configuration for `target`.
    pub fn new(target: impl Into<PathBuf>) -> Self
    {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Command-line arguments passed to the target.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self
    {
        self.args = args;
        self
    }

    /// Skip probing and use this protector generation.
    #[must_use]
    pub fn with_version(mut self, version: ProtectorVersion) -> Self
    {
        self.forced_version = Some(version);
        self
    }

    /// Skip the OEP heuristics and use this RVA.
    #[must_use]
    pub fn with_forced_oep(mut self, rva: u32) -> Self
    {
        self.forced_oep = Some(rva);
        self
    }

    /// Do not resolve imports.
    #[must_use]
    pub fn skip_imports(mut self, skip: bool) -> Self
    {
        self.skip_imports = skip;
        self
    }

    /// Tracing timeout (overrides the profile default).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self
    {
        self.timeout = Some(timeout);
        self
    }

    /// Pause at the OEP before the process is terminated.
    #[must_use]
    pub fn pause_on_oep(mut self, pause: bool) -> Self
    {
        self.pause_on_oep = pause;
        self
    }

    /// Write the result here instead of the default path.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self
    {
        self.output = Some(output.into());
        self
    }

    /// Validate and build
    ///
    /// ## Errors
    ///
    /// [`UnpackError::InvalidArgument`] when the target path is empty or the
    /// timeout is zero.
    pub fn build(self) -> Result<UnpackConfig>
    {
        if self.target.as_os_str().is_empty() {
            return Err(UnpackError::InvalidArgument("a target path is required".to_string()));
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(UnpackError::InvalidArgument("timeout must be greater than zero".to_string()));
        }
        let output = self
            .output
            .unwrap_or_else(|| UnpackConfig::default_output(&self.target));
        Ok(UnpackConfig {
            target: self.target,
            args: self.args,
            forced_version: self.forced_version,
            forced_oep: self.forced_oep,
            skip_imports: self.skip_imports,
            timeout: self.timeout,
            pause_on_oep: self.pause_on_oep,
            output,
        })
    }
}
